use super::*;
use crate::request::{
    DirectFileOutput, EncodedFileOutput, EncodedFileType, StreamOutput, StreamProtocol,
    TrackRequest, WebRequest,
};
use crate::request::{RoomCompositeRequest, TrackOutput};

fn base() -> BaseConfig {
    BaseConfig {
        handler_id: "EGH_test".to_string(),
        tmp_dir: std::env::temp_dir(),
        template_base: "https://recorder.example.com".to_string(),
        ws_url: "wss://rtc.example.com".to_string(),
        api_key: String::new(),
        api_secret: String::new(),
        local_output_dir: std::env::temp_dir(),
        info_url: String::new(),
    }
}

fn room_composite_request(req: RoomCompositeRequest) -> StartEgressRequest {
    StartEgressRequest {
        egress_id: "EG_test".to_string(),
        room_id: "RM_test".to_string(),
        token: "token".to_string(),
        ws_url: String::new(),
        request: EgressRequest::RoomComposite(req),
    }
}

fn file_output(file_type: EncodedFileType, filepath: &str) -> EncodedFileOutput {
    EncodedFileOutput {
        file_type,
        filepath: filepath.to_string(),
        ..EncodedFileOutput::default()
    }
}

#[test]
fn test_empty_egress_id_rejected() {
    let mut req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        file_outputs: vec![file_output(EncodedFileType::Mp4, "out.mp4")],
        ..RoomCompositeRequest::default()
    });
    req.egress_id = String::new();

    let err = PipelineConfig::from_request(base(), &req).unwrap_err();
    assert!(matches!(err, EgressError::InvalidInput(f) if f == "egress_id"));
}

#[test]
fn test_audio_only_and_video_only_rejected() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        audio_only: true,
        video_only: true,
        file_outputs: vec![file_output(EncodedFileType::Mp4, "out.mp4")],
        ..RoomCompositeRequest::default()
    });
    let err = PipelineConfig::from_request(base(), &req).unwrap_err();
    assert!(err.is_user_error());
}

#[test]
fn test_room_name_required() {
    let req = room_composite_request(RoomCompositeRequest {
        file_outputs: vec![file_output(EncodedFileType::Mp4, "out.mp4")],
        ..RoomCompositeRequest::default()
    });
    let err = PipelineConfig::from_request(base(), &req).unwrap_err();
    assert!(matches!(err, EgressError::InvalidInput(f) if f == "room_name"));
}

#[test]
fn test_token_or_api_keys_required() {
    let mut req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        file_outputs: vec![file_output(EncodedFileType::Mp4, "out.mp4")],
        ..RoomCompositeRequest::default()
    });
    req.token = String::new();

    let err = PipelineConfig::from_request(base(), &req).unwrap_err();
    assert!(matches!(err, EgressError::InvalidInput(f) if f == "token or api key/secret"));
}

#[test]
fn test_at_least_one_output_required() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        ..RoomCompositeRequest::default()
    });
    let err = PipelineConfig::from_request(base(), &req).unwrap_err();
    assert!(matches!(err, EgressError::InvalidInput(f) if f == "output"));
}

#[test]
fn test_web_request_needs_no_connection_info() {
    let req = StartEgressRequest {
        egress_id: "EG_test".to_string(),
        room_id: String::new(),
        token: String::new(),
        ws_url: String::new(),
        request: EgressRequest::Web(WebRequest {
            url: "https://example.com/live".to_string(),
            file_outputs: vec![file_output(EncodedFileType::Mp4, "out.mp4")],
            ..WebRequest::default()
        }),
    };
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    assert_eq!(p.source.source_type, SourceType::Web);
    assert!(p.audio.enabled && p.video.enabled);
}

#[test]
fn test_filename_templating() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        file_outputs: vec![file_output(EncodedFileType::Mp4, "r_{room_name}.mp4")],
        ..RoomCompositeRequest::default()
    });
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    let f = p.file_config().unwrap();
    assert_eq!(f.storage_filepath, "r_demo.mp4");
    assert_eq!(f.local_filepath, PathBuf::from("r_demo.mp4"));
}

#[test]
fn test_filepath_ending_in_slash_generates_filename() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/", dir.path().to_string_lossy());
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        file_outputs: vec![file_output(EncodedFileType::Mp4, &prefix)],
        ..RoomCompositeRequest::default()
    });
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    let f = p.file_config().unwrap();
    assert!(f.storage_filepath.starts_with(&prefix));
    assert!(f.storage_filepath.ends_with(".mp4"));
    let name = f.storage_filepath.strip_prefix(&prefix).unwrap();
    assert!(name.starts_with("demo-"));
}

#[test]
fn test_wrong_extension_is_replaced() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        file_outputs: vec![file_output(EncodedFileType::Mp4, "recording.webm")],
        ..RoomCompositeRequest::default()
    });
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    assert_eq!(p.file_config().unwrap().storage_filepath, "recording.mp4");
}

#[test]
fn test_unrecognized_extension_is_kept_and_appended() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        file_outputs: vec![file_output(EncodedFileType::Mp4, "recording.backup")],
        ..RoomCompositeRequest::default()
    });
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    assert_eq!(
        p.file_config().unwrap().storage_filepath,
        "recording.backup.mp4"
    );
}

#[test]
fn test_unknown_file_type_resolves_from_codecs() {
    // audio-only default file type resolves to ogg via opus
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        audio_only: true,
        file_outputs: vec![file_output(EncodedFileType::DefaultFiletype, "audio")],
        ..RoomCompositeRequest::default()
    });
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    let f = p.file_config().unwrap();
    assert_eq!(f.output_type, OutputType::Ogg);
    assert_eq!(f.storage_filepath, "audio.ogg");
    assert_eq!(p.audio.codec, Some(AudioCodec::Opus));
}

#[test]
fn test_pinned_codec_incompatibility_names_output_and_codec() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        audio_only: true,
        file_outputs: vec![file_output(EncodedFileType::Ogg, "audio.ogg")],
        options: Some(EncodingOptions::Advanced(AdvancedEncodingOptions {
            audio_codec: Some(AudioCodec::Aac),
            ..AdvancedEncodingOptions::default()
        })),
        ..RoomCompositeRequest::default()
    });
    let err = PipelineConfig::from_request(base(), &req).unwrap_err();
    match err {
        EgressError::Incompatible { output, codec } => {
            assert_eq!(output, OutputType::Ogg);
            assert_eq!(codec, "aac");
        }
        other => panic!("expected Incompatible, got {other}"),
    }
}

#[test]
fn test_stream_output_pins_rtmp_codecs() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        stream_outputs: vec![StreamOutput {
            protocol: StreamProtocol::Rtmp,
            urls: vec!["rtmp://live.example.com/app/key".to_string()],
        }],
        ..RoomCompositeRequest::default()
    });
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    assert_eq!(p.audio.codec, Some(AudioCodec::Aac));
    assert_eq!(p.video.codec, Some(VideoCodec::H264));
    assert_eq!(p.video.key_frame_interval, 4.0);

    // the echoed stream info carries the redacted url
    assert_eq!(p.info.streams.len(), 1);
    assert_eq!(p.info.streams[0].url, "rtmp://live.example.com/app/{redacted}");
}

#[test]
fn test_invalid_stream_url_rejected() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        stream_outputs: vec![StreamOutput {
            protocol: StreamProtocol::Rtmp,
            urls: vec!["rtmp://live.example.com/missing-app".to_string()],
        }],
        ..RoomCompositeRequest::default()
    });
    let err = PipelineConfig::from_request(base(), &req).unwrap_err();
    assert!(matches!(err, EgressError::InvalidUrl { .. }));
}

#[test]
fn test_track_requires_track_id() {
    let req = StartEgressRequest {
        egress_id: "EG_test".to_string(),
        room_id: String::new(),
        token: "token".to_string(),
        ws_url: String::new(),
        request: EgressRequest::Track(TrackRequest {
            room_name: "demo".to_string(),
            track_id: String::new(),
            output: TrackOutput::File(DirectFileOutput::default()),
        }),
    };
    let err = PipelineConfig::from_request(base(), &req).unwrap_err();
    assert!(matches!(err, EgressError::InvalidInput(f) if f == "track_id"));
}

#[test]
fn test_track_codecs_resolved_after_join() {
    let req = StartEgressRequest {
        egress_id: "EG_test".to_string(),
        room_id: String::new(),
        token: "token".to_string(),
        ws_url: String::new(),
        request: EgressRequest::Track(TrackRequest {
            room_name: "demo".to_string(),
            track_id: "TR_audio".to_string(),
            output: TrackOutput::File(DirectFileOutput {
                filepath: "track-audio".to_string(),
                ..DirectFileOutput::default()
            }),
        }),
    };
    let mut p = PipelineConfig::from_request(base(), &req).unwrap();
    // output type undecided until the SDK reports the track codec
    assert_eq!(p.file_config().unwrap().output_type, OutputType::UnknownFile);

    p.apply_track_join(&[TrackJoin {
        track_id: "TR_audio".to_string(),
        track_source: "microphone".to_string(),
        track_type: "audio".to_string(),
        audio_codec: Some(AudioCodec::Opus),
        video_codec: None,
    }])
    .unwrap();

    let f = p.file_config().unwrap();
    assert_eq!(f.output_type, OutputType::Ogg);
    assert!(f.storage_filepath.ends_with(".ogg"));
    assert_eq!(p.audio.codec, Some(AudioCodec::Opus));
    assert_eq!(p.source.sdk.track_source, "microphone");
    assert_eq!(p.source.sdk.track_type, "audio");
}

#[test]
fn test_track_tokens_applied_after_join() {
    let req = StartEgressRequest {
        egress_id: "EG_test".to_string(),
        room_id: String::new(),
        token: "token".to_string(),
        ws_url: String::new(),
        request: EgressRequest::Track(TrackRequest {
            room_name: "demo".to_string(),
            track_id: "TR_x".to_string(),
            output: TrackOutput::File(DirectFileOutput {
                filepath: "{track_id}-{track_type}".to_string(),
                ..DirectFileOutput::default()
            }),
        }),
    };
    let mut p = PipelineConfig::from_request(base(), &req).unwrap();

    p.apply_track_join(&[TrackJoin {
        track_id: "TR_x".to_string(),
        track_source: "microphone".to_string(),
        track_type: "audio".to_string(),
        audio_codec: Some(AudioCodec::Opus),
        video_codec: None,
    }])
    .unwrap();

    let f = p.file_config().unwrap();
    assert_eq!(f.storage_filepath, "TR_x-audio.ogg");
}

#[test]
fn test_track_join_without_requested_track_rejected() {
    let req = StartEgressRequest {
        egress_id: "EG_test".to_string(),
        room_id: String::new(),
        token: "token".to_string(),
        ws_url: String::new(),
        request: EgressRequest::Track(TrackRequest {
            room_name: "demo".to_string(),
            track_id: "TR_audio".to_string(),
            output: TrackOutput::File(DirectFileOutput::default()),
        }),
    };
    let mut p = PipelineConfig::from_request(base(), &req).unwrap();

    let err = p
        .apply_track_join(&[TrackJoin {
            track_id: "TR_other".to_string(),
            track_type: "audio".to_string(),
            audio_codec: Some(AudioCodec::Opus),
            ..TrackJoin::default()
        }])
        .unwrap_err();
    assert!(err.is_user_error());
}

#[test]
fn test_track_websocket_output() {
    let req = StartEgressRequest {
        egress_id: "EG_test".to_string(),
        room_id: String::new(),
        token: "token".to_string(),
        ws_url: String::new(),
        request: EgressRequest::Track(TrackRequest {
            room_name: "demo".to_string(),
            track_id: "TR_audio".to_string(),
            output: TrackOutput::WebsocketUrl("ws://collector:9090/audio".to_string()),
        }),
    };
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    assert_eq!(p.audio.codec, Some(AudioCodec::RawAudio));
    assert!(matches!(
        p.outputs.get(&EgressType::Websocket),
        Some(OutputConfig::Websocket(_))
    ));
}

#[test]
fn test_segment_output_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let playlist = format!("{}/live/{{room_name}}.m3u8", dir.path().to_string_lossy());
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        segment_outputs: vec![crate::request::SegmentedFileOutput {
            playlist_name: playlist,
            ..crate::request::SegmentedFileOutput::default()
        }],
        ..RoomCompositeRequest::default()
    });
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    let s = p.segment_output().unwrap();
    assert_eq!(s.playlist_filename, "demo.m3u8");
    assert_eq!(s.segment_prefix, "demo");
    assert_eq!(s.segment_duration, 6);
    // keyframe cadence follows the segment length
    assert_eq!(p.video.key_frame_interval, 6.0);
    assert_eq!(
        p.info.segments.as_ref().unwrap().playlist_name,
        format!("{}/live/demo.m3u8", dir.path().to_string_lossy())
    );
}

#[test]
fn test_preset_applies_dimensions() {
    let req = room_composite_request(RoomCompositeRequest {
        room_name: "demo".to_string(),
        file_outputs: vec![file_output(EncodedFileType::Mp4, "out.mp4")],
        options: Some(EncodingOptions::Preset(EncodingOptionsPreset::H264720p30)),
        ..RoomCompositeRequest::default()
    });
    let p = PipelineConfig::from_request(base(), &req).unwrap();
    assert_eq!((p.video.width, p.video.height), (1280, 720));
    assert_eq!(p.video.framerate, 30);
    assert_eq!(p.video.bitrate, 3000);
}
