use std::collections::HashMap;

use chrono::Utc;
use url::Url;

/// Wall clock in unix nanoseconds, the resolution used by status timestamps.
pub fn unix_nanos_now() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Literal replace-all of every `{token}` in the map.
pub fn string_replace(s: &str, replacements: &HashMap<String, String>) -> String {
    let mut out = s.to_string();
    for (template, value) in replacements {
        out = out.replace(template.as_str(), value);
    }
    out
}

/// Redact the stream key of an RTMP url. Returns `None` when the url is not
/// of the form `rtmp(s)://host(/path)/app/stream_key( live=1)`.
pub fn redact_stream_key(raw: &str) -> Option<String> {
    let (base, live) = match raw.strip_suffix(" live=1") {
        Some(stripped) => (stripped, true),
        None => (raw, false),
    };

    let parsed = Url::parse(base).ok()?;
    if parsed.scheme() != "rtmp" && parsed.scheme() != "rtmps" {
        return None;
    }
    let host = parsed.host_str()?;

    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }

    let mut redacted = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        redacted.push_str(&format!(":{port}"));
    }
    for segment in &segments[..segments.len() - 1] {
        redacted.push('/');
        redacted.push_str(segment);
    }
    redacted.push_str("/{redacted}");
    if live {
        redacted.push_str(" live=1");
    }
    Some(redacted)
}

/// Lexical path cleanup: collapse `.`/`..`/`//`, drop any leading `../`,
/// preserve a trailing slash. Empty means "no path supplied".
pub fn clean_filepath(filepath: &str) -> String {
    let has_ending_slash = filepath.ends_with('/');
    let mut cleaned = clean(filepath);
    while let Some(rest) = cleaned.strip_prefix("../") {
        cleaned = rest.to_string();
    }
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return String::new();
    }
    if has_ending_slash {
        cleaned.push('/');
    }
    cleaned
}

fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.last().map(|s| *s != "..").unwrap_or(false) {
                    stack.pop();
                } else if !absolute {
                    stack.push("..");
                }
            }
            p => stack.push(p),
        }
    }
    let joined = stack.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_replace_empty_is_identity() {
        let replacements = HashMap::new();
        assert_eq!(
            string_replace("r_{room_name}_{time}.mp4", &replacements),
            "r_{room_name}_{time}.mp4"
        );
    }

    #[test]
    fn test_string_replace_is_idempotent() {
        let mut replacements = HashMap::new();
        replacements.insert("{room_name}".to_string(), "demo".to_string());
        replacements.insert("{time}".to_string(), "2024-01-02T123456".to_string());

        let once = string_replace("r_{room_name}_{time}.mp4", &replacements);
        let twice = string_replace(&once, &replacements);
        assert_eq!(once, "r_demo_2024-01-02T123456.mp4");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_redact_stream_key() {
        assert_eq!(
            redact_stream_key("rtmp://live.example.com/x/my-secret-key").as_deref(),
            Some("rtmp://live.example.com/x/{redacted}")
        );
        assert_eq!(
            redact_stream_key("rtmps://a.rtmp.example.com/live2/key live=1").as_deref(),
            Some("rtmps://a.rtmp.example.com/live2/{redacted} live=1")
        );
        assert_eq!(
            redact_stream_key("rtmp://host:1935/path/app/key").as_deref(),
            Some("rtmp://host:1935/path/app/{redacted}")
        );

        // missing app or key
        assert_eq!(redact_stream_key("rtmp://host/onlykey"), None);
        // wrong scheme
        assert_eq!(redact_stream_key("https://host/app/key"), None);
        assert_eq!(redact_stream_key("not a url"), None);
    }

    #[test]
    fn test_clean_filepath() {
        assert_eq!(clean_filepath("a/b/../c"), "a/c");
        assert_eq!(clean_filepath("../../etc/passwd"), "etc/passwd");
        assert_eq!(clean_filepath("recordings/"), "recordings/");
        assert_eq!(clean_filepath("./"), "");
        assert_eq!(clean_filepath(""), "");
        assert_eq!(clean_filepath(".."), "");
        assert_eq!(clean_filepath("/abs/./path"), "/abs/path");
    }
}
