pub mod file;
pub mod playlist;
pub mod segment;
pub mod stream;
pub mod websocket;

pub use file::FileSink;
pub use segment::{SegmentNamer, SegmentSink};
pub use stream::{StreamBindings, StreamSink};
pub use websocket::WebsocketWriter;

/// One bound output of a running pipeline. Sinks never panic into the
/// controller; asynchronous failures go onto the pipeline failure channel.
pub enum SinkKind {
    File(FileSink),
    Stream(StreamSink),
    Segments(SegmentSink),
    Websocket(WebsocketWriter),
}
