pub mod sdk;
pub mod web;

pub use sdk::{NullSdkClient, SdkClient, SdkSource};
pub use web::WebSource;

/// Frame producer feeding the pipeline's input elements. Both variants share
/// the same downstream contract: raw samples pushed into the graph.
pub enum Source {
    Web(WebSource),
    Sdk(SdkSource),
}

impl Source {
    pub fn sdk(&self) -> Option<&SdkSource> {
        match self {
            Source::Sdk(s) => Some(s),
            Source::Web(_) => None,
        }
    }
}
