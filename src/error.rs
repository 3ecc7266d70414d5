use std::path::PathBuf;

/// Failures with a meaning of their own. They are raised where they happen and
/// travel inside `anyhow::Error`; callers classify them with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Expected HTML structure is missing. The site layout probably changed.
    #[error("parse error at {url}: {message}")]
    Parse { url: String, message: String },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("image not found on page {url}")]
    ImageNotFound { url: String },

    /// A chapter believed complete does not match its completion marker.
    #[error("consistency error in {}: {message}", dir.display())]
    Consistency { dir: PathBuf, message: String },

    #[error("conversion error for {}: {message}", path.display())]
    Conversion { path: PathBuf, message: String },
}

impl Error {
    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Errors that must stop the whole run rather than one chapter.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Consistency { .. })
    }
}

/// Finds a typed error anywhere in an `anyhow` chain.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}
