use std::time::Duration;

use crate::pool::ConcurrencyPolicy;

pub const DEFAULT_SITE_URL: &str = "https://www.dragonball-multiverse.com/cn/chapters.html";

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            initial_retry_delay: Duration::from_millis(500),
            user_agent: format!("comicsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// One concurrency policy per fan-out point of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicies {
    /// Page-list resolution across chapters.
    pub page_lists: ConcurrencyPolicy,
    /// Image downloads within one chapter.
    pub images: ConcurrencyPolicy,
    /// Chapter downloads across chapters.
    pub chapters: ConcurrencyPolicy,
    /// PDF conversion across chapters.
    pub pdfs: ConcurrencyPolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            page_lists: ConcurrencyPolicy::Bounded(8),
            images: ConcurrencyPolicy::Bounded(8),
            chapters: ConcurrencyPolicy::Sequential,
            pdfs: ConcurrencyPolicy::Sequential,
        }
    }
}
