use std::fmt;
use std::future::Future;
use std::str::FromStr;

use futures::future::{join_all, try_join_all};
use tokio::sync::Semaphore;

/// How a batch of independent async jobs is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// One job at a time, in input order.
    Sequential,
    /// Every job at once.
    Concurrent,
    /// At most `n` jobs in flight.
    Bounded(usize),
}

impl ConcurrencyPolicy {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.as_str() {
            "sequential" | "serial" => Ok(Self::Sequential),
            "concurrent" | "all" => Ok(Self::Concurrent),
            other => {
                let digits = other.strip_prefix("bounded:").unwrap_or(other);
                let n = digits.parse::<usize>().map_err(|_| {
                    anyhow::anyhow!(
                        "unsupported concurrency policy: {other:?} \
                         (expected sequential, concurrent, bounded:<n> or <n>)"
                    )
                })?;
                Ok(Self::bounded(n))
            }
        }
    }

    /// `bounded(1)` is sequential; `bounded(0)` is treated as 1.
    pub fn bounded(n: usize) -> Self {
        match n {
            0 | 1 => Self::Sequential,
            n => Self::Bounded(n),
        }
    }

    /// Runs every job to completion. Results come back in input order
    /// regardless of completion order.
    pub async fn run_all<T, R, F, Fut>(self, items: impl IntoIterator<Item = T>, f: F) -> Vec<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        match self {
            Self::Sequential => {
                let mut out = Vec::new();
                for item in items {
                    out.push(f(item).await);
                }
                out
            }
            Self::Concurrent => join_all(items.into_iter().map(&f)).await,
            Self::Bounded(n) => {
                let semaphore = Semaphore::new(n.max(1));
                let semaphore = &semaphore;
                let f = &f;
                join_all(items.into_iter().map(|item| async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .expect("pool semaphore is closed");
                    f(item).await
                }))
                .await
            }
        }
    }

    /// Like [`run_all`](Self::run_all) but stops at the first error. Jobs still
    /// in flight when an error arrives are dropped.
    pub async fn try_run_all<T, R, E, F, Fut>(
        self,
        items: impl IntoIterator<Item = T>,
        f: F,
    ) -> Result<Vec<R>, E>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        match self {
            Self::Sequential => {
                let mut out = Vec::new();
                for item in items {
                    out.push(f(item).await?);
                }
                Ok(out)
            }
            Self::Concurrent => try_join_all(items.into_iter().map(&f)).await,
            Self::Bounded(n) => {
                let semaphore = Semaphore::new(n.max(1));
                let semaphore = &semaphore;
                let f = &f;
                try_join_all(items.into_iter().map(|item| async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .expect("pool semaphore is closed");
                    f(item).await
                }))
                .await
            }
        }
    }
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Concurrent => f.write_str("concurrent"),
            Self::Bounded(n) => write!(f, "bounded:{n}"),
        }
    }
}

impl FromStr for ConcurrencyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
