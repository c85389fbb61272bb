//! Call-level mutual exclusion
//!
//! Wraps an async operation so that concurrent invocations of the same
//! call site run at most once at a time, either process-locally or
//! across processes via a distributed `Locker`. A caller that loses the
//! lock is skipped, not blocked: the wrapper returns `None`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::error::{OutboxError, Result};
use crate::lock::{Locker, MemoryLocker};

const DEFAULT_EXPIRE: Duration = Duration::from_secs(6 * 60 * 60);

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ReentrantOptions {
    /// When false the wrapper is a passthrough
    pub exclusive: bool,

    /// Lock key; the call site label when absent. Calls sharing a key
    /// share a lock.
    pub key: Option<String>,

    /// Lock TTL: bare seconds, `ms|s|m|h|d` suffix, or an ISO-8601
    /// duration (`PnDTnHnMnS` subset). Six hours when absent.
    pub expire: Option<String>,

    /// Use the distributed locker instead of the process-local one
    pub distributed: bool,
}

impl ReentrantOptions {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_expire(mut self, expire: impl Into<String>) -> Self {
        self.expire = Some(expire.into());
        self
    }

    pub fn distributed(mut self) -> Self {
        self.distributed = true;
        self
    }
}

/// Guarded call wrapper
pub struct ReentrantCall {
    distributed: Option<Arc<dyn Locker>>,
    local: MemoryLocker,
}

impl ReentrantCall {
    pub fn new(distributed: Option<Arc<dyn Locker>>) -> Self {
        Self {
            distributed,
            local: MemoryLocker::new(),
        }
    }

    /// Run `op` unless another holder has the call's lock
    ///
    /// Returns `Ok(None)` when the lock was lost, `Ok(Some(..))` on a
    /// completed run. The lock is always released afterwards, and `op`
    /// failures come back wrapped with the call site attached.
    pub async fn call<T, F, Fut>(
        &self,
        site: &str,
        options: &ReentrantOptions,
        op: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !options.exclusive {
            return Ok(Some(op().await?));
        }

        let key = options.key.as_deref().unwrap_or(site);
        let expire = match &options.expire {
            Some(text) => parse_expire(text)?,
            None => DEFAULT_EXPIRE,
        };
        let token = Uuid::new_v4().to_string();

        let locker: &dyn Locker = if options.distributed {
            match &self.distributed {
                Some(locker) => locker.as_ref(),
                None => {
                    return Err(OutboxError::Lock(format!(
                        "{site} requires a distributed locker but none is configured"
                    )))
                }
            }
        } else {
            &self.local
        };

        if !locker.acquire(key, &token, expire).await {
            debug!(site, key, "call skipped, lock held elsewhere");
            return Ok(None);
        }

        let outcome = op().await;
        locker.release(key, &token).await;

        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(OutboxError::GuardedCall {
                site: site.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Parse a lock TTL
///
/// Accepts bare seconds (`"90"`), a unit suffix (`"250ms"`, `"30s"`,
/// `"5m"`, `"2h"`, `"1d"`), or an ISO-8601 duration covering days,
/// hours, minutes, and seconds (`"PT30S"`, `"P1DT2H"`).
pub fn parse_expire(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return Err(OutboxError::Config("empty lock expiry".to_string()));
    }

    if text.chars().all(|c| c.is_ascii_digit()) {
        let secs: u64 = text
            .parse()
            .map_err(|_| OutboxError::Config(format!("bad lock expiry {text}")))?;
        return Ok(Duration::from_secs(secs));
    }

    if text.starts_with('P') || text.starts_with('p') {
        return parse_iso8601(text);
    }

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| OutboxError::Config(format!("bad lock expiry {text}")))?;
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| OutboxError::Config(format!("bad lock expiry {text}")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3_600)),
        "d" => Ok(Duration::from_secs(value * 86_400)),
        _ => Err(OutboxError::Config(format!("bad lock expiry unit {unit}"))),
    }
}

fn parse_iso8601(text: &str) -> Result<Duration> {
    let bad = || OutboxError::Config(format!("bad ISO-8601 duration {text}"));
    let mut secs: u64 = 0;
    let mut in_time = false;
    let mut digits = String::new();

    for c in text.chars().skip(1) {
        match c {
            '0'..='9' => digits.push(c),
            'T' | 't' => {
                if !digits.is_empty() {
                    return Err(bad());
                }
                in_time = true;
            }
            'D' | 'd' => {
                let value: u64 = digits.parse().map_err(|_| bad())?;
                secs += value * 86_400;
                digits.clear();
            }
            'H' | 'h' => {
                let value: u64 = digits.parse().map_err(|_| bad())?;
                if !in_time {
                    return Err(bad());
                }
                secs += value * 3_600;
                digits.clear();
            }
            'M' | 'm' => {
                let value: u64 = digits.parse().map_err(|_| bad())?;
                if !in_time {
                    return Err(bad());
                }
                secs += value * 60;
                digits.clear();
            }
            'S' | 's' => {
                let value: u64 = digits.parse().map_err(|_| bad())?;
                if !in_time {
                    return Err(bad());
                }
                secs += value;
                digits.clear();
            }
            _ => return Err(bad()),
        }
    }
    if !digits.is_empty() {
        return Err(bad());
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expire_forms() {
        assert_eq!(parse_expire("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_expire("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_expire("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_expire("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_expire("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_expire("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_expire("PT30S").unwrap(), Duration::from_secs(30));
        assert_eq!(
            parse_expire("P1DT2H3M4S").unwrap(),
            Duration::from_secs(86_400 + 7_200 + 180 + 4)
        );
        assert!(parse_expire("5w").is_err());
        assert!(parse_expire("P1H").is_err());
        assert!(parse_expire("").is_err());
    }

    #[tokio::test]
    async fn test_non_exclusive_passthrough() {
        let calls = ReentrantCall::new(None);
        let result = calls
            .call("sweep", &ReentrantOptions::default(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn test_exclusive_skips_concurrent_holder() {
        use std::sync::Arc as StdArc;
        use tokio::sync::Barrier;

        let calls = StdArc::new(ReentrantCall::new(None));
        let barrier = StdArc::new(Barrier::new(2));

        let holder = {
            let calls = calls.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                calls
                    .call("sweep", &ReentrantOptions::exclusive(), || async {
                        barrier.wait().await;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(1)
                    })
                    .await
            })
        };

        barrier.wait().await;
        let skipped = calls
            .call("sweep", &ReentrantOptions::exclusive(), || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(skipped, None);

        assert_eq!(holder.await.unwrap().unwrap(), Some(1));

        // Lock released after the holder finished
        let again = calls
            .call("sweep", &ReentrantOptions::exclusive(), || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(again, Some(3));
    }

    #[tokio::test]
    async fn test_failure_releases_and_wraps() {
        let calls = ReentrantCall::new(None);
        let err = calls
            .call("sweep", &ReentrantOptions::exclusive(), || async {
                Err::<(), _>(OutboxError::Store("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::GuardedCall { .. }));

        let after = calls
            .call("sweep", &ReentrantOptions::exclusive(), || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(after, Some(1));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        use std::sync::Arc as StdArc;
        use tokio::sync::Barrier;

        let calls = StdArc::new(ReentrantCall::new(None));
        let barrier = StdArc::new(Barrier::new(2));

        let holder = {
            let calls = calls.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                calls
                    .call("site", &ReentrantOptions::exclusive().with_key("a"), || async {
                        barrier.wait().await;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(1)
                    })
                    .await
            })
        };

        barrier.wait().await;
        let other = calls
            .call("site", &ReentrantOptions::exclusive().with_key("b"), || async {
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(other, Some(2));
        assert_eq!(holder.await.unwrap().unwrap(), Some(1));
    }
}
