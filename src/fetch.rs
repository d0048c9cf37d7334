use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{error, warn};

use crate::domain::ObjectId;
use crate::error::{CutoutError, FetchError};

/// One GET against a cutout service. Implementations are shared by every
/// download worker, so they must tolerate concurrent calls.
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for &T {
    fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        (**self).get(url, timeout)
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// reqwest client with one connection pool reused for every cutout.
#[derive(Clone)]
pub struct PooledHttpClient {
    client: Client,
}

impl PooledHttpClient {
    pub fn new(max_idle_per_host: usize) -> Result<Self, CutoutError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("zoo-cutouts/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CutoutError::CutoutClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|err| CutoutError::CutoutClient(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for PooledHttpClient {
    fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(classify_error)?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes().map_err(classify_error)?;
        Ok(bytes.to_vec())
    }
}

fn classify_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(err.to_string())
    } else if err.is_body() || err.is_decode() {
        FetchError::Body(err.to_string())
    } else {
        FetchError::Connection(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, not re-tries after the first one.
    pub max_retries: u32,
    /// Constant pause between attempts.
    pub delay: Duration,
    /// Per-attempt request timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Upper bound on the time one request can take, saturating at
    /// `Duration::MAX`.
    pub fn worst_case(&self) -> Duration {
        self.timeout
            .saturating_mul(self.max_retries)
            .saturating_add(self.delay.saturating_mul(self.max_retries.saturating_sub(1)))
    }
}

/// Outcome of fetching one object's cutout.
#[derive(Debug, Clone, PartialEq)]
pub struct CutoutResult {
    pub id: ObjectId,
    /// Position of the request in the submitted batch.
    pub index: usize,
    pub url: String,
    pub attempts: u32,
    pub outcome: Result<Vec<u8>, FetchError>,
}

impl CutoutResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct Attempted {
    pub attempts: u32,
    pub outcome: Result<Vec<u8>, FetchError>,
}

pub struct RetryingFetcher<T: HttpTransport, S: Sleeper = ThreadSleeper> {
    transport: T,
    sleeper: S,
    policy: RetryPolicy,
}

impl<T: HttpTransport> RetryingFetcher<T, ThreadSleeper> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self::with_sleeper(transport, ThreadSleeper, policy)
    }
}

impl<T: HttpTransport, S: Sleeper> RetryingFetcher<T, S> {
    pub fn with_sleeper(transport: T, sleeper: S, policy: RetryPolicy) -> Self {
        Self {
            transport,
            sleeper,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    pub fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetch_counted(url).outcome
    }

    /// Runs the retry loop to completion and reports how many attempts it took.
    pub fn fetch_counted(&self, url: &str) -> Attempted {
        let max_retries = self.policy.max_retries.max(1);
        let mut last = None;
        for attempt in 1..=max_retries {
            let reply = self
                .transport
                .get(url, self.policy.timeout)
                .and_then(|payload| {
                    if payload.is_empty() {
                        Err(FetchError::Body("empty response body".to_string()))
                    } else {
                        Ok(payload)
                    }
                });
            match reply {
                Ok(payload) => {
                    return Attempted {
                        attempts: attempt,
                        outcome: Ok(payload),
                    };
                }
                Err(err) => {
                    warn!(attempt, max_retries, url, reason = %err, "cutout attempt failed");
                    last = Some(err);
                }
            }
            if attempt < max_retries {
                self.sleeper.sleep(self.policy.delay);
            }
        }
        error!(max_retries, url, "permanent error, no cutout for this object");
        Attempted {
            attempts: max_retries,
            outcome: Err(FetchError::Exhausted {
                attempts: max_retries,
                last: Box::new(
                    last.unwrap_or(FetchError::Connection("no attempt made".to_string())),
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    struct Scripted {
        replies: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Vec<u8>, FetchError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }
    }

    impl HttpTransport for Scripted {
        fn get(&self, _url: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::Status { status: 503 }))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Duration>>);

    impl Sleeper for Recorder {
        fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    #[test]
    fn first_success_is_returned_without_sleeping() {
        let fetcher = RetryingFetcher::with_sleeper(
            Scripted::new(vec![Ok(b"jpeg".to_vec())]),
            Recorder::default(),
            RetryPolicy::default(),
        );
        let attempted = fetcher.fetch_counted("http://x");
        assert_eq!(attempted.attempts, 1);
        assert_eq!(attempted.outcome.unwrap(), b"jpeg".to_vec());
        assert!(fetcher.sleeper().0.lock().unwrap().is_empty());
    }

    #[test]
    fn single_attempt_policy_never_sleeps() {
        let policy = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        let fetcher =
            RetryingFetcher::with_sleeper(Scripted::new(vec![]), Recorder::default(), policy);
        let err = fetcher.fetch("http://x").unwrap_err();
        assert_matches!(err, FetchError::Exhausted { attempts: 1, .. });
        assert!(fetcher.sleeper().0.lock().unwrap().is_empty());
    }

    #[test]
    fn worst_case_latency() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.worst_case(), Duration::from_secs(5 * 30 + 4 * 2));

        let huge = RetryPolicy {
            max_retries: u32::MAX,
            delay: Duration::MAX,
            timeout: Duration::MAX,
        };
        assert_eq!(huge.worst_case(), Duration::MAX);
    }

    #[test]
    fn empty_body_is_retried() {
        let fetcher = RetryingFetcher::with_sleeper(
            Scripted::new(vec![Ok(Vec::new()), Ok(b"jpeg".to_vec())]),
            Recorder::default(),
            RetryPolicy::default(),
        );
        let attempted = fetcher.fetch_counted("http://x");
        assert_eq!(attempted.attempts, 2);
        assert_eq!(attempted.outcome.unwrap(), b"jpeg".to_vec());
        assert_eq!(fetcher.sleeper().0.lock().unwrap().len(), 1);
    }
}
