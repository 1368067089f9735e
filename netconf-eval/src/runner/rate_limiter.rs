//! Per-model throttling: one-minute sliding windows over requests and
//! tokens, plus a cap on in-flight calls

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    requests_per_minute: u32,
    tokens_per_minute: u32,
    max_concurrent: usize,
    in_flight: Arc<Semaphore>,
    last_requests: Mutex<VecDeque<Instant>>,
    token_usage: Mutex<VecDeque<(Instant, u32)>>,
}

impl RateLimiter {
    /// `requests_per_minute` of zero disables the window
    pub fn new(requests_per_minute: u32, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            requests_per_minute,
            tokens_per_minute: 0,
            max_concurrent,
            in_flight: Arc::new(Semaphore::new(max_concurrent)),
            last_requests: Mutex::new(VecDeque::new()),
            token_usage: Mutex::new(VecDeque::new()),
        }
    }

    /// No window and a generous concurrency cap; for in-process clients
    pub fn unlimited() -> Self {
        Self::new(0, Semaphore::MAX_PERMITS.min(1024))
    }

    /// Hold new calls while the last minute used `tokens_per_minute` or more;
    /// zero disables the cap
    pub fn with_token_limit(mut self, tokens_per_minute: u32) -> Self {
        self.tokens_per_minute = tokens_per_minute;
        self
    }

    pub fn tokens_per_minute(&self) -> u32 {
        self.tokens_per_minute
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Wait for a slot in the window and an in-flight permit
    ///
    /// The permit is held until the returned guard is dropped.
    pub async fn acquire(&self) -> RateLimitGuard {
        let permit = self.in_flight.clone().acquire_owned().await.ok();

        loop {
            if let Some(wait) = self.check_token_limit().await {
                tracing::debug!("Token budget spent, waiting {}ms", wait.as_millis());
                tokio::time::sleep(wait).await;
                continue;
            }
            if let Some(wait) = self.check_request_limit().await {
                tracing::debug!("Rate limit window full, waiting {}ms", wait.as_millis());
                tokio::time::sleep(wait).await;
                continue;
            }
            return RateLimitGuard { _permit: permit };
        }
    }

    /// Reserve a slot if the window has room, otherwise return the wait time
    async fn check_request_limit(&self) -> Option<Duration> {
        let mut last = self.last_requests.lock().await;
        let now = Instant::now();

        while let Some(&front) = last.front() {
            if now.duration_since(front) > WINDOW {
                last.pop_front();
            } else {
                break;
            }
        }

        if self.requests_per_minute > 0 && last.len() >= self.requests_per_minute as usize {
            if let Some(&oldest) = last.front() {
                let elapsed = now.duration_since(oldest);
                if elapsed < WINDOW {
                    return Some(WINDOW - elapsed + Duration::from_millis(10));
                }
            }
        }

        last.push_back(now);
        None
    }

    /// Time until enough tokens leave the window, if the budget is spent
    async fn check_token_limit(&self) -> Option<Duration> {
        if self.tokens_per_minute == 0 {
            return None;
        }
        let mut usage = self.token_usage.lock().await;
        prune_tokens(&mut usage);

        let mut used: u64 = usage.iter().map(|(_, t)| u64::from(*t)).sum();
        let budget = u64::from(self.tokens_per_minute);
        if used < budget {
            return None;
        }
        let now = Instant::now();
        for (time, tokens) in usage.iter() {
            used -= u64::from(*tokens);
            if used < budget {
                let elapsed = now.duration_since(*time);
                return Some(WINDOW.saturating_sub(elapsed) + Duration::from_millis(10));
            }
        }
        Some(WINDOW)
    }

    /// Record token usage of a completed call
    pub async fn record_tokens(&self, tokens: u32) {
        let mut usage = self.token_usage.lock().await;
        prune_tokens(&mut usage);
        usage.push_back((Instant::now(), tokens));
    }
}

fn prune_tokens(usage: &mut VecDeque<(Instant, u32)>) {
    let now = Instant::now();
    while let Some(&(time, _)) = usage.front() {
        if now.duration_since(time) > WINDOW {
            usage.pop_front();
        } else {
            break;
        }
    }
}

/// Guard returned when rate limit permission is acquired
pub struct RateLimitGuard {
    _permit: Option<OwnedSemaphorePermit>,
}
