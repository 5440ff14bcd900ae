//! Provider call retries and rate limiting
//!
//! Only a failure before the first chunk is retried. Once anything has
//! streamed, tools may already have run, so a later failure ends the turn.

use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use strand_ai::{ApiHandler, ApiStream, Message};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::TaskConfig,
    error::{Error, Result},
    handle::TaskHandle,
    messenger::Messenger,
    ui::{AskKind, SayKind},
};

/// Upper bound on any single backoff wait
pub const MAX_RETRY_DELAY_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry without asking the user
    pub auto_retry: bool,
    pub base_delay_secs: u64,
    /// Minimum interval between provider calls
    pub rate_limit_secs: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            auto_retry: config.always_approve_resubmit,
            base_delay_secs: config.request_delay_seconds,
            rate_limit_secs: config.rate_limit_seconds,
        }
    }

    /// Seconds to wait before retry number `retry + 1`.
    ///
    /// `base * 2^retry`, replaced by the provider's retry-after (plus one
    /// second) when it sent one, never below the rate limit floor.
    pub fn backoff_delay(&self, retry: u32, error: &strand_ai::Error) -> u64 {
        let factor = 2f64.powi(retry.min(63) as i32);
        let exponential = (self.base_delay_secs as f64 * factor).ceil() as u64;
        let delay = match error.retry_after() {
            Some(secs) => secs.saturating_add(1),
            None => exponential,
        };
        delay.max(self.rate_limit_secs).min(MAX_RETRY_DELAY_SECS)
    }
}

/// Time of the last provider call, shared by every task in the process
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whole seconds still to wait before the next call is allowed
    pub fn remaining_secs(&self, rate_limit_secs: u64) -> u64 {
        let Some(last) = *self.last_request.lock() else {
            return 0;
        };
        let elapsed = last.elapsed().as_secs_f64();
        (rate_limit_secs as f64 - elapsed).max(0.0).ceil() as u64
    }

    pub fn mark_request(&self) {
        *self.last_request.lock() = Some(Instant::now());
    }
}

/// Wraps one provider call for a task
pub struct RetryController<'a> {
    pub api: &'a dyn ApiHandler,
    pub messenger: &'a Messenger,
    pub handle: &'a TaskHandle,
    pub limiter: &'a RateLimiter,
    pub policy: RetryPolicy,
}

impl RetryController<'_> {
    /// Open a stream whose first chunk has already arrived.
    ///
    /// A failed first chunk is retried with backoff when auto-retry is on
    /// and the error is transient. Otherwise the user decides, and a
    /// confirmed retry starts the count over. Returns
    /// [`Error::ApiRequestFailed`] when the user gives up.
    pub async fn attempt(&self, system_prompt: &str, history: &[Message]) -> Result<ApiStream> {
        let mut retry: u32 = 0;
        loop {
            if retry == 0 {
                let wait = self.limiter.remaining_secs(self.policy.rate_limit_secs);
                self.countdown(
                    SayKind::RateLimit,
                    wait,
                    |i| format!("Rate limiting for {i} seconds..."),
                    "Rate limit wait finished.",
                )
                .await?;
            }

            self.limiter.mark_request();
            let token = self.handle.cancel_token();
            let first = tokio::select! {
                _ = token.cancelled() => return Err(Error::Aborted),
                first = self.open_stream(system_prompt, history) => first,
            };

            let error = match first {
                Ok(stream) => return Ok(stream),
                Err(error) => error,
            };
            if self.handle.is_aborted() {
                return Err(Error::Aborted);
            }

            if self.policy.auto_retry && error.is_retryable() {
                let delay = self.policy.backoff_delay(retry, &error);
                warn!(
                    task_id = self.handle.task_id(),
                    retry, delay, "First chunk failed, retrying: {}", error
                );
                let attempt = retry + 1;
                self.countdown(
                    SayKind::ApiReqRetryDelayed,
                    delay,
                    |i| format!("{error}\n\nRetry attempt {attempt}\nRetrying in {i} seconds..."),
                    "Retrying now...",
                )
                .await?;
                retry = attempt;
            } else {
                warn!(task_id = self.handle.task_id(), "First chunk failed: {}", error);
                let response = self
                    .messenger
                    .ask(AskKind::ApiReqFailed, error.to_string(), false)
                    .await?;
                if !response.is_yes() {
                    return Err(Error::ApiRequestFailed(error.to_string()));
                }
                self.messenger.say(SayKind::ApiReqRetried, "").await?;
                retry = 0;
            }
        }
    }

    /// Call the provider and wait for the first chunk, putting it back in
    /// front of the rest of the stream.
    async fn open_stream(
        &self,
        system_prompt: &str,
        history: &[Message],
    ) -> strand_ai::Result<ApiStream> {
        let mut stream = self.api.create_message(system_prompt, history).await?;
        match stream.next().await {
            Some(Ok(chunk)) => {
                debug!(task_id = self.handle.task_id(), "First chunk received");
                let head = futures::stream::once(futures::future::ready(Ok(chunk)));
                Ok(Box::pin(head.chain(stream)))
            }
            Some(Err(e)) => Err(e),
            None => Ok(Box::pin(futures::stream::empty())),
        }
    }

    async fn countdown(
        &self,
        kind: SayKind,
        secs: u64,
        text: impl Fn(u64) -> String,
        done: &str,
    ) -> Result<()> {
        if secs == 0 {
            return Ok(());
        }
        let token = self.handle.cancel_token();
        for i in (1..=secs).rev() {
            self.messenger.say_partial(kind, text(i)).await?;
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Aborted),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        self.messenger.say(kind, done).await
    }
}
