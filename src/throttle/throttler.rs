//! Admission policy: attempt quotas with an escalating timeout penalty.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::identity::{Id, Kind};
use super::timeout::Timeout;
use super::tracker::RateLimitTracker;
use crate::error::{GatekeeperError, Result};
use crate::store::{StoreClient, Ttl};

/// Quota and penalty settings for one throttler.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlerConfig {
    /// Namespace prefix for every key this throttler writes
    pub key_type: String,
    /// Attempts allowed within the window; one more triggers a timeout
    pub attempt_limit: i64,
    /// TTL of the attempt counter, refreshed on every attempt
    pub attempt_window: Duration,
    /// Timeout applied on a first breach
    pub base_timeout: Duration,
    /// Ceiling for escalated timeouts; also the TTL of timeout records
    pub max_timeout: Duration,
    /// Multiplier applied to the previous timeout on a repeated breach
    pub timeout_scale_factor: f64,
}

impl ThrottlerConfig {
    /// Check the configuration for values the throttler cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> {
            Err(GatekeeperError::Config(format!("{}: {msg}", self.key_type)))
        };

        if self.key_type.is_empty() {
            return Err(GatekeeperError::Config("key_type must not be empty".to_string()));
        }
        if self.attempt_limit < 0 {
            return fail(format!("attempt_limit must be >= 0, got {}", self.attempt_limit));
        }
        if self.attempt_window.is_zero() {
            return fail("attempt_window must be non-zero".to_string());
        }
        if self.base_timeout > self.max_timeout {
            return fail(format!(
                "base_timeout {:?} exceeds max_timeout {:?}",
                self.base_timeout, self.max_timeout
            ));
        }
        if !self.timeout_scale_factor.is_finite() || self.timeout_scale_factor <= 0.0 {
            return fail(format!(
                "timeout_scale_factor must be finite and positive, got {}",
                self.timeout_scale_factor
            ));
        }
        Ok(())
    }
}

/// Rate limit state for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Details {
    pub limit: i64,
    pub remaining: i64,
    /// Unix seconds at which the governing record expires, or 0
    pub reset_unix: i64,
}

impl Details {
    /// Header name/value pairs.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_unix.to_string()),
        ]
    }
}

/// Decides whether an operation is allowed for a set of identities.
///
/// Identities passed together are checked with OR semantics: if any one of
/// them is over quota or timed out, the request is throttled.
#[derive(Debug, Clone)]
pub struct Throttler {
    tracker: RateLimitTracker,
    config: ThrottlerConfig,
}

impl Throttler {
    /// Create a throttler over `store`. Fails if the configuration is invalid.
    pub fn new(store: StoreClient, config: ThrottlerConfig) -> Result<Self> {
        config.validate()?;

        let tracker = RateLimitTracker::new(
            store,
            config.key_type.clone(),
            config.attempt_window,
            config.max_timeout,
        );

        Ok(Self { tracker, config })
    }

    /// The throttler configuration.
    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    /// The tracker backing this throttler.
    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    /// Whether any of `ids` is inside an active timeout.
    ///
    /// Stops at the first timed-out identity.
    pub async fn timed_out(&self, ids: &[Id]) -> Result<bool> {
        for id in ids {
            let timeout = self
                .tracker
                .last_timeout(id)
                .await
                .map_err(|e| GatekeeperError::throttle("TimedOut", e))?;

            if timeout.is_active_at(Utc::now()) {
                trace!(id = %id, ends = %timeout.end_time(), "Identity timed out");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Count an attempt for each identity with a non-empty key.
    ///
    /// The first identity whose count exceeds the limit has its counter
    /// cleared and a new, possibly escalated, timeout recorded; the call
    /// then returns `true` without touching the remaining identities.
    pub async fn try_attempt(&self, ids: &[Id]) -> Result<bool> {
        let wrap = |e| GatekeeperError::throttle("TryAttempt", e);

        for id in ids {
            if id.key.is_empty() {
                continue;
            }

            let attempts = self.tracker.incr_attempts(id).await.map_err(wrap)?;
            if attempts <= self.config.attempt_limit {
                continue;
            }

            self.tracker.reset_attempts(id).await.map_err(wrap)?;

            let last = self.tracker.last_timeout(id).await.map_err(wrap)?;
            let duration = self.next_timeout(&last);
            let timeout = Timeout::new(Utc::now(), duration);
            self.tracker
                .set_timeout(id, &timeout)
                .await
                .map_err(wrap)?;

            info!(
                key_type = %self.config.key_type,
                id = %id,
                attempts = attempts,
                timeout = ?duration,
                "Attempt limit exceeded, timeout applied"
            );
            return Ok(true);
        }

        Ok(false)
    }

    /// Check timeouts, then count an attempt.
    ///
    /// An identity inside an active timeout is throttled without consuming
    /// attempt budget.
    pub async fn incr(&self, ids: &[Id]) -> Result<bool> {
        if self.timed_out(ids).await? {
            debug!(key_type = %self.config.key_type, "Throttled by active timeout");
            return Ok(true);
        }

        let throttled = self.try_attempt(ids).await?;
        if !throttled {
            trace!(key_type = %self.config.key_type, "Attempt allowed");
        }
        Ok(throttled)
    }

    /// Clear the attempt counter and timeout of every identity.
    pub async fn reset(&self, ids: &[Id]) -> Result<()> {
        let wrap = |e| GatekeeperError::throttle("Reset", e);

        for id in ids {
            self.tracker.reset_attempts(id).await.map_err(wrap)?;
            self.tracker.reset_timeout(id).await.map_err(wrap)?;
        }

        debug!(key_type = %self.config.key_type, count = ids.len(), "Reset identities");
        Ok(())
    }

    /// Limit, remaining attempts and reset time for the first identity only.
    ///
    /// While that identity is timed out the reset time is the end of its
    /// timeout record; otherwise it is the expiry of its attempt counter.
    pub async fn details(&self, ids: &[Id]) -> Result<Details> {
        let limit = self.config.attempt_limit;
        let Some(id) = ids.first() else {
            return Ok(Details {
                limit,
                remaining: limit,
                reset_unix: 0,
            });
        };

        let wrap = |e| GatekeeperError::throttle("Details", e);

        let kind = if self.timed_out(std::slice::from_ref(id)).await? {
            Kind::Timeout
        } else {
            Kind::Attempts
        };

        let reset_unix = match self.tracker.expires_at(id, kind).await.map_err(wrap)? {
            Ttl::Expires(ttl) => {
                let ttl = chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::zero());
                (Utc::now() + ttl).timestamp()
            }
            Ttl::Missing | Ttl::Persistent => 0,
        };

        let attempts = self.tracker.get_attempts(id).await.map_err(wrap)?;

        Ok(Details {
            limit,
            remaining: (limit - attempts).max(0),
            reset_unix,
        })
    }

    /// Penalty for the next breach given the last recorded timeout.
    fn next_timeout(&self, last: &Timeout) -> Duration {
        if last.is_empty() {
            return self.config.base_timeout;
        }

        let scaled = last.duration.as_secs_f64() * self.config.timeout_scale_factor;
        if scaled >= self.config.max_timeout.as_secs_f64() {
            self.config.max_timeout
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}
