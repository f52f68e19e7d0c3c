//! Bounded retry of probe calls.
//!
//! A poll runs until the call reports success or the attempt budget is spent,
//! and hands back the last observed value either way. Nothing is synthesized
//! after the last attempt.

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

use super::ProbeResult;

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same interval after every attempt
    #[default]
    Fixed,
    /// Interval doubles after every attempt, up to `max_interval`
    Exponential,
}

/// Attempt budget and pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            interval,
            backoff: Backoff::Fixed,
            max_interval: None,
        }
    }

    /// A single attempt, no waiting
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                let delay = self.interval.saturating_mul(factor);
                match self.max_interval {
                    Some(cap) => delay.min(cap),
                    None => delay,
                }
            }
        }
    }

    /// Upper bound of time spent sleeping over the whole budget
    pub fn total_wait(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|attempt| self.delay_after(attempt)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

/// Last value of a poll and how many attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Polled<T> {
    pub value: T,
    pub attempts: u32,
    pub done: bool,
}

/// Runs calls under a `RetryPolicy`
#[derive(Debug, Clone)]
pub struct RetryPoller {
    policy: RetryPolicy,
    deadline: Option<Instant>,
}

impl RetryPoller {
    pub fn new(policy: RetryPolicy) -> Self {
        RetryPoller { policy, deadline: None }
    }

    /// Give up retrying once the next attempt could not start before `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `attempt` (with its 1-based attempt number) until `is_done`
    /// accepts the value or the budget runs out. A budget of zero still
    /// makes one attempt.
    pub fn poll<T, F, D>(&self, mut attempt: F, is_done: D) -> Polled<T>
    where
        F: FnMut(u32) -> T,
        D: Fn(&T) -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut number = 1;
        loop {
            let value = attempt(number);
            let done = is_done(&value);
            if done || number >= max_attempts {
                return Polled {
                    value,
                    attempts: number,
                    done,
                };
            }

            let delay = self.policy.delay_after(number);
            // No retry that would start at or after the deadline
            if let Some(deadline) = self.deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || remaining <= delay {
                    log::debug!("Deadline reached after attempt {}/{}", number, max_attempts);
                    return Polled {
                        value,
                        attempts: number,
                        done,
                    };
                }
            }
            log::trace!("Attempt {}/{} failed, retrying in {:?}", number, max_attempts, delay);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            number += 1;
        }
    }

    /// Retry a probe until it succeeds; returns the last result
    pub fn with_retry<F>(&self, probe_call: F) -> ProbeResult
    where
        F: FnMut(u32) -> ProbeResult,
    {
        let polled = self.poll(probe_call, |result| result.success);
        if polled.attempts > 1 {
            log::debug!(
                "{} -> {} settled as {} after {} attempts",
                polled.value.source_node_id,
                polled.value.target_node_id,
                if polled.value.success { "reachable" } else { "unreachable" },
                polled.attempts
            );
        }
        polled.value
    }
}
