// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded waits for asynchronous state changes on remote systems.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

/// The interval between predicate evaluations when a caller doesn't pick one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WaitError<E: std::error::Error + 'static> {
    #[error("timeout: waited {timeout:?} for {description}")]
    Timeout { description: String, timeout: Duration },

    #[error("error while waiting for {description}")]
    Check {
        description: String,
        #[source]
        source: E,
    },
}

/// A backoff policy that retries at a fixed interval until a deadline, never
/// sleeping past the deadline.
#[derive(Debug)]
struct Deadline {
    interval: Duration,
    timeout: Duration,
    started: Instant,
}

impl Deadline {
    fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout, started: Instant::now() }
    }
}

impl backoff::backoff::Backoff for Deadline {
    fn reset(&mut self) {
        self.started = Instant::now();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let remaining = self.timeout.checked_sub(self.started.elapsed())?;
        if remaining.is_zero() {
            return None;
        }

        Some(self.interval.min(remaining))
    }
}

/// Blocks callers until a condition holds or a fixed amount of time passes.
#[derive(Clone, Copy, Debug)]
pub struct Poller {
    timeout: Duration,
}

impl Poller {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Evaluates `predicate` once per [`DEFAULT_POLL_INTERVAL`] until it
    /// returns `true`. See [`Poller::wait_for_every`].
    pub fn wait_for<E, F>(
        &self,
        description: &str,
        predicate: F,
    ) -> Result<(), WaitError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Result<bool, E>,
    {
        self.wait_for_every(description, DEFAULT_POLL_INTERVAL, predicate)
    }

    /// Evaluates `predicate` until it returns `true`, sleeping for `interval`
    /// (or whatever is left of the timeout, if that's shorter) between
    /// attempts.
    ///
    /// The predicate is always evaluated at least once. If it returns an
    /// error, the wait ends immediately and the error is passed back to the
    /// caller.
    pub fn wait_for_every<E, F>(
        &self,
        description: &str,
        interval: Duration,
        mut predicate: F,
    ) -> Result<(), WaitError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Result<bool, E>,
    {
        info!(timeout = ?self.timeout, description, "waiting");

        let check = || match predicate() {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(description, "condition not met yet");
                Err(backoff::Error::transient(None))
            }
            Err(e) => Err(backoff::Error::Permanent(Some(e))),
        };

        backoff::retry(Deadline::new(interval, self.timeout), check).map_err(
            |e| match e {
                backoff::Error::Permanent(Some(source)) => WaitError::Check {
                    description: description.to_owned(),
                    source,
                },
                _ => WaitError::Timeout {
                    description: description.to_owned(),
                    timeout: self.timeout,
                },
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("probe failed")]
    struct ProbeError;

    #[test]
    fn returns_once_predicate_holds() {
        let poller = Poller::new(Duration::from_secs(5));
        let mut calls = 0;
        poller
            .wait_for_every("third call", Duration::from_millis(10), || {
                calls += 1;
                Ok::<_, ProbeError>(calls == 3)
            })
            .unwrap();
        assert_eq!(calls, 3);
    }

    #[test]
    fn times_out_after_configured_duration() {
        let timeout = Duration::from_millis(300);
        let poller = Poller::new(timeout);
        let start = Instant::now();
        let err = poller
            .wait_for_every("never", Duration::from_millis(50), || {
                Ok::<_, ProbeError>(false)
            })
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, WaitError::Timeout { .. }));
        assert!(err.to_string().contains("never"));
        assert!(elapsed >= timeout, "gave up early after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "overran: {elapsed:?}");
    }

    #[test]
    fn never_sleeps_past_the_deadline() {
        let timeout = Duration::from_millis(200);
        let poller = Poller::new(timeout);
        let start = Instant::now();
        let _ = poller.wait_for_every("never", Duration::from_secs(30), || {
            Ok::<_, ProbeError>(false)
        });
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn predicate_errors_propagate() {
        let poller = Poller::new(Duration::from_secs(5));
        let mut calls = 0;
        let err = poller
            .wait_for_every("failing probe", Duration::from_millis(10), || {
                calls += 1;
                Err(ProbeError)
            })
            .unwrap_err();
        assert!(matches!(err, WaitError::Check { source: ProbeError, .. }));
        assert_eq!(calls, 1);
    }
}
