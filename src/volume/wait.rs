//! Bounded wait for an attached volume to appear as a host block device.
//!
//! A backend can confirm an attachment before the kernel has enumerated the
//! device. [`AttachWait::wait_for_device`] polls the device mapping at a fixed
//! interval and races the poll loop against an absolute timeout; whichever
//! finishes first decides the outcome and the other future is dropped before
//! the call returns.

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::{Config, DEFAULT_ATTACH_POLL_INTERVAL_MS, DEFAULT_ATTACH_TIMEOUT_MS};
use crate::error::{Result, VolplaneError};
use crate::types::BlockDevice;

/// Poll interval and timeout for the attach wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttachWait {
    /// Delay between mapping queries.
    pub poll_interval: Duration,
    /// Upper bound on the whole wait.
    pub timeout: Duration,
}

impl Default for AttachWait {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_ATTACH_POLL_INTERVAL_MS),
            Duration::from_millis(DEFAULT_ATTACH_TIMEOUT_MS),
        )
    }
}

impl AttachWait {
    /// Creates a wait with explicit bounds.
    #[must_use]
    pub const fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    /// Reads the bounds from `config`.
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self::new(config.attach_poll_interval(), config.attach_timeout())
    }

    /// Polls `poll` until it reports a mapping for `volume_id` with a device
    /// name, or until the timeout elapses.
    ///
    /// The first poll runs immediately. The loop never retries the attach
    /// itself.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::AttachTimeout`] when the timeout wins, or the
    /// first error reported by `poll`.
    pub async fn wait_for_device<F, Fut>(&self, volume_id: &str, mut poll: F) -> Result<BlockDevice>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<BlockDevice>>>,
    {
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poll_loop = async {
            loop {
                ticker.tick().await;
                let devices = poll().await?;
                if let Some(found) = devices
                    .into_iter()
                    .find(|device| device.volume_id == volume_id && !device.device_name.is_empty())
                {
                    break Ok::<_, VolplaneError>(found);
                }
            }
        };

        tokio::select! {
            biased;
            () = time::sleep(self.timeout) => {
                warn!(volume_id, timeout = ?self.timeout, "attached device did not appear in time");
                Err(VolplaneError::AttachTimeout {
                    volume_id: volume_id.to_owned(),
                    timeout: self.timeout,
                })
            }
            outcome = poll_loop => {
                if let Ok(device) = &outcome {
                    debug!(volume_id, device = %device.device_name, "attached device appeared");
                }
                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Fields};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn mapping(volume_id: &str, device_name: &str) -> BlockDevice {
        BlockDevice {
            volume_id: volume_id.to_owned(),
            device_name: device_name.to_owned(),
            ..BlockDevice::default()
        }
    }

    /// Poll source that reports the device once `appears_after` has elapsed.
    fn delayed_source(
        appears_after: Duration,
        polls: Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::future::Ready<Result<Vec<BlockDevice>>> {
        let start = Instant::now();
        move || {
            polls.fetch_add(1, Ordering::SeqCst);
            let device = if start.elapsed() >= appears_after {
                "/dev/xvdf"
            } else {
                ""
            };
            std::future::ready(Ok(vec![mapping("vol-other", "/dev/xvdz"), mapping("vol-1", device)]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_device_when_it_appears_before_timeout() {
        let polls = Arc::new(AtomicUsize::new(0));
        let wait = AttachWait::default();
        let started = Instant::now();

        let device = wait
            .wait_for_device("vol-1", delayed_source(Duration::from_millis(250), Arc::clone(&polls)))
            .await
            .unwrap_or_else(|err| panic!("device should appear: {err}"));

        assert_eq!(device.device_name, "/dev/xvdf");
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_stops_polling() {
        let polls = Arc::new(AtomicUsize::new(0));
        let wait = AttachWait::new(Duration::from_millis(100), Duration::from_secs(1));

        let err = wait
            .wait_for_device("vol-1", delayed_source(Duration::from_secs(5), Arc::clone(&polls)))
            .await
            .expect_err("device appears too late");
        assert_eq!(err.kind(), ErrorKind::AttachTimeout);

        let observed = polls.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(polls.load(Ordering::SeqCst), observed);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_error_wins_over_timeout() {
        let wait = AttachWait::default();
        let err = wait
            .wait_for_device("vol-1", || {
                std::future::ready(Err(VolplaneError::backend(
                    "mapping unavailable",
                    Fields::new(),
                )))
            })
            .await
            .expect_err("poll error should surface");
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[tokio::test(start_paused = true)]
    async fn device_exactly_at_timeout_counts_as_timeout() {
        let polls = Arc::new(AtomicUsize::new(0));
        let wait = AttachWait::new(Duration::from_millis(100), Duration::from_secs(1));
        let err = wait
            .wait_for_device("vol-1", delayed_source(Duration::from_secs(1), polls))
            .await
            .expect_err("deadline reached");
        assert!(matches!(err, VolplaneError::AttachTimeout { ref volume_id, .. } if volume_id == "vol-1"));
    }
}
