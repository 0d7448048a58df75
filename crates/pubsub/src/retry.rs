use std::future::Future;
use std::time::Duration;

use tracing::{error, info};

use crate::config::BackoffConfig;
use crate::error::Error;
use crate::shutdown::ShutdownSignal;

/// Exponentially growing, randomized delays without an elapsed-time limit.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
}

impl ExponentialBackoff {
    pub(crate) const fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            config,
        }
    }

    pub(crate) fn next_backoff(&mut self) -> Duration {
        let delay = randomize(
            self.current,
            self.config.randomization_factor,
            fastrand::f64(),
        );

        self.current =
            Duration::try_from_secs_f64(self.current.as_secs_f64() * self.config.multiplier)
                .map_or(self.config.max_interval, |next| {
                    next.min(self.config.max_interval)
                });

        delay
    }
}

// Picks a delay in [interval * (1 - factor), interval * (1 + factor)].
// Falls back to the interval itself when the result does not fit a Duration.
fn randomize(interval: Duration, factor: f64, random: f64) -> Duration {
    let secs = interval.as_secs_f64();
    let delta = factor * secs;
    let min = secs - delta;
    let max = secs + delta;

    Duration::try_from_secs_f64(random.mul_add(max - min, min)).unwrap_or(interval)
}

/// Runs `attempt` until it succeeds, backing off between failures.
///
/// Retries forever while the subscriber is open. Once shutdown has been
/// triggered, the last failure is returned instead of being retried, including
/// when shutdown fires during a backoff sleep.
pub(crate) async fn retry_until_shutdown<F, Fut>(
    backoff: BackoffConfig,
    shutdown: &ShutdownSignal,
    mut attempt: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let mut backoff = ExponentialBackoff::new(backoff);

    loop {
        let Err(error) = attempt().await else {
            info!("Receiving messages finished with no error");
            return Ok(());
        };

        if shutdown.is_closed() {
            info!(%error, "Receiving messages failed while closed");
            return Err(error);
        }

        let delay = backoff.next_backoff();
        error!(%error, ?delay, "Receiving messages failed, retrying");

        tokio::select! {
            biased;
            () = shutdown.token().cancelled() => {
                info!(%error, "Subscriber closed while waiting to retry");
                return Err(error);
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use tracing_test::traced_test;

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            multiplier: 2.0,
            randomization_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_until_capped() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(500),
            multiplier: 2.0,
            randomization_factor: 0.0,
        });

        let delays: Vec<_> = (0..5).map(|_| backoff.next_backoff()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn test_randomized_delay_stays_within_bounds() {
        let interval = Duration::from_millis(1000);

        assert_eq!(randomize(interval, 0.5, 0.0), Duration::from_millis(500));
        assert_eq!(randomize(interval, 0.5, 1.0), Duration::from_millis(1500));

        for _ in 0..100 {
            let delay = randomize(interval, 0.5, fastrand::f64());
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_huge_multiplier_is_capped() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 1e20,
            randomization_factor: 0.0,
        });

        let delays: Vec<_> = (0..4).map(|_| backoff.next_backoff()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(60),
                Duration::from_secs(60),
                Duration::from_secs(60),
            ]
        );
    }

    #[test]
    fn test_backoff_near_duration_max_does_not_overflow() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::MAX,
            multiplier: 1e20,
            randomization_factor: 1.0,
        });

        for _ in 0..4 {
            backoff.next_backoff();
        }
        assert_eq!(backoff.current, Duration::MAX);

        assert_eq!(randomize(Duration::MAX, 1.0, 1.0), Duration::MAX);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_retries_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let shutdown = ShutdownSignal::new();

        let result = retry_until_shutdown(fast_backoff(), &shutdown, || {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::Receive {
                        subscription: "orders".to_string(),
                        source: "unavailable".into(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(logs_contain("Receiving messages failed, retrying"));
        assert!(logs_contain("Receiving messages finished with no error"));
    }

    #[tokio::test]
    async fn test_failure_after_shutdown_is_permanent() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let result = retry_until_shutdown(fast_backoff(), &shutdown, || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Receive {
                    subscription: "orders".to_string(),
                    source: "connection reset".into(),
                })
            }
        })
        .await;

        assert_matches!(result, Err(Error::Receive { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff_sleep() {
        let shutdown = Arc::new(ShutdownSignal::new());
        let slow = BackoffConfig {
            initial_interval: Duration::from_secs(3600),
            max_interval: Duration::from_secs(3600),
            multiplier: 1.0,
            randomization_factor: 0.0,
        };

        let supervisor = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                retry_until_shutdown(slow, &shutdown, || async {
                    Err(Error::Receive {
                        subscription: "orders".to_string(),
                        source: "unavailable".into(),
                    })
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .unwrap()
            .unwrap();

        assert_matches!(result, Err(Error::Receive { .. }));
    }
}
