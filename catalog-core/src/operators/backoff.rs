//! Exponential-backoff polling for renditions a server has to generate
//! before they can be downloaded.
//!
//! The loop owns its retry budget: it sleeps before every poll, multiplies
//! the delay after each "not ready", and gives up with `Failed` once the
//! attempt ceiling is reached. A failed poll counts as "not ready" and uses
//! up an attempt; only cancellation ends the loop early.

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::BackoffConfig,
    error::{CatalogError, CatalogResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial: config.initial_delay,
            factor: config.factor.max(1),
            max_attempts: config.max_attempts,
        }
    }
}

impl Backoff {
    /// The sleep before each attempt: `initial`, `initial * factor`, ...
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let factor = self.factor;
        std::iter::successors(Some(self.initial), move |delay| Some(delay.saturating_mul(factor)))
            .take(self.max_attempts as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Poll until the resource is ready, sleeping on the backoff schedule
/// before every attempt. `poll` receives the 1-based attempt number.
pub async fn poll_until_ready<T, F, Fut>(
    backoff: &Backoff,
    what: &str,
    token: &CancellationToken,
    mut poll: F,
) -> CatalogResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CatalogResult<PollStatus<T>>>,
{
    let mut last_error: Option<CatalogError> = None;

    for (attempt, delay) in (1u32..).zip(backoff.delays()) {
        tokio::select! {
            biased;
            () = token.cancelled() => return Err(CatalogError::cancelled(what)),
            () = tokio::time::sleep(delay) => {}
        }

        let status = tokio::select! {
            biased;
            () = token.cancelled() => return Err(CatalogError::cancelled(what)),
            status = poll(attempt) => status,
        };

        match status {
            Ok(PollStatus::Ready(value)) => {
                debug!(
                    marker = "BACKOFF_POLL",
                    operation_type = "ready",
                    target_node = what,
                    attempt,
                    "Resource ready"
                );
                return Ok(value);
            }
            Ok(PollStatus::Pending) => {
                debug!(
                    marker = "BACKOFF_POLL",
                    operation_type = "pending",
                    target_node = what,
                    attempt,
                    waited_ms = delay.as_millis(),
                    "Resource not ready yet"
                );
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                debug!(
                    marker = "BACKOFF_POLL",
                    operation_type = "poll_failed",
                    target_node = what,
                    attempt,
                    error = %err,
                    "Poll failed, treating as not ready"
                );
                last_error = Some(err);
            }
        }
    }

    warn!(
        marker = "BACKOFF_POLL",
        operation_type = "gave_up",
        target_node = what,
        attempts = backoff.max_attempts,
        last_error = last_error.as_ref().map(tracing::field::display),
        "Resource never became ready"
    );
    Err(CatalogError::failed(match last_error {
        Some(err) => format!("{what} not ready after {} attempts: {err}", backoff.max_attempts),
        None => format!("{what} not ready after {} attempts", backoff.max_attempts),
    }))
}

/// Ask the server to generate something, then poll for it with `ticket`.
pub async fn generate_then_poll<G, T, Gen, F, Fut>(
    backoff: &Backoff,
    what: &str,
    token: &CancellationToken,
    generate: Gen,
    mut poll: F,
) -> CatalogResult<T>
where
    G: Clone,
    Gen: Future<Output = CatalogResult<G>>,
    F: FnMut(G, u32) -> Fut,
    Fut: Future<Output = CatalogResult<PollStatus<T>>>,
{
    let ticket = tokio::select! {
        biased;
        () = token.cancelled() => return Err(CatalogError::cancelled(what)),
        ticket = generate => ticket?,
    };

    poll_until_ready(backoff, what, token, |attempt| poll(ticket.clone(), attempt)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use tokio::time::Instant;

    #[test]
    fn delays_double_from_one_second() {
        let delays: Vec<u64> = Backoff::default().delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 32, 64, 128]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_eight_attempts() {
        let start = Instant::now();
        let mut polled_at = Vec::new();

        let result: CatalogResult<()> = poll_until_ready(
            &Backoff::default(),
            "rendition",
            &CancellationToken::new(),
            |_| {
                polled_at.push(start.elapsed().as_secs());
                async { Ok(PollStatus::Pending) }
            },
        )
        .await;

        assert!(matches!(result, Err(CatalogError::Failed(_))));
        assert_eq!(polled_at, [1, 3, 7, 15, 31, 63, 127, 255]);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_ready() {
        let polls = AtomicU32::new(0);

        let value = poll_until_ready(
            &Backoff::default(),
            "rendition",
            &CancellationToken::new(),
            |attempt| {
                polls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(if attempt == 3 {
                        PollStatus::Ready("https://cdn/full.jpg")
                    } else {
                        PollStatus::Pending
                    })
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "https://cdn/full.jpg");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_count_as_not_ready() {
        let polls = AtomicU32::new(0);

        let value = poll_until_ready(
            &Backoff::default(),
            "rendition",
            &CancellationToken::new(),
            |attempt| {
                polls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        Err(CatalogError::failed("HEAD 404: rendition not generated yet"))
                    } else {
                        Ok(PollStatus::Ready("https://cdn/full.jpg"))
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "https://cdn/full.jpg");
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_poll_errors_exhaust_the_budget() {
        let polls = AtomicU32::new(0);

        let result: CatalogResult<()> = poll_until_ready(
            &Backoff::default(),
            "rendition",
            &CancellationToken::new(),
            |_| {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Err(CatalogError::not_found("rendition")) }
            },
        )
        .await;

        let Err(CatalogError::Failed(reason)) = &result else {
            panic!("expected Failed, got {result:?}");
        };
        assert!(reason.contains("not ready after 8 attempts"));
        assert!(reason.contains("rendition"));
        assert_eq!(polls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_poll_is_not_retried() {
        let polls = AtomicU32::new(0);

        let result: CatalogResult<()> = poll_until_ready(
            &Backoff::default(),
            "rendition",
            &CancellationToken::new(),
            |_| {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Err(CatalogError::cancelled("rendition")) }
            },
        )
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let token = CancellationToken::new();
        let polls = Arc::new(AtomicU32::new(0));

        let task = {
            let token = token.clone();
            let polls = Arc::clone(&polls);
            tokio::spawn(async move {
                poll_until_ready::<(), _, _>(&Backoff::default(), "rendition", &token, |_| {
                    polls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(PollStatus::Pending) }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();

        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_with_the_generated_ticket() {
        let value = generate_then_poll(
            &Backoff::default(),
            "rendition",
            &CancellationToken::new(),
            async { Ok::<_, CatalogError>(String::from("job-7")) },
            |ticket, attempt| async move {
                Ok(if attempt == 2 {
                    PollStatus::Ready(format!("{ticket}:done"))
                } else {
                    PollStatus::Pending
                })
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "job-7:done");
    }
}
