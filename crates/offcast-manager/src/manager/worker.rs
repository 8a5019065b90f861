//! Worker tasks: one per active fetch or removal.
//!
//! A worker owns nothing but its downloader. Its only synchronization with
//! the scheduler is the single completion message it posts on exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use offcast_core::download::DownloadError;
use offcast_core::ports::Downloader;

use super::scheduler::Message;

const MAX_RETRY_DELAY_MS: u64 = 5_000;

/// Spawn a worker task for one download.
///
/// `worker_id` ties the completion message back to the scheduler's active
/// entry so a stale completion can never be mistaken for a live one.
pub(crate) fn spawn(
    id: String,
    worker_id: u64,
    downloader: Arc<dyn Downloader>,
    is_remove: bool,
    min_retry_count: u32,
    cancel: CancellationToken,
    completions: mpsc::UnboundedSender<Message>,
) {
    tokio::spawn(async move {
        tracing::debug!(id = %id, remove = is_remove, "worker started");
        let error = if is_remove {
            downloader.remove().await.err()
        } else {
            fetch_with_retry(&downloader, min_retry_count, &cancel)
                .await
                .err()
        };
        // Exactly one completion per worker; None means success or cancel.
        let _ = completions.send(Message::WorkerStopped {
            id,
            worker_id,
            error,
        });
    });
}

/// Fetch with the retry policy.
///
/// The error count resets whenever bytes advance past the position of the
/// previous error; the fetch fails once the count exceeds `min_retry_count`.
/// Backoff grows linearly and is capped at five seconds. Cancellation is
/// honored both during an attempt and during the backoff sleep.
async fn fetch_with_retry(
    downloader: &Arc<dyn Downloader>,
    min_retry_count: u32,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let mut error_count: u32 = 0;
    let mut error_position: Option<u64> = None;
    loop {
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = downloader.download() => result,
        };
        let error = match attempt {
            Ok(()) => return Ok(()),
            Err(error) if error.is_cancelled() || cancel.is_cancelled() => return Ok(()),
            Err(error) => error,
        };
        let downloaded = downloader.downloaded_bytes();
        if error_position.is_none_or(|position| downloaded > position) {
            tracing::debug!(downloaded, "progress since last error, error count reset");
            error_position = Some(downloaded);
            error_count = 0;
        }
        error_count += 1;
        if error_count > min_retry_count {
            return Err(error);
        }
        tracing::debug!(retry = error_count, error = %error, "download error, retrying");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(retry_delay(error_count)) => {}
        }
    }
}

fn retry_delay(error_count: u32) -> Duration {
    Duration::from_millis((u64::from(error_count - 1) * 1_000).min(MAX_RETRY_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use offcast_core::download::DownloadResult;
    use offcast_core::ports::TransferCounters;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Step {
        progress_to: Option<u64>,
        result: DownloadResult<()>,
    }

    struct StepDownloader {
        counters: Arc<TransferCounters>,
        steps: Mutex<VecDeque<Step>>,
    }

    impl StepDownloader {
        fn new(steps: Vec<Step>) -> Arc<dyn Downloader> {
            Arc::new(Self {
                counters: Arc::new(TransferCounters::new()),
                steps: Mutex::new(steps.into()),
            })
        }
    }

    #[async_trait]
    impl Downloader for StepDownloader {
        async fn download(&self) -> DownloadResult<()> {
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("ran out of scripted steps");
            if let Some(bytes) = step.progress_to {
                self.counters.set_bytes_downloaded(bytes);
            }
            step.result
        }

        async fn remove(&self) -> DownloadResult<()> {
            Ok(())
        }

        fn cancel(&self) {}

        fn downloaded_bytes(&self) -> u64 {
            self.counters.bytes_downloaded()
        }

        fn counters(&self) -> Arc<TransferCounters> {
            Arc::clone(&self.counters)
        }
    }

    fn fail() -> Step {
        Step {
            progress_to: None,
            result: Err(DownloadError::network("scripted failure")),
        }
    }

    fn fail_at(bytes: u64) -> Step {
        Step {
            progress_to: Some(bytes),
            result: Err(DownloadError::network("scripted failure")),
        }
    }

    fn succeed() -> Step {
        Step {
            progress_to: None,
            result: Ok(()),
        }
    }

    #[test]
    fn retry_delay_is_linear_and_capped() {
        assert_eq!(retry_delay(1), Duration::from_millis(0));
        assert_eq!(retry_delay(2), Duration::from_millis(1_000));
        assert_eq!(retry_delay(6), Duration::from_millis(5_000));
        assert_eq!(retry_delay(100), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn progress_resets_the_error_count() {
        // Two errors would exceed min_retry_count = 1, but the byte progress
        // between them resets the count.
        let downloader = StepDownloader::new(vec![fail(), fail_at(1), succeed()]);
        let cancel = CancellationToken::new();
        fetch_with_retry(&downloader, 1, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn errors_without_progress_exhaust_retries() {
        let downloader = StepDownloader::new(vec![fail(), fail()]);
        let cancel = CancellationToken::new();
        let error = fetch_with_retry(&downloader, 1, &cancel).await.unwrap_err();
        assert!(error.is_recoverable());
    }

    #[tokio::test]
    async fn zero_retries_fail_on_first_error() {
        let downloader = StepDownloader::new(vec![fail()]);
        let cancel = CancellationToken::new();
        assert!(fetch_with_retry(&downloader, 0, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn cancellation_exits_without_error() {
        let downloader = StepDownloader::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        fetch_with_retry(&downloader, 5, &cancel).await.unwrap();
    }
}
