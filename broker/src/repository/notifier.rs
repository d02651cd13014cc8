use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use model::view::hub::CancelNotice;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("Downstream answered the cancellation of {job} with {status}")]
    RequestStatus { job: String, status: StatusCode },
    #[error("Gave up notifying the cancellation of {0} after {1} attempts")]
    GaveUp(String, u32),
}

/// Tells the party executing a job that it was canceled.
#[async_trait]
pub trait CancellationNotifier: Debug + Sync + Send {
    async fn notify(&self, notice: &CancelNotice) -> Result<(), Error>;
}

#[derive(Debug)]
pub struct CancellationNotifierREST {
    base:             String,
    client:           reqwest::Client,
    max_retries:      u32,
    initial_interval: Duration,
}

impl CancellationNotifierREST {
    pub fn new(base: String, client: reqwest::Client, max_retries: u32) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            client,
            max_retries,
            initial_interval: Duration::from_millis(500),
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    async fn send(&self, notice: &CancelNotice) -> Result<(), Error> {
        let response = self
            .client
            .post(format!("{}/api/job/{}/cancel", self.base, notice.job_id))
            .json(notice)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RequestStatus {
                job: notice.job_id.to_string(),
                status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CancellationNotifier for CancellationNotifierREST {
    async fn notify(&self, notice: &CancelNotice) -> Result<(), Error> {
        let backoff = ExponentialBackoffBuilder::default()
            .with_initial_interval(self.initial_interval)
            .with_max_elapsed_time(None)
            .build();
        let attempts = AtomicU32::new(0);

        backoff::future::retry(backoff, || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.send(notice).await {
                Ok(()) => Ok(()),
                Err(Error::RequestStatus { status, .. })
                    if status.is_client_error() =>
                {
                    // The downstream will not change its mind
                    Err(backoff::Error::permanent(Error::RequestStatus {
                        job: notice.job_id.to_string(),
                        status,
                    }))
                }
                Err(err) if attempt >= self.max_retries => {
                    warn!(
                        "Last attempt to notify the cancellation of {} \
                         failed: {:?}",
                        notice.job_id, err
                    );
                    Err(backoff::Error::permanent(Error::GaveUp(
                        notice.job_id.to_string(),
                        attempt,
                    )))
                }
                Err(err) => {
                    trace!(
                        "Attempt {} to notify the cancellation of {} failed: \
                         {:?}",
                        attempt, notice.job_id, err
                    );
                    Err(backoff::Error::transient(err))
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{BidId, DeviceId, JobId, WorkerId};

    fn notice() -> CancelNotice {
        CancelNotice {
            job_id: JobId::generate(),
            bid_id: BidId::generate(),
            worker: WorkerId::generate(),
            device: DeviceId::generate(),
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        // Nothing listens on port 1
        let notifier = CancellationNotifierREST::new(
            "http://127.0.0.1:1/".to_string(),
            reqwest::Client::new(),
            3,
        )
        .with_initial_interval(Duration::from_millis(5));

        let err = notifier.notify(&notice()).await.unwrap_err();
        assert!(matches!(err, Error::GaveUp(_, 3)), "{:?}", err);
    }
}
