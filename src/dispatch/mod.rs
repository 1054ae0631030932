//! Backend dispatch
//!
//! Submits a normalized [`JobRequest`] to an external compute service
//! and polls its status endpoint until a terminal state. Submission
//! and polling go through the [`JobBackend`] trait; the shipped
//! implementation is a plain HTTP client.
//!
//! Every dispatched job polls on its own task, so one processor can
//! keep many jobs in flight. The loop carries a bounded deadline and a
//! cancellation signal; a backend that never terminates fails the job
//! with [`DispatchError::PollTimeout`] instead of parking the task
//! forever.

use crate::domain::{JobRequest, JobResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors from backend dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("backend rejected job {0}")]
    Rejected(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("poll deadline exceeded for job {0}")]
    PollTimeout(String),

    #[error("job {0} cancelled")]
    Cancelled(String),

    #[error("poll task failed: {0}")]
    PollTask(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        DispatchError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Json(err.to_string())
    }
}

/// State reported by the backend status endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Running,
    Done(String),
    Error(String),
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollStatus::Done(_) | PollStatus::Error(_))
    }
}

/// An external compute service
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit a job; a negative acknowledgement is an error, not a retry
    async fn submit(&self, request: &JobRequest) -> Result<(), DispatchError>;

    /// Current status of a submitted job
    async fn status(&self, job_id: &str) -> Result<PollStatus, DispatchError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    success: bool,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP compute backend speaking the submit/status protocol
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl JobBackend for HttpBackend {
    async fn submit(&self, request: &JobRequest) -> Result<(), DispatchError> {
        let body = request.to_submission()?;
        let response: SubmitResponse = self
            .client
            .post(format!("{}/process", self.base_url))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if !response.success {
            return Err(DispatchError::Rejected(request.job_id.clone()));
        }
        Ok(())
    }

    async fn status(&self, job_id: &str) -> Result<PollStatus, DispatchError> {
        let response: StatusResponse = self
            .client
            .get(format!("{}/status/{}", self.base_url, job_id))
            .send()
            .await?
            .json()
            .await?;

        Ok(match response.status.as_str() {
            "done" => PollStatus::Done(response.result.unwrap_or_default()),
            "error" => PollStatus::Error(
                response.error.unwrap_or_else(|| "backend error".to_string()),
            ),
            "running" => PollStatus::Running,
            _ => PollStatus::Pending,
        })
    }
}

/// Handle to a dispatched job's poll task
pub struct JobHandle {
    job_id: String,
    cancel: watch::Sender<bool>,
    join: JoinHandle<Result<JobResult, DispatchError>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Stop the poll loop; `wait` then returns `Cancelled`
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Block until the job reaches a terminal state
    pub async fn wait(self) -> Result<JobResult, DispatchError> {
        self.join
            .await
            .map_err(|e| DispatchError::PollTask(e.to_string()))?
    }
}

/// Submits jobs and drives their poll loops
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn JobBackend>,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn JobBackend>, poll_interval: Duration, poll_deadline: Duration) -> Self {
        Self {
            backend,
            poll_interval,
            poll_deadline,
        }
    }

    /// Submit the job and start polling on its own task
    ///
    /// Returns once the backend has acknowledged the submission; a
    /// negative acknowledgement surfaces here and no polling starts.
    pub async fn dispatch(&self, request: &JobRequest) -> Result<JobHandle, DispatchError> {
        self.backend.submit(request).await?;
        tracing::info!(job_id = %request.job_id, "job submitted to backend");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let join = tokio::spawn(poll_until_terminal(
            self.backend.clone(),
            request.job_id.clone(),
            self.poll_interval,
            self.poll_deadline,
            cancel_rx,
        ));

        Ok(JobHandle {
            job_id: request.job_id.clone(),
            cancel: cancel_tx,
            join,
        })
    }
}

async fn poll_until_terminal(
    backend: Arc<dyn JobBackend>,
    job_id: String,
    interval: Duration,
    deadline: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<JobResult, DispatchError> {
    let deadline_at = tokio::time::Instant::now() + deadline;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::time::sleep_until(deadline_at) => {
                tracing::warn!(%job_id, "poll deadline exceeded");
                return Err(DispatchError::PollTimeout(job_id));
            }
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    tracing::info!(%job_id, "poll cancelled");
                    return Err(DispatchError::Cancelled(job_id));
                }
                continue;
            }
        }

        match backend.status(&job_id).await? {
            PollStatus::Pending | PollStatus::Running => {
                tracing::debug!(%job_id, "job still running");
            }
            PollStatus::Done(content) => {
                tracing::info!(%job_id, "job finished");
                return Ok(JobResult::success(content));
            }
            PollStatus::Error(error) => {
                tracing::warn!(%job_id, %error, "job failed on backend");
                return Ok(JobResult::failure(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedBackend {
        accept: bool,
        statuses: Mutex<VecDeque<PollStatus>>,
        submits: AtomicUsize,
        polls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(accept: bool, statuses: Vec<PollStatus>) -> Arc<Self> {
            Arc::new(Self {
                accept,
                statuses: Mutex::new(statuses.into()),
                submits: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobBackend for ScriptedBackend {
        async fn submit(&self, request: &JobRequest) -> Result<(), DispatchError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                Ok(())
            } else {
                Err(DispatchError::Rejected(request.job_id.clone()))
            }
        }

        async fn status(&self, _job_id: &str) -> Result<PollStatus, DispatchError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().await;
            // the last scripted status repeats
            Ok(if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                statuses.front().cloned().unwrap_or(PollStatus::Pending)
            })
        }
    }

    fn request() -> JobRequest {
        JobRequest {
            job_id: "ev1_Painter".to_string(),
            route: "modules/test".to_string(),
            data: vec![],
            options: Default::default(),
        }
    }

    fn dispatcher(backend: Arc<ScriptedBackend>) -> Dispatcher {
        Dispatcher::new(backend, Duration::from_millis(5), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_rejected_submission_never_polls() {
        let backend = ScriptedBackend::new(false, vec![]);
        let result = dispatcher(backend.clone()).dispatch(&request()).await;

        assert!(matches!(result, Err(DispatchError::Rejected(_))));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 1);
        assert_eq!(backend.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_poll_until_done() {
        let backend = ScriptedBackend::new(
            true,
            vec![
                PollStatus::Pending,
                PollStatus::Running,
                PollStatus::Done("https://out/image.png".to_string()),
            ],
        );
        let handle = dispatcher(backend.clone()).dispatch(&request()).await.unwrap();
        let result = handle.wait().await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.content, "https://out/image.png");
        assert!(backend.polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_backend_error_status_is_job_failure() {
        let backend =
            ScriptedBackend::new(true, vec![PollStatus::Error("out of memory".to_string())]);
        let handle = dispatcher(backend).dispatch(&request()).await.unwrap();
        let result = handle.wait().await.unwrap();

        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("out of memory"));
    }

    #[tokio::test]
    async fn test_poll_deadline_bounds_stuck_backend() {
        let backend = ScriptedBackend::new(true, vec![PollStatus::Pending]);
        let dispatcher = Dispatcher::new(
            backend,
            Duration::from_millis(5),
            Duration::from_millis(30),
        );
        let handle = dispatcher.dispatch(&request()).await.unwrap();

        let result = handle.wait().await;
        assert!(matches!(result, Err(DispatchError::PollTimeout(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_poll_loop() {
        let backend = ScriptedBackend::new(true, vec![PollStatus::Pending]);
        let handle = dispatcher(backend).dispatch(&request()).await.unwrap();

        handle.cancel();
        let result = handle.wait().await;
        assert!(matches!(result, Err(DispatchError::Cancelled(_))));
    }
}
