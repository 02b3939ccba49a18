//! Two-phase steps backed by an external job service.
//!
//! The first invocation creates a job and records its handle as the step's
//! output; every later invocation only polls. Which phase runs depends on
//! nothing but that recorded output, so re-invoking never creates a second job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use strata_core::config::JobsConfig;
use strata_core::error::{Result, StrataError};
use strata_core::traits::{JobClient, StepExecutor};
use strata_core::types::{JobHandle, JobRequest, JobState, JobStatus, StepContext, StepOutcome};
use strata_core::workflow::StepConfig;

/// Executor for `external_job` steps.
pub struct ExternalJobStep {
    client: Arc<dyn JobClient>,
}

impl ExternalJobStep {
    pub fn new(client: Arc<dyn JobClient>) -> Self {
        Self { client }
    }

    async fn submit(
        &self,
        step: &StepConfig,
        input: Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutcome> {
        let job_type = step.param_str("job_type").ok_or_else(|| {
            StrataError::Validation(format!(
                "step '{}' is missing parameter 'job_type'",
                step.step_id
            ))
        })?;
        let mut payload = step
            .parameters
            .get("payload")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        payload.extend(input);
        let callback_topic = step
            .param_str("callback_topic")
            .map(String::from)
            .unwrap_or_else(|| format!("{}.{}", ctx.execution_id, ctx.step_id));

        let handle = self
            .client
            .create_job(JobRequest {
                job_type: job_type.to_string(),
                payload: Value::Object(payload),
                callback_topic: callback_topic.clone(),
            })
            .await?;

        info!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step_id,
            job_id = %handle.job_id,
            "External job submitted"
        );
        Ok(StepOutcome::in_progress(json!({
            "job_id": handle.job_id,
            "callback_token": handle.callback_token,
            "callback_topic": callback_topic,
            "status": "submitted",
            "submitted_at": Utc::now().to_rfc3339(),
        })))
    }

    async fn poll(&self, job_id: &str, prior: Value, ctx: &StepContext) -> Result<StepOutcome> {
        let status = self.client.job_status(job_id.to_string()).await?;
        debug!(step_id = %ctx.step_id, job_id, state = ?status.status, "Polled external job");
        match status.status {
            JobState::Pending | JobState::Running => {
                let mut waiting = prior;
                waiting["status"] = json!(match status.status {
                    JobState::Pending => "pending",
                    _ => "running",
                });
                waiting["last_polled_at"] = json!(Utc::now().to_rfc3339());
                Ok(StepOutcome::in_progress(waiting))
            }
            JobState::Succeeded => Ok(StepOutcome::completed(json!({
                "job_id": job_id,
                "status": "succeeded",
                "result": status.result.unwrap_or(Value::Null),
            }))),
            JobState::Failed => Ok(StepOutcome::failed(
                status
                    .error_message
                    .unwrap_or_else(|| format!("external job {} failed", job_id)),
            )),
        }
    }
}

impl StepExecutor for ExternalJobStep {
    fn execute(
        &self,
        step: StepConfig,
        input: Map<String, Value>,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let job_id = ctx
                .prior_output
                .as_ref()
                .and_then(|p| p.get("job_id"))
                .and_then(|v| v.as_str())
                .map(String::from);
            match (job_id, ctx.prior_output.clone()) {
                (Some(job_id), Some(prior)) => self.poll(&job_id, prior, &ctx).await,
                _ => self.submit(&step, input, &ctx).await,
            }
        })
    }
}

/// Job client speaking JSON over HTTP.
///
/// `POST {base}/jobs` creates a job; `GET {base}/jobs/{id}` reports status.
pub struct HttpJobClient {
    client: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
}

impl HttpJobClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| StrataError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
        })
    }

    pub fn from_config(config: &JobsConfig) -> Result<Self> {
        Self::new(&config.base_url, config.timeout_secs)
    }

    fn send_error(&self, operation: &str, e: reqwest::Error) -> StrataError {
        if e.is_timeout() {
            StrataError::Timeout {
                operation: operation.to_string(),
                timeout_secs: self.timeout_secs,
            }
        } else {
            StrataError::Connection(format!("{}: {}", operation, e))
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        resp: reqwest::Response,
    ) -> Result<T> {
        let status = resp.status().as_u16();
        if let Some(err) = classify_status(status, operation) {
            return Err(err);
        }
        resp.json::<T>()
            .await
            .map_err(|e| StrataError::NonRetryable(format!("{}: bad response body: {}", operation, e)))
    }
}

/// Map a non-success HTTP status to the retry taxonomy.
pub fn classify_status(status: u16, operation: &str) -> Option<StrataError> {
    match status {
        200..=299 => None,
        408 | 429 | 500..=599 => Some(StrataError::Retryable(format!(
            "{}: HTTP {}",
            operation, status
        ))),
        _ => Some(StrataError::NonRetryable(format!(
            "{}: HTTP {}",
            operation, status
        ))),
    }
}

impl JobClient for HttpJobClient {
    fn create_job(&self, request: JobRequest) -> BoxFuture<'_, Result<JobHandle>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(format!("{}/jobs", self.base_url))
                .json(&request)
                .send()
                .await
                .map_err(|e| self.send_error("create job", e))?;
            self.read_json("create job", resp).await
        })
    }

    fn job_status(&self, job_id: String) -> BoxFuture<'_, Result<JobStatus>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(format!("{}/jobs/{}", self.base_url, job_id))
                .send()
                .await
                .map_err(|e| self.send_error("job status", e))?;
            self.read_json("job status", resp).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use strata_core::types::{ExecutionId, OutcomeStatus};
    use strata_core::workflow::StepKind;

    /// Scripted job service recording every call.
    #[derive(Default)]
    struct Scripted {
        created: Mutex<Vec<JobRequest>>,
        polled: Mutex<Vec<String>>,
        next_state: Mutex<Option<JobStatus>>,
    }

    impl JobClient for Scripted {
        fn create_job(&self, request: JobRequest) -> BoxFuture<'_, Result<JobHandle>> {
            self.created.lock().unwrap().push(request);
            Box::pin(async {
                Ok(JobHandle {
                    job_id: "job-1".into(),
                    callback_token: Some("tok".into()),
                })
            })
        }

        fn job_status(&self, job_id: String) -> BoxFuture<'_, Result<JobStatus>> {
            self.polled.lock().unwrap().push(job_id.clone());
            let status = self.next_state.lock().unwrap().clone().unwrap_or(JobStatus {
                job_id,
                status: JobState::Running,
                result: None,
                error_message: None,
            });
            Box::pin(async move { Ok(status) })
        }
    }

    fn step() -> StepConfig {
        StepConfig::new("ingest", StepKind::ExternalJob)
            .with_parameter("job_type", json!("ingestion"))
            .with_parameter("payload", json!({"bucket": "docs"}))
    }

    fn ctx(prior: Option<Value>) -> StepContext {
        StepContext {
            execution_id: ExecutionId::from_string("exec-1"),
            workflow_id: "wf".into(),
            step_id: "ingest".into(),
            prior_output: prior,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn first_invocation_creates_job() {
        let client = Arc::new(Scripted::default());
        let exec = ExternalJobStep::new(client.clone());
        let mut input = Map::new();
        input.insert("file".into(), json!("a.pdf"));

        let out = exec.execute(step(), input, ctx(None)).await.unwrap();
        assert_eq!(out.status, OutcomeStatus::InProgress);
        assert!(!out.success);
        assert_eq!(out.output_data["job_id"], json!("job-1"));
        assert_eq!(out.output_data["callback_topic"], json!("exec-1.ingest"));

        let created = client.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].payload, json!({"bucket": "docs", "file": "a.pdf"}));
    }

    #[tokio::test]
    async fn recorded_output_never_recreates_job() {
        let client = Arc::new(Scripted::default());
        let exec = ExternalJobStep::new(client.clone());
        let prior = json!({"job_id": "job-1", "status": "submitted"});

        for _ in 0..2 {
            let out = exec
                .execute(step(), Map::new(), ctx(Some(prior.clone())))
                .await
                .unwrap();
            assert_eq!(out.status, OutcomeStatus::InProgress);
            assert_eq!(out.output_data["status"], json!("running"));
        }
        assert!(client.created.lock().unwrap().is_empty());
        assert_eq!(client.polled.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn succeeded_job_completes_with_result() {
        let client = Arc::new(Scripted::default());
        *client.next_state.lock().unwrap() = Some(JobStatus {
            job_id: "job-1".into(),
            status: JobState::Succeeded,
            result: Some(json!({"chunks": 12})),
            error_message: None,
        });
        let out = ExternalJobStep::new(client)
            .execute(step(), Map::new(), ctx(Some(json!({"job_id": "job-1"}))))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output_data["result"], json!({"chunks": 12}));
    }

    #[tokio::test]
    async fn failed_job_surfaces_message_verbatim() {
        let client = Arc::new(Scripted::default());
        *client.next_state.lock().unwrap() = Some(JobStatus {
            job_id: "job-1".into(),
            status: JobState::Failed,
            result: None,
            error_message: Some("parser crashed on page 3".into()),
        });
        let out = ExternalJobStep::new(client)
            .execute(step(), Map::new(), ctx(Some(json!({"job_id": "job-1"}))))
            .await
            .unwrap();
        assert_eq!(out.status, OutcomeStatus::Failed);
        assert_eq!(out.error.as_deref(), Some("parser crashed on page 3"));
    }

    #[test]
    fn http_status_classification() {
        assert!(classify_status(200, "op").is_none());
        assert!(matches!(classify_status(503, "op"), Some(StrataError::Retryable(_))));
        assert!(matches!(classify_status(429, "op"), Some(StrataError::Retryable(_))));
        assert!(matches!(classify_status(404, "op"), Some(StrataError::NonRetryable(_))));
    }

    #[test]
    fn http_client_trims_base_url() {
        let client = HttpJobClient::new("http://jobs.local/", 5).unwrap();
        assert_eq!(client.base_url, "http://jobs.local");
    }

    mod http {
        use super::*;
        use wiremock::matchers::{body_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn request() -> JobRequest {
            JobRequest {
                job_type: "ingestion".into(),
                payload: json!({"bucket": "docs"}),
                callback_topic: "exec-1.ingest".into(),
            }
        }

        #[tokio::test]
        async fn create_job_posts_request() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/jobs"))
                .and(body_json(json!({
                    "job_type": "ingestion",
                    "payload": {"bucket": "docs"},
                    "callback_topic": "exec-1.ingest",
                })))
                .respond_with(
                    ResponseTemplate::new(201)
                        .set_body_json(json!({"job_id": "j-9", "callback_token": "tok"})),
                )
                .expect(1)
                .mount(&server)
                .await;

            let client = HttpJobClient::new(&format!("{}/", server.uri()), 5).unwrap();
            let handle = client.create_job(request()).await.unwrap();
            assert_eq!(handle.job_id, "j-9");
            assert_eq!(handle.callback_token.as_deref(), Some("tok"));
        }

        #[tokio::test]
        async fn job_status_reads_state_and_result() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/jobs/j-9"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "job_id": "j-9",
                    "status": "SUCCEEDED",
                    "result": {"chunks": 4},
                })))
                .mount(&server)
                .await;

            let client = HttpJobClient::new(&server.uri(), 5).unwrap();
            let status = client.job_status("j-9".into()).await.unwrap();
            assert_eq!(status.status, JobState::Succeeded);
            assert_eq!(status.result, Some(json!({"chunks": 4})));
            assert!(status.error_message.is_none());
        }

        #[tokio::test]
        async fn unavailable_service_is_retryable() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/jobs"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;

            let client = HttpJobClient::new(&server.uri(), 5).unwrap();
            let err = client.create_job(request()).await.unwrap_err();
            assert!(matches!(err, StrataError::Retryable(_)), "{err:?}");
        }

        #[tokio::test]
        async fn unknown_job_is_not_retryable() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/jobs/missing"))
                .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
                .mount(&server)
                .await;

            let client = HttpJobClient::new(&server.uri(), 5).unwrap();
            let err = client.job_status("missing".into()).await.unwrap_err();
            assert!(matches!(err, StrataError::NonRetryable(_)), "{err:?}");
        }

        #[tokio::test]
        async fn malformed_body_is_rejected() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/jobs/j-9"))
                .respond_with(ResponseTemplate::new(200).set_body_string("{\"job_id\": 7"))
                .mount(&server)
                .await;

            let client = HttpJobClient::new(&server.uri(), 5).unwrap();
            let err = client.job_status("j-9".into()).await.unwrap_err();
            match err {
                StrataError::NonRetryable(msg) => assert!(msg.contains("bad response body")),
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn refused_connection_maps_to_connection_error() {
            let client = HttpJobClient::new("http://127.0.0.1:1", 5).unwrap();
            let err = client.job_status("j-9".into()).await.unwrap_err();
            assert!(matches!(err, StrataError::Connection(_)), "{err:?}");
        }

        #[tokio::test]
        async fn slow_service_maps_to_timeout() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/jobs/j-9"))
                .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
                .mount(&server)
                .await;

            let client = HttpJobClient::new(&server.uri(), 1).unwrap();
            let err = client.job_status("j-9".into()).await.unwrap_err();
            assert!(matches!(err, StrataError::Timeout { timeout_secs: 1, .. }), "{err:?}");
        }
    }
}
