#![allow(clippy::missing_errors_doc)]

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use glucose_log_core::{build_advice_prompt, GlucoseRecord};
use serde_json::{json, Value};
use ulid::Ulid;

pub const DEFAULT_ADVICE_URL: &str = "http://localhost:3000/api/ai-advice";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const NO_DATA_MESSAGE: &str = "no glucose data to analyze";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AdviceFailure {
    #[error("advice service error: HTTP status {0}")]
    Status(u16),
    #[error("advice service error: {0}")]
    Service(String),
    #[error("could not reach the advice service: {0}")]
    Transport(String),
    #[error("advice service returned a malformed response")]
    Malformed,
    #[error("advice request stopped before a response arrived")]
    WorkerLost,
}

/// One request/response exchange with an advice service.
pub trait AdviceClient: Send + Sync {
    fn client_name(&self) -> &'static str;

    fn request_advice(&self, prompt: &str) -> Result<String, AdviceFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAdviceClient {
    url: String,
    timeout_ms: u64,
}

impl Default for HttpAdviceClient {
    fn default() -> Self {
        Self {
            url: DEFAULT_ADVICE_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl HttpAdviceClient {
    pub fn new(url: &str, timeout_ms: u64) -> Result<Self> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!("advice url MUST start with http:// or https://, got '{url}'"));
        }
        if timeout_ms == 0 {
            return Err(anyhow!("advice timeout MUST be >= 1 ms"));
        }

        Ok(Self {
            url: url.to_string(),
            timeout_ms,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AdviceClient for HttpAdviceClient {
    fn client_name(&self) -> &'static str {
        "http"
    }

    fn request_advice(&self, prompt: &str) -> Result<String, AdviceFailure> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();

        let response = agent
            .request("POST", &self.url)
            .set("content-type", "application/json")
            .send_json(json!({ "prompt": prompt }));

        match response {
            Ok(response) => {
                let body: Value = response
                    .into_json()
                    .map_err(|_| AdviceFailure::Malformed)?;
                parse_advice_body(&body)
            }
            Err(ureq::Error::Status(code, _)) => Err(AdviceFailure::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(AdviceFailure::Transport(err.to_string())),
        }
    }
}

/// Reads `{"result": ..}` or `{"error": ..}` from a successful response.
pub fn parse_advice_body(body: &Value) -> Result<String, AdviceFailure> {
    if let Some(error) = body.get("error") {
        let message = error
            .as_str()
            .map_or_else(|| error.to_string(), str::to_string);
        return Err(AdviceFailure::Service(message));
    }

    match body.get("result").and_then(Value::as_str) {
        Some(result) if !result.trim().is_empty() => Ok(result.to_string()),
        _ => Err(AdviceFailure::Malformed),
    }
}

/// Deterministic offline client. Replies with a fixed three-item list sized
/// to the prompt, or with a configured failure.
#[derive(Debug, Clone, Default)]
pub struct MockAdviceClient {
    failure: Option<AdviceFailure>,
}

impl MockAdviceClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing(failure: AdviceFailure) -> Self {
        Self {
            failure: Some(failure),
        }
    }
}

impl AdviceClient for MockAdviceClient {
    fn client_name(&self) -> &'static str {
        "mock"
    }

    fn request_advice(&self, prompt: &str) -> Result<String, AdviceFailure> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        let readings = prompt.lines().filter(|line| line.starts_with("Date ")).count();
        Ok(format!(
            "1. **Keep logging**: {readings} recent readings were reviewed; keep measuring at consistent times.\n\
             2. **Medication timing**: note whether readings settle after medication and share that with your care team.\n\
             3. *Daily habits*: regular meals, water and a short walk after eating help keep readings steady."
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdviceState {
    Pending,
    Succeeded(String),
    Failed(String),
}

impl AdviceState {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// An advice request running on a worker thread.
pub struct AdviceTask {
    request_id: Ulid,
    receiver: Option<Receiver<Result<String, AdviceFailure>>>,
    worker: Option<JoinHandle<()>>,
    state: AdviceState,
}

impl AdviceTask {
    /// Starts a request for the most recent `count` records. With no records
    /// the task is already failed and nothing is sent.
    #[must_use]
    pub fn for_records(
        client: Arc<dyn AdviceClient>,
        records: &[GlucoseRecord],
        count: usize,
    ) -> Self {
        Self::start(client, build_advice_prompt(records, count))
    }

    #[must_use]
    pub fn start(client: Arc<dyn AdviceClient>, prompt: Option<String>) -> Self {
        let request_id = Ulid::new();

        let Some(prompt) = prompt else {
            return Self::settled(request_id, AdviceState::Failed(NO_DATA_MESSAGE.to_string()));
        };

        tracing::info!(
            request_id = %request_id,
            client = client.client_name(),
            "advice request started"
        );

        let (sender, receiver) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name(format!("advice-{request_id}"))
            .spawn(move || {
                let outcome = client.request_advice(&prompt);
                let _ = sender.send(outcome);
            });

        match spawned {
            Ok(worker) => Self {
                request_id,
                receiver: Some(receiver),
                worker: Some(worker),
                state: AdviceState::Pending,
            },
            Err(err) => Self::settled(
                request_id,
                AdviceState::Failed(format!("failed to start advice request: {err}")),
            ),
        }
    }

    fn settled(request_id: Ulid, state: AdviceState) -> Self {
        Self {
            request_id,
            receiver: None,
            worker: None,
            state,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> Ulid {
        self.request_id
    }

    #[must_use]
    pub fn state(&self) -> &AdviceState {
        &self.state
    }

    /// Checks for a response without blocking.
    pub fn poll(&mut self) -> &AdviceState {
        let received = match &self.receiver {
            Some(receiver) => match receiver.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Err(AdviceFailure::WorkerLost)),
            },
            None => None,
        };

        if let Some(outcome) = received {
            self.finish(outcome);
        }
        &self.state
    }

    /// Blocks until the request settles.
    pub fn wait(mut self) -> AdviceState {
        if let Some(receiver) = &self.receiver {
            let outcome = receiver.recv().unwrap_or(Err(AdviceFailure::WorkerLost));
            self.finish(outcome);
        }
        self.state.clone()
    }

    fn finish(&mut self, outcome: Result<String, AdviceFailure>) {
        self.receiver = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.state = match outcome {
            Ok(text) => {
                tracing::info!(request_id = %self.request_id, "advice request succeeded");
                AdviceState::Succeeded(text)
            }
            Err(failure) => {
                tracing::warn!(request_id = %self.request_id, error = %failure, "advice request failed");
                AdviceState::Failed(failure.to_string())
            }
        };
    }
}
