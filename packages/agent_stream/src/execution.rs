//! Code execution through an external Piston-compatible service.
//!
//! Used by UI actions only. Failures never escape as errors: they come back
//! as an `ExecutionResult` with `success = false`.

use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ExecutionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time measured locally
    pub runtime: Duration,
}

impl ExecutionResult {
    fn failed(error: impl Into<String>, runtime: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            runtime,
        }
    }
}

pub trait CodeExecutor: Send + Sync {
    fn execute(&self, code: &str, language: &str) -> BoxFuture<'static, ExecutionResult>;
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: [SourceFile<'a>; 1],
}

#[derive(Serialize)]
struct SourceFile<'a> {
    content: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    run: Option<Stage>,
    #[serde(default)]
    compile: Option<Stage>,
    /// Set instead of `run` when the request was refused
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Stage {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    signal: Option<String>,
}

impl Stage {
    fn failed(&self) -> bool {
        self.code.is_some_and(|c| c != 0) || self.signal.is_some()
    }

    fn failure_text(&self) -> String {
        if !self.stderr.trim().is_empty() {
            return self.stderr.clone();
        }
        match (&self.signal, self.code) {
            (Some(signal), _) => format!("terminated by {signal}"),
            (None, Some(code)) => format!("exited with status {code}"),
            (None, None) => "execution failed".to_string(),
        }
    }
}

/// Map a service response onto a result.
fn interpret(response: ExecuteResponse, runtime: Duration) -> ExecutionResult {
    if let Some(compile) = response.compile.as_ref().filter(|c| c.failed()) {
        return ExecutionResult {
            success: false,
            output: compile.stdout.clone(),
            error: Some(compile.failure_text()),
            runtime,
        };
    }

    match response.run {
        Some(run) if run.failed() => ExecutionResult {
            success: false,
            error: Some(run.failure_text()),
            output: run.stdout,
            runtime,
        },
        Some(run) => ExecutionResult {
            success: true,
            output: run.stdout,
            error: (!run.stderr.is_empty()).then_some(run.stderr),
            runtime,
        },
        None => ExecutionResult::failed(
            response
                .message
                .unwrap_or_else(|| "execution service returned no result".to_string()),
            runtime,
        ),
    }
}

/// Client for the Piston `/execute` API.
#[derive(Clone)]
pub struct PistonExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl PistonExecutor {
    pub fn new(config: &ExecutionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

impl CodeExecutor for PistonExecutor {
    fn execute(&self, code: &str, language: &str) -> BoxFuture<'static, ExecutionResult> {
        let client = self.client.clone();
        let url = format!("{}/execute", self.endpoint);
        let code = code.to_string();
        let language = language.to_string();

        async move {
            let started = Instant::now();
            debug!(%url, %language, bytes = code.len(), "executing code");

            let request = ExecuteRequest {
                language: &language,
                version: "*",
                files: [SourceFile { content: &code }],
            };
            let response = match client.post(&url).json(&request).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(error = %e, "execution service unreachable");
                    return ExecutionResult::failed(e.to_string(), started.elapsed());
                }
            };

            let status = response.status();
            let body: ExecuteResponse = match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    return ExecutionResult::failed(
                        format!("HTTP {status}: {e}"),
                        started.elapsed(),
                    );
                }
            };
            interpret(body, started.elapsed())
        }
        .boxed()
    }
}
