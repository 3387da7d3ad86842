use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::{RawExecution, SandboxBackend, SandboxFailure, SandboxRequest};

/// Remote sandbox service reached with `POST {code, context, timeout}`.
pub struct HttpSandboxBackend {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpSandboxBackend {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl SandboxBackend for HttpSandboxBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn run(&self, request: &SandboxRequest) -> Result<RawExecution, SandboxFailure> {
        let mut req = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|err| SandboxFailure::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SandboxFailure::Transport(err.to_string()))?;
        if !status.is_success() {
            let preview = body.chars().take(300).collect::<String>();
            return Err(SandboxFailure::Transport(format!(
                "sandbox service returned {status}: {preview}"
            )));
        }
        serde_json::from_str::<RawExecution>(&body).map_err(|err| {
            SandboxFailure::Transport(format!("sandbox service response is malformed: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Sandbox, SandboxClient};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use codeloom_types::Context;
    use serde_json::{json, Value};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/execute")
    }

    async fn echo_sum(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-sbx") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "auth"})));
        }
        let sum = body["context"]["a"].as_i64().unwrap_or(0) + body["context"]["b"].as_i64().unwrap_or(0);
        let line = json!({"status": "success", "context_updates": {"sum": sum}});
        (
            StatusCode::OK,
            Json(json!({
                "stdout": format!("{line}\n"),
                "stderr": "",
                "exit_code": 0,
                "declared_output": null,
                "timeout_seen": body["timeout"],
            })),
        )
    }

    fn ctx() -> Context {
        Context::from_value(json!({"a": 2, "b": 3})).expect("context")
    }

    #[tokio::test]
    async fn executes_against_remote_service() {
        let url = spawn(Router::new().route("/execute", post(echo_sum))).await;
        let client = SandboxClient::new(HttpSandboxBackend::new(url, Some("sk-sbx".to_string())));
        let result = client
            .execute("pass", &ctx(), Duration::from_secs(5))
            .await
            .expect("result");
        assert_eq!(result.context_updates.get("sum"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn service_errors_are_transport_failures() {
        let url = spawn(Router::new().route("/execute", post(echo_sum))).await;
        let client = SandboxClient::new(HttpSandboxBackend::new(url, None));
        let err = client
            .execute("pass", &ctx(), Duration::from_secs(5))
            .await
            .expect_err("unauthorized");
        assert_eq!(err.code(), "transport");
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_transport_failure() {
        let client = SandboxClient::new(HttpSandboxBackend::new("http://127.0.0.1:9/execute", None));
        let err = client
            .execute("pass", &ctx(), Duration::from_secs(5))
            .await
            .expect_err("unreachable");
        assert_eq!(err.code(), "transport");
    }
}
