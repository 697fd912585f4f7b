//! Shared connection to the inference backend.
//!
//! Owns the local/remote mode, the HTTP client, the local process and its idle
//! timer. Every session's runner goes through the same instance.

use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use shared::settings::BackendSettings;
use shared::ChatError;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::idle::{IdleAction, IdleTimer};
use crate::instance::LocalInstance;
use crate::ndjson::NdjsonParser;
use crate::ollama::{ChatBackend, ChatChunk, ChatRequest};

static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

/// Non-streaming requests give up after this long
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest wait for the response headers or the next body chunk of a stream
const STREAM_STALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Local,
    Remote,
}

/// Result of [`BackendConnection::request`]. Streaming calls leave `body` empty.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: String,
}

impl BackendResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ChatError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ChatError::network(format!("invalid response body: {}", e)))
    }
}

/// Receives each decoded NDJSON line. `Break` ends the stream early and
/// returning an error aborts it.
pub type ChunkHandler<'a> =
    &'a mut (dyn FnMut(serde_json::Value) -> Result<ControlFlow<()>, ChatError> + Send);

pub struct BackendConnection {
    http: Client,
    settings: RwLock<BackendSettings>,
    instance: Arc<LocalInstance>,
    idle: IdleTimer,
    stall_timeout: Duration,
}

impl BackendConnection {
    pub fn new(settings: BackendSettings) -> Self {
        let instance = Arc::new(LocalInstance::new());
        let in_flight = Arc::new(AtomicUsize::new(0));

        let on_idle: IdleAction = {
            let instance = instance.clone();
            let in_flight = in_flight.clone();
            Arc::new(move || {
                let instance = instance.clone();
                let in_flight = in_flight.clone();
                Box::pin(async move {
                    if instance.stop_if_idle(&in_flight).await {
                        tracing::info!("local backend stopped after idle timeout");
                    }
                })
            })
        };
        let idle = IdleTimer::new(settings.idle_timeout(), in_flight, on_idle);

        Self {
            http: SHARED_HTTP.clone(),
            settings: RwLock::new(settings),
            instance,
            idle,
            stall_timeout: STREAM_STALL_TIMEOUT,
        }
    }

    /// Give up on a stream that sends nothing for `timeout`.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn mode(&self) -> BackendMode {
        if self.settings.read().remote {
            BackendMode::Remote
        } else {
            BackendMode::Local
        }
    }

    pub fn base_url(&self) -> String {
        let settings = self.settings.read();
        if settings.remote {
            settings.remote_url.clone()
        } else {
            settings.local_url()
        }
    }

    pub fn settings(&self) -> BackendSettings {
        self.settings.read().clone()
    }

    /// Launch the local backend if needed. No-op in remote mode.
    pub async fn start(&self) -> Result<(), ChatError> {
        let settings = self.settings();
        if settings.remote {
            return Ok(());
        }
        self.instance.start(&settings).await?;
        self.idle.touch();
        Ok(())
    }

    pub async fn stop(&self) {
        self.instance.stop().await;
    }

    pub async fn reset(&self) -> Result<(), ChatError> {
        let settings = self.settings();
        if settings.remote {
            self.instance.stop().await;
            return Ok(());
        }
        self.instance.reset(&settings).await?;
        self.idle.touch();
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.instance.is_running().await
    }

    /// Switch to a remote server; any local process we own is stopped.
    pub async fn set_remote(&self, url: impl Into<String>, bearer_token: impl Into<String>) {
        {
            let mut settings = self.settings.write();
            settings.remote = true;
            settings.remote_url = url.into();
            settings.bearer_token = bearer_token.into();
        }
        tracing::info!(url = %self.base_url(), "switched to remote backend");
        self.instance.stop().await;
    }

    pub async fn set_local(&self) -> Result<(), ChatError> {
        self.settings.write().remote = false;
        tracing::info!(url = %self.base_url(), "switched to local backend");
        self.start().await
    }

    /// Replace the launch environment; a running local backend is restarted.
    pub async fn set_overrides(&self, overrides: BTreeMap<String, String>) -> Result<(), ChatError> {
        self.settings.write().overrides = overrides;
        self.reset_if_local().await
    }

    pub async fn set_model_directory(&self, dir: PathBuf) -> Result<(), ChatError> {
        self.settings.write().model_directory = Some(dir);
        self.reset_if_local().await
    }

    pub fn set_idle_timeout(&self, minutes: u64) {
        let delay = {
            let mut settings = self.settings.write();
            settings.idle_timer_minutes = minutes;
            settings.idle_timeout()
        };
        self.idle.set_delay(delay);
    }

    async fn reset_if_local(&self) -> Result<(), ChatError> {
        if self.mode() == BackendMode::Local {
            self.reset().await
        } else {
            Ok(())
        }
    }

    /// Names of the models the backend has available (`GET /api/tags`).
    pub async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        #[derive(serde::Deserialize)]
        struct Tags {
            #[serde(default)]
            models: Vec<Tag>,
        }
        #[derive(serde::Deserialize)]
        struct Tag {
            name: String,
        }

        let tags: Tags = self.request(Method::GET, "api/tags", None, None).await?.json()?;
        Ok(tags.models.into_iter().map(|t| t.name).collect())
    }

    /// Send one HTTP call to `base_url + path`.
    ///
    /// With `on_chunk`, the body is read as newline-delimited JSON and each line is
    /// delivered in arrival order until the body ends or the handler breaks.
    /// Connection failures, stalls, non-2xx statuses and `{"error": ...}` lines
    /// become [`ChatError::Network`].
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        on_chunk: Option<ChunkHandler<'_>>,
    ) -> Result<BackendResponse, ChatError> {
        let _guard = self.idle.enter();
        self.idle.touch();

        let (url, token, remote) = {
            let settings = self.settings.read();
            let base = if settings.remote {
                settings.remote_url.clone()
            } else {
                settings.local_url()
            };
            (
                join_url(&base, path),
                settings.bearer_token.clone(),
                settings.remote,
            )
        };

        if !remote {
            self.start().await?;
        }

        let mut builder = self.http.request(method.clone(), &url);
        if remote && !token.is_empty() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if on_chunk.is_none() {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }

        tracing::debug!(%method, %url, streaming = on_chunk.is_some(), "backend request");
        let sent = if on_chunk.is_some() {
            self.within_stall_timeout(builder.send()).await?
        } else {
            builder.send().await
        };
        let resp = sent.map_err(|e| ChatError::network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), "backend returned an error status");
            return Err(ChatError::network(format!("backend returned {}", status)));
        }

        let Some(on_chunk) = on_chunk else {
            let body = resp
                .text()
                .await
                .map_err(|e| ChatError::network(e.to_string()))?;
            self.idle.touch();
            return Ok(BackendResponse {
                status: status.as_u16(),
                body,
            });
        };

        let mut stream = resp.bytes_stream();
        let mut parser = NdjsonParser::new();
        'read: loop {
            let Some(bytes) = self.within_stall_timeout(stream.next()).await? else {
                if let Some(line) = parser.finish() {
                    let _ = on_chunk(self.decode_line(&line)?)?;
                }
                break;
            };
            let bytes = bytes.map_err(|e| ChatError::network(format!("stream read error: {}", e)))?;
            for line in parser.feed(&bytes) {
                if on_chunk(self.decode_line(&line)?)?.is_break() {
                    tracing::debug!(%url, "stream ended by handler");
                    break 'read;
                }
            }
        }
        self.idle.touch();

        Ok(BackendResponse {
            status: status.as_u16(),
            body: String::new(),
        })
    }

    async fn within_stall_timeout<F: std::future::Future>(&self, fut: F) -> Result<F::Output, ChatError> {
        tokio::time::timeout(self.stall_timeout, fut).await.map_err(|_| {
            tracing::warn!(timeout = ?self.stall_timeout, "backend stream stalled");
            ChatError::network(format!(
                "no response from backend for {}s",
                self.stall_timeout.as_secs_f32()
            ))
        })
    }

    fn decode_line(&self, line: &str) -> Result<serde_json::Value, ChatError> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| ChatError::network(format!("malformed stream line: {}", e)))?;
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Err(ChatError::network(error.to_string()));
        }
        self.idle.touch();
        Ok(value)
    }
}

#[async_trait::async_trait]
impl ChatBackend for BackendConnection {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatChunk, ChatError> {
        let body = serde_json::to_value(request)
            .map_err(|e| ChatError::network(format!("invalid request: {}", e)))?;
        let resp = self.request(Method::POST, "api/chat", Some(&body), None).await?;
        resp.json()
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_chunk: &mut (dyn FnMut(ChatChunk) -> ControlFlow<()> + Send),
    ) -> Result<(), ChatError> {
        let body = serde_json::to_value(request)
            .map_err(|e| ChatError::network(format!("invalid request: {}", e)))?;
        let mut handler = |value: serde_json::Value| -> Result<ControlFlow<()>, ChatError> {
            let chunk: ChatChunk = serde_json::from_value(value)
                .map_err(|e| ChatError::network(format!("unexpected chunk: {}", e)))?;
            let done = chunk.done;
            if on_chunk(chunk).is_break() || done {
                return Ok(ControlFlow::Break(()));
            }
            Ok(ControlFlow::Continue(()))
        };
        self.request(Method::POST, "api/chat", Some(&body), Some(&mut handler))
            .await
            .map(|_| ())
    }

    async fn recover(&self) -> Result<(), ChatError> {
        match self.mode() {
            BackendMode::Local => {
                tracing::warn!("resetting local backend after connection error");
                self.reset().await
            }
            BackendMode::Remote => Ok(()),
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::agent_api::WireMessage;
    use shared::message::Role;
    use shared::settings::Tweaks;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote_connection(server: &MockServer, token: &str) -> BackendConnection {
        BackendConnection::new(BackendSettings {
            remote: true,
            remote_url: server.uri(),
            bearer_token: token.into(),
            ..BackendSettings::default()
        })
    }

    fn hello_request() -> ChatRequest {
        ChatRequest::streaming(
            "m1",
            vec![WireMessage::new(Role::User, "Hi")],
            &Tweaks::default(),
        )
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h:1/", "/api/chat"), "http://h:1/api/chat");
        assert_eq!(join_url("http://h:1", "api/chat"), "http://h:1/api/chat");
    }

    #[test]
    fn test_mode_and_base_url() {
        let conn = BackendConnection::new(BackendSettings::default());
        assert_eq!(conn.mode(), BackendMode::Local);
        assert_eq!(conn.base_url(), "http://127.0.0.1:11435");
    }

    #[tokio::test]
    async fn test_stream_delivers_chunks_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"He\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"llo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"model": "m1", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let conn = remote_connection(&server, "secret");
        let mut seen = Vec::new();
        conn.chat_stream(&hello_request(), &mut |chunk: ChatChunk| {
            seen.push((chunk.content().to_string(), chunk.done));
            ControlFlow::Continue(())
        })
        .await
        .unwrap();

        assert_eq!(
            seen,
            vec![
                ("He".to_string(), false),
                ("llo".to_string(), false),
                (String::new(), true)
            ]
        );
    }

    #[tokio::test]
    async fn test_non_success_status_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let conn = remote_connection(&server, "");
        let mut count = 0;
        let err = conn
            .chat_stream(&hello_request(), &mut |_: ChatChunk| {
                count += 1;
                ControlFlow::Continue(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::Network { .. }));
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_error_line_mid_stream() {
        let server = MockServer::start().await;
        let body = "{\"message\":{\"content\":\"par\"},\"done\":false}\n{\"error\":\"model crashed\"}\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let conn = remote_connection(&server, "");
        let mut text = String::new();
        let err = conn
            .chat_stream(&hello_request(), &mut |chunk: ChatChunk| {
                text.push_str(chunk.content());
                ControlFlow::Continue(())
            })
            .await
            .unwrap_err();

        assert_eq!(text, "par");
        match err {
            ChatError::Network { reason } => assert_eq!(reason, "model crashed"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lines_after_done_are_not_delivered() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"content\":\"Hello\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
            "{\"message\":{\"content\":\" AFTER-DONE\"},\"done\":false}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let conn = remote_connection(&server, "");
        let mut text = String::new();
        conn.chat_stream(&hello_request(), &mut |chunk: ChatChunk| {
            text.push_str(chunk.content());
            ControlFlow::Continue(())
        })
        .await
        .unwrap();

        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_handler_break_stops_reading() {
        let server = MockServer::start().await;
        let body = "{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let conn = remote_connection(&server, "");
        let mut seen = Vec::new();
        conn.request(
            Method::POST,
            "api/chat",
            Some(&json!({})),
            Some(&mut |value: serde_json::Value| {
                seen.push(value["a"].as_i64().unwrap_or_default());
                Ok(if seen.len() == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            }),
        )
        .await
        .unwrap();

        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stalled_stream_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"message\":{\"content\":\"late\"},\"done\":true}\n")
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let conn = remote_connection(&server, "").with_stall_timeout(Duration::from_millis(100));
        let mut count = 0;
        let started = std::time::Instant::now();
        let err = conn
            .chat_stream(&hello_request(), &mut |_: ChatChunk| {
                count += 1;
                ControlFlow::Continue(())
            })
            .await
            .unwrap_err();

        match err {
            ChatError::Network { reason } => assert!(reason.contains("no response")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(count, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_one_shot_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "Cats"},
                "done": true
            })))
            .mount(&server)
            .await;

        let conn = remote_connection(&server, "");
        let reply = conn
            .chat(&ChatRequest::one_shot("m1", Vec::new()))
            .await
            .unwrap();
        assert_eq!(reply.content(), "Cats");
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_network_error() {
        let conn = BackendConnection::new(BackendSettings {
            remote: true,
            remote_url: "http://127.0.0.1:1".into(),
            ..BackendSettings::default()
        });
        let err = conn
            .request(Method::GET, "api/tags", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Network { .. }));
    }

    #[tokio::test]
    async fn test_local_request_without_binary_fails_to_start() {
        let conn = BackendConnection::new(BackendSettings {
            binary: Some(PathBuf::from("/definitely/not/ollama")),
            ..BackendSettings::default()
        });
        let err = conn
            .request(Method::GET, "api/tags", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Startup { .. }));
    }

    #[cfg(unix)]
    fn local_connection(dir: &std::path::Path, port: u16, idle: Duration) -> BackendConnection {
        let conn = BackendConnection::new(BackendSettings {
            binary: Some(crate::testing::sleeper_binary(dir)),
            local_port: port,
            ..BackendSettings::default()
        });
        conn.idle.set_delay(Some(idle));
        conn
    }

    #[cfg(unix)]
    fn cats_reply() -> Mock {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "Cats"},
                "done": true
            })))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_after_idle_stop_restarts_backend() {
        use crate::testing::{free_port, serve_after};

        let dir = tempfile::TempDir::new().unwrap();
        let port = free_port();
        let conn = local_connection(dir.path(), port, Duration::from_millis(300));
        let ask = ChatRequest::one_shot("m1", Vec::new());

        let server = serve_after(port, Duration::from_millis(100), cats_reply());
        assert_eq!(conn.chat(&ask).await.unwrap().content(), "Cats");
        assert!(conn.is_running().await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!conn.is_running().await);

        // release the port so the relaunch passes its port check
        drop(server.await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let server = serve_after(port, Duration::from_millis(100), cats_reply());
        assert_eq!(conn.chat(&ask).await.unwrap().content(), "Cats");
        assert!(conn.is_running().await);

        conn.stop().await;
        drop(server.await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_idle_stop_waits_for_request_in_flight() {
        use crate::testing::{free_port, serve_after};

        let dir = tempfile::TempDir::new().unwrap();
        let port = free_port();
        let conn = local_connection(dir.path(), port, Duration::from_millis(100));

        let slow = Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"message": {"content": "Cats"}, "done": true}))
                    .set_delay(Duration::from_millis(600)),
            );
        let server = serve_after(port, Duration::from_millis(100), slow);

        let reply = conn.chat(&ChatRequest::one_shot("m1", Vec::new())).await.unwrap();
        assert_eq!(reply.content(), "Cats");
        assert!(conn.is_running().await);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!conn.is_running().await);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3:latest"}, {"name": "qwen2:7b"}]
            })))
            .mount(&server)
            .await;

        let conn = remote_connection(&server, "");
        let models = conn.list_models().await.unwrap();
        assert_eq!(models, vec!["llama3:latest", "qwen2:7b"]);
    }

    #[tokio::test]
    async fn test_recover_is_noop_for_remote() {
        let server = MockServer::start().await;
        let conn = remote_connection(&server, "");
        conn.recover().await.unwrap();
        assert!(!conn.is_running().await);
    }
}
