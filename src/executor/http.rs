//! HTTP stage executor.
//!
//! Posts the stage context as JSON to `{base_url}/{stage}` and maps the
//! answer onto a [`StageResult`]:
//!
//! | Response                               | Result    |
//! |----------------------------------------|-----------|
//! | 2xx with `{"artifact": ..}`            | success   |
//! | 2xx with `{"payload": ..}`             | success (large payloads go to the blob store) |
//! | timeout, connect error, 429, 5xx       | transient |
//! | any other 4xx, unparsable 2xx body     | permanent |

use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{StageContext, StageExecutor};
use crate::pipeline::{ArtifactRef, FailureKind, Stage, StageResult};
use crate::storage::BlobStore;

const DEFAULT_INLINE_LIMIT_BYTES: usize = 64 * 1024;

/// Longest response body quoted back in a failure message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Body returned by a stage service.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StageResponse {
    /// The service stored the output itself.
    Artifact { artifact: ArtifactRef },
    /// The service returned the output directly.
    Payload { payload: serde_json::Value },
}

/// Stage executor backed by a remote stage service.
pub struct HttpStageExecutor {
    stage: Stage,
    endpoint: String,
    client: Client,
    blobs: BlobStore,
    inline_limit_bytes: usize,
}

impl HttpStageExecutor {
    pub fn new(stage: Stage, base_url: &str, client: Client, blobs: BlobStore) -> Self {
        Self {
            stage,
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), stage.as_str()),
            client,
            blobs,
            inline_limit_bytes: DEFAULT_INLINE_LIMIT_BYTES,
        }
    }

    pub fn with_inline_limit(mut self, bytes: usize) -> Self {
        self.inline_limit_bytes = bytes;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn interpret_body(&self, body: &[u8]) -> StageResult {
        let response: StageResponse = match serde_json::from_slice(body) {
            Ok(response) => response,
            Err(e) => return StageResult::permanent(format!("unparsable response body: {}", e)),
        };

        match response {
            StageResponse::Artifact { artifact } => StageResult::Success(artifact),
            StageResponse::Payload { payload } => {
                let encoded = match serde_json::to_vec(&payload) {
                    Ok(encoded) => encoded,
                    Err(e) => return StageResult::permanent(format!("unencodable payload: {}", e)),
                };
                if encoded.len() <= self.inline_limit_bytes {
                    return StageResult::Success(ArtifactRef::inline(payload));
                }
                match self.blobs.put(&encoded).await {
                    Ok(artifact) => StageResult::Success(artifact),
                    Err(e) => StageResult::transient(format!("blob store write failed: {}", e)),
                }
            }
        }
    }
}

/// Retry classification of a non-success HTTP status.
pub fn classify_status(status: StatusCode) -> FailureKind {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

/// Network-level send failures are retried. Builder errors (a malformed
/// endpoint, say) fail the same way every time.
fn is_transient_send_error(e: &reqwest::Error) -> bool {
    !e.is_builder() && (e.is_timeout() || e.is_connect() || e.is_request())
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl StageExecutor for HttpStageExecutor {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, ctx: &StageContext) -> StageResult {
        let started = Instant::now();
        let response = match self.client.post(&self.endpoint).json(ctx).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    episode_id = %ctx.episode_id,
                    stage = %self.stage,
                    timeout = e.is_timeout(),
                    connect = e.is_connect(),
                    error = %e,
                    "Stage request failed"
                );
                let message = format!("request to {} failed: {}", self.endpoint, e);
                return if is_transient_send_error(&e) {
                    StageResult::transient(message)
                } else {
                    StageResult::permanent(message)
                };
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return StageResult::transient(format!("reading response failed: {}", e)),
        };

        tracing::debug!(
            episode_id = %ctx.episode_id,
            stage = %self.stage,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stage service responded"
        );

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            let message = format!("{} returned {}: {}", self.endpoint, status, truncate(&text));
            return match classify_status(status) {
                FailureKind::Transient => StageResult::transient(message),
                FailureKind::Permanent => StageResult::permanent(message),
            };
        }

        self.interpret_body(&body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ContentSource, Episode, NewEpisode};
    use crate::scheduler::Task;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves exactly one canned HTTP response and returns the base URL.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Read headers, then as much body as Content-Length announces.
            loop {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    fn context(stage: Stage) -> StageContext {
        let request = NewEpisode::new(
            "owner",
            "Title",
            ContentSource::Text {
                content: "body".to_string(),
            },
        );
        let episode = Episode::from_request(request, chrono::Utc::now());
        StageContext::new(&episode, &Task::new(episode.id, stage, 0))
    }

    fn executor(base_url: &str, blobs: &TempDir) -> HttpStageExecutor {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client");
        HttpStageExecutor::new(Stage::Scripted, base_url, client, BlobStore::new(blobs.path()))
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), FailureKind::Permanent);
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), FailureKind::Permanent);
    }

    #[test]
    fn test_endpoint_joins_stage_name() {
        let dir = TempDir::new().expect("tempdir");
        let exec = executor("http://svc/stages/", &dir);
        assert_eq!(exec.endpoint(), "http://svc/stages/scripted");
    }

    #[tokio::test]
    async fn test_inline_payload_success() {
        let dir = TempDir::new().expect("tempdir");
        let url = serve_once("200 OK", r#"{"payload":{"lines":2}}"#).await;

        let result = executor(&url, &dir).execute(&context(Stage::Scripted)).await;
        assert_eq!(
            result,
            StageResult::Success(ArtifactRef::inline(serde_json::json!({"lines": 2})))
        );
    }

    #[tokio::test]
    async fn test_large_payload_goes_to_blob_store() {
        let dir = TempDir::new().expect("tempdir");
        let url = serve_once("200 OK", r#"{"payload":{"script":"a fairly long script"}}"#).await;

        let result = executor(&url, &dir)
            .with_inline_limit(8)
            .execute(&context(Stage::Scripted))
            .await;
        match result {
            StageResult::Success(ArtifactRef::Blob { location, .. }) => {
                let stored = BlobStore::new(dir.path()).get(&location).await.expect("blob");
                let value: serde_json::Value = serde_json::from_slice(&stored).expect("json");
                assert_eq!(value["script"], "a fairly long script");
            }
            other => panic!("expected blob artifact, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let dir = TempDir::new().expect("tempdir");
        let url = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#).await;

        let result = executor(&url, &dir).execute(&context(Stage::Scripted)).await;
        assert!(matches!(result, StageResult::TransientFailure(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let dir = TempDir::new().expect("tempdir");
        let url = serve_once("400 Bad Request", r#"{"error":"empty source"}"#).await;

        let result = executor(&url, &dir).execute(&context(Stage::Scripted)).await;
        assert!(matches!(result, StageResult::PermanentFailure(msg) if msg.contains("empty source")));
    }

    #[tokio::test]
    async fn test_unparsable_body_is_permanent() {
        let dir = TempDir::new().expect("tempdir");
        let url = serve_once("200 OK", "not json").await;

        let result = executor(&url, &dir).execute(&context(Stage::Scripted)).await;
        assert!(matches!(result, StageResult::PermanentFailure(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let dir = TempDir::new().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let result = executor(&format!("http://{}", addr), &dir)
            .execute(&context(Stage::Scripted))
            .await;
        assert!(matches!(result, StageResult::TransientFailure(_)));
    }

    #[tokio::test]
    async fn test_invalid_base_url_is_permanent() {
        let dir = TempDir::new().expect("tempdir");

        let result = executor("not a url", &dir)
            .execute(&context(Stage::Scripted))
            .await;
        assert!(
            matches!(result, StageResult::PermanentFailure(ref msg) if msg.contains("not a url")),
            "got {:?}",
            result
        );
    }
}
