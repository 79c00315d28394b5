//! API routes

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ModelConfig;
use crate::core::{Channel, DispatchOutcome, InboundMessage, RelayOrchestrator};
use crate::media::Attachment;
use crate::transport::{ChatTransport, OutboundMessage};
use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Upstream(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    open_channels: usize,
}

#[derive(Debug, Deserialize)]
pub struct OpenChannelRequest {
    pub channel_id: String,
    /// Defaults to the channel id
    #[serde(default)]
    pub channel_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Base64-encoded bytes
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PostMessageQuery {
    /// Wait for the model reply instead of returning immediately
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesQuery {
    /// Only messages carrying the generated marker
    #[serde(default)]
    pub generated: bool,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub message_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<OutboundMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelState {
    pub channel_id: String,
    pub channel_key: String,
    pub is_loading: bool,
    pub error_message: String,
    pub has_no_messages: bool,
}

impl ChannelState {
    fn of(relay: &RelayOrchestrator) -> Self {
        Self {
            channel_id: relay.channel().channel_id.clone(),
            channel_key: relay.channel().channel_key.clone(),
            is_loading: relay.is_loading(),
            error_message: relay.error_message(),
            has_no_messages: relay.has_no_messages(),
        }
    }
}

impl DispatchResponse {
    fn new(message_id: String, outcome: Option<DispatchOutcome>) -> Self {
        let (status, reply, error) = match outcome {
            None => ("accepted", None, None),
            Some(DispatchOutcome::Published(reply)) => ("published", Some(reply), None),
            Some(DispatchOutcome::NoContent) => ("no_content", None, None),
            Some(DispatchOutcome::Unavailable) => ("unavailable", None, None),
            Some(DispatchOutcome::Duplicate) => ("duplicate", None, None),
            Some(DispatchOutcome::Failed(e)) => ("failed", None, Some(e)),
            Some(DispatchOutcome::Cancelled) => ("cancelled", None, None),
        };
        Self {
            message_id,
            status,
            reply,
            error,
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        open_channels: state.relays.len(),
    })
}

async fn open_channel(
    State(state): State<AppState>,
    Json(request): Json<OpenChannelRequest>,
) -> Result<Json<ChannelState>, ApiError> {
    if request.channel_id.trim().is_empty() {
        return Err(ApiError::BadRequest("channel_id must not be empty".into()));
    }
    let key = request
        .channel_key
        .unwrap_or_else(|| request.channel_id.clone());
    let relay = state.relays.open(Channel::new(request.channel_id, key));
    Ok(Json(ChannelState::of(&relay)))
}

async fn close_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.relays.close(&channel_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_open(&channel_id))
    }
}

async fn post_message(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<PostMessageQuery>,
    Json(request): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let relay = state
        .relays
        .get(&channel_id)
        .ok_or_else(|| not_open(&channel_id))?;

    if request.text.trim().is_empty() && request.attachments.is_empty() {
        return Err(ApiError::BadRequest("message has no text and no attachments".into()));
    }

    let attachments = request
        .attachments
        .into_iter()
        .map(|a| {
            let data = STANDARD
                .decode(a.data.as_bytes())
                .map_err(|e| ApiError::BadRequest(format!("attachment is not valid base64: {}", e)))?;
            Ok(Attachment {
                name: a.name,
                mime_type: a.mime_type,
                data,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let id = request
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // A remote chat backend already holds the user's message; only the
    // in-process history records it
    if let Some(history) = &state.history {
        history
            .send_message(&OutboundMessage::user(&channel_id, &id, &request.text))
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;
    }

    let message = InboundMessage {
        id: id.clone(),
        text: request.text,
        attachments,
    };

    if query.wait {
        let outcome = relay.dispatch_now(message).await;
        Ok((StatusCode::OK, Json(DispatchResponse::new(id, Some(outcome)))))
    } else {
        relay.dispatch(message);
        Ok((StatusCode::ACCEPTED, Json(DispatchResponse::new(id, None))))
    }
}

async fn list_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<OutboundMessage>>, ApiError> {
    let history = state
        .history
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("message history is kept by the remote transport".into()))?;
    let messages = if query.generated {
        history.generated_messages(&channel_id)
    } else {
        history.messages(&channel_id)
    };
    Ok(Json(messages))
}

async fn channel_state(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<ChannelState>, ApiError> {
    let relay = state
        .relays
        .get(&channel_id)
        .ok_or_else(|| not_open(&channel_id))?;
    Ok(Json(ChannelState::of(&relay)))
}

async fn channel_events(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let relay = state
        .relays
        .get(&channel_id)
        .ok_or_else(|| not_open(&channel_id))?;
    Ok(Sse::new(state_stream(relay)).keep_alive(KeepAlive::default()))
}

/// Current state first, then one event per change until the relay is gone
fn state_stream(
    relay: std::sync::Arc<RelayOrchestrator>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut loading = relay.subscribe_loading();
    let mut error = relay.subscribe_error();
    let mut empty = relay.subscribe_has_no_messages();
    let channel = relay.channel().clone();
    drop(relay);

    async_stream::stream! {
        loop {
            let snapshot = ChannelState {
                channel_id: channel.channel_id.clone(),
                channel_key: channel.channel_key.clone(),
                is_loading: *loading.borrow_and_update(),
                error_message: error.borrow_and_update().clone(),
                has_no_messages: *empty.borrow_and_update(),
            };
            match Event::default().event("state").json_data(&snapshot) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!(error = %e, "Failed to encode state event"),
            }

            let changed = tokio::select! {
                r = loading.changed() => r,
                r = error.changed() => r,
                r = empty.changed() => r,
            };
            if changed.is_err() {
                break;
            }
        }
    }
}

async fn get_config(
    State(state): State<AppState>,
    Path(channel_key): Path<String>,
) -> Result<Json<ModelConfig>, ApiError> {
    state
        .relays
        .binding()
        .configs()
        .get(&channel_key)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no model configuration for '{}'", channel_key)))
}

async fn put_config(
    State(state): State<AppState>,
    Path(channel_key): Path<String>,
    Json(config): Json<ModelConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if config.model.trim().is_empty() {
        return Err(ApiError::BadRequest("model must not be empty".into()));
    }
    let changed = state.relays.binding().configs().set(&channel_key, config);
    tracing::info!(channel_key = %channel_key, changed, "Model configuration updated");
    Ok(Json(json!({ "channel_key": channel_key, "changed": changed })))
}

async fn delete_config(
    State(state): State<AppState>,
    Path(channel_key): Path<String>,
) -> Json<serde_json::Value> {
    let changed = state.relays.binding().configs().remove(&channel_key);
    Json(json!({ "channel_key": channel_key, "changed": changed }))
}

fn not_open(channel_id: &str) -> ApiError {
    ApiError::NotFound(format!("channel '{}' is not open", channel_id))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/channels", post(open_channel))
        .route("/v1/channels/:channel_id", axum::routing::delete(close_channel))
        .route(
            "/v1/channels/:channel_id/messages",
            get(list_messages).post(post_message),
        )
        .route("/v1/channels/:channel_id/state", get(channel_state))
        .route("/v1/channels/:channel_id/events", get(channel_events))
        .route(
            "/v1/configs/:channel_key",
            get(get_config).put(put_config).delete(delete_config),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body, Bytes};
    use axum::http::Request;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::binding::{ChannelBinding, ConfigStore};
    use crate::core::RelayRegistry;
    use crate::testing::{png_bytes, MockConnector, Reply};
    use crate::transport::{InMemoryTransport, WebhookTransport};

    fn app_state(connector: Arc<MockConnector>) -> AppState {
        let store = Arc::new(ConfigStore::new());
        store.set("c1", ModelConfig::new("gemini-pro"));
        let transport = Arc::new(InMemoryTransport::new());
        let binding = Arc::new(ChannelBinding::new(store, transport.clone()));
        AppState {
            relays: Arc::new(RelayRegistry::new(binding, connector)),
            history: Some(transport),
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = router()
            .with_state(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn open(state: &AppState) {
        let (status, _) = call(
            state,
            "POST",
            "/v1/channels",
            Some(json!({"channel_id": "chan-1", "channel_key": "c1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        state.relays.get("chan-1").unwrap().ready().await;
    }

    /// Read SSE frames until the next `state` event and return its payload
    async fn next_state(
        body: &mut (impl futures::Stream<Item = Result<Bytes, axum::Error>> + Unpin),
        buf: &mut String,
    ) -> Value {
        loop {
            if let Some(end) = buf.find("\n\n") {
                let frame: String = buf.drain(..end + 2).collect();
                let data = frame
                    .lines()
                    .find_map(|line| line.strip_prefix("data:"))
                    .map(str::trim_start);
                if let Some(data) = data {
                    return serde_json::from_str(data).unwrap();
                }
                continue;
            }
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(2), body.next())
                .await
                .expect("no SSE frame within 2s")
                .expect("SSE stream ended")
                .unwrap();
            buf.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    #[tokio::test]
    async fn test_health() {
        let state = app_state(Arc::new(MockConnector::new()));
        let (status, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["open_channels"], 0);
    }

    #[tokio::test]
    async fn test_post_and_wait_for_reply() {
        let connector = Arc::new(MockConnector::new());
        connector.model("gemini-pro").reply("Hello", Reply::text("Hi there"));
        let state = app_state(connector);
        open(&state).await;

        let (status, body) = call(
            &state,
            "POST",
            "/v1/channels/chan-1/messages?wait=true",
            Some(json!({"id": "m-1", "text": "Hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "published");
        assert_eq!(body["reply"]["text"], "Hi there");
        assert_eq!(body["reply"]["extra"]["gemini"], true);

        let (_, messages) = call(&state, "GET", "/v1/channels/chan-1/messages", None).await;
        let messages = messages.as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["text"], "Hello");

        let (_, channel) = call(&state, "GET", "/v1/channels/chan-1/state", None).await;
        assert_eq!(channel["is_loading"], false);
        assert_eq!(channel["error_message"], "");
    }

    #[tokio::test]
    async fn test_post_with_attachment() {
        let connector = Arc::new(MockConnector::new());
        connector.model("gemini-pro").reply(
            "Look at the image(s), and then answer the following question: What is this?",
            Reply::text("A cat."),
        );
        let state = app_state(connector);
        open(&state).await;

        let (status, body) = call(
            &state,
            "POST",
            "/v1/channels/chan-1/messages?wait=true",
            Some(json!({
                "text": "What is this?",
                "attachments": [{"name": "cat.png", "data": STANDARD.encode(png_bytes(4, 4))}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"]["text"], "A cat.");
    }

    #[tokio::test]
    async fn test_bad_attachment_encoding() {
        let state = app_state(Arc::new(MockConnector::new()));
        open(&state).await;

        let (status, body) = call(
            &state,
            "POST",
            "/v1/channels/chan-1/messages",
            Some(json!({"text": "hi", "attachments": [{"data": "***"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("base64"));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let state = app_state(Arc::new(MockConnector::new()));
        let (status, _) = call(
            &state,
            "POST",
            "/v1/channels/nope/messages",
            Some(json!({"text": "Hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&state, "DELETE", "/v1/channels/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_reply_is_reported() {
        let connector = Arc::new(MockConnector::new());
        connector.model("gemini-pro").reply("Hello", Reply::fail("timeout"));
        let state = app_state(connector);
        open(&state).await;

        let (_, body) = call(
            &state,
            "POST",
            "/v1/channels/chan-1/messages?wait=true",
            Some(json!({"text": "Hello"})),
        )
        .await;
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"], "timeout");

        let (_, channel) = call(&state, "GET", "/v1/channels/chan-1/state", None).await;
        assert_eq!(channel["error_message"], "timeout");
    }

    #[tokio::test]
    async fn test_config_routes() {
        let state = app_state(Arc::new(MockConnector::new()));

        let (status, body) = call(
            &state,
            "PUT",
            "/v1/configs/c1",
            Some(json!({"model": "gemini-1.5-flash"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        assert_eq!(
            state.relays.binding().configs().get("c1").unwrap().model,
            "gemini-1.5-flash"
        );

        let (_, body) = call(&state, "DELETE", "/v1/configs/c1", None).await;
        assert_eq!(body["changed"], true);
        assert!(state.relays.binding().configs().get("c1").is_none());
    }

    #[tokio::test]
    async fn test_close_channel() {
        let state = app_state(Arc::new(MockConnector::new()));
        open(&state).await;

        let (status, _) = call(&state, "DELETE", "/v1/channels/chan-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.relays.get("chan-1").is_none());
    }

    #[tokio::test]
    async fn test_list_generated_messages_only() {
        let connector = Arc::new(MockConnector::new());
        connector.model("gemini-pro").reply("Hello", Reply::text("Hi there"));
        let state = app_state(connector);
        open(&state).await;

        call(
            &state,
            "POST",
            "/v1/channels/chan-1/messages?wait=true",
            Some(json!({"id": "m-1", "text": "Hello"})),
        )
        .await;

        let (_, messages) = call(&state, "GET", "/v1/channels/chan-1/messages?generated=true", None).await;
        let messages = messages.as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["text"], "Hi there");
    }

    #[tokio::test]
    async fn test_get_config() {
        let state = app_state(Arc::new(MockConnector::new()));

        let (status, body) = call(&state, "GET", "/v1/configs/c1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], "gemini-pro");

        let (status, _) = call(&state, "GET", "/v1/configs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_receives_only_replies() {
        let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let hook = Router::new()
            .route(
                "/hook",
                post(|State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                    received.lock().push(body);
                    StatusCode::OK
                }),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, hook).await.unwrap();
        });

        let connector = Arc::new(MockConnector::new());
        connector.model("gemini-pro").reply("Hello", Reply::text("Hi there"));
        let store = Arc::new(ConfigStore::new());
        store.set("c1", ModelConfig::new("gemini-pro"));
        let transport = Arc::new(WebhookTransport::new(
            reqwest::Client::new(),
            format!("http://{}/hook", addr),
        ));
        let binding = Arc::new(ChannelBinding::new(store, transport));
        let state = AppState {
            relays: Arc::new(RelayRegistry::new(binding, connector)),
            history: None,
        };
        open(&state).await;

        let (_, body) = call(
            &state,
            "POST",
            "/v1/channels/chan-1/messages?wait=true",
            Some(json!({"id": "m-1", "text": "Hello"})),
        )
        .await;
        assert_eq!(body["status"], "published");

        let received = received.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["text"], "Hi there");
        assert_eq!(received[0]["extra"]["gemini"], true);

        let (status, _) = call(&state, "GET", "/v1/channels/chan-1/messages", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_events_stream_current_state_then_changes() {
        let connector = Arc::new(MockConnector::new());
        connector.model("gemini-pro").reply("Hello", Reply::fail("timeout"));
        let state = app_state(connector);
        open(&state).await;

        let response = router()
            .with_state(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/v1/channels/chan-1/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();
        let mut buf = String::new();

        let first = next_state(&mut body, &mut buf).await;
        assert_eq!(first["channel_id"], "chan-1");
        assert_eq!(first["error_message"], "");
        assert_eq!(first["is_loading"], false);

        call(
            &state,
            "POST",
            "/v1/channels/chan-1/messages?wait=true",
            Some(json!({"text": "Hello"})),
        )
        .await;

        let mut event = next_state(&mut body, &mut buf).await;
        while event["error_message"] != "timeout" {
            event = next_state(&mut body, &mut buf).await;
        }
        assert_eq!(event["is_loading"], false);
    }
}
