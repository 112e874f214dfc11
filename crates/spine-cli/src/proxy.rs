//! Chat-completion proxy.
//!
//! Callers speak the same `/v1/chat/completions` shape they would speak to
//! the model. Verified memory is spliced in as an extra instruction message;
//! the upstream reply is relayed as it streams, then recorded.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use spine_core::{BuiltContext, IntegritySnapshot, SpineError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::SpineConfig;
use crate::relay::{ExchangeRecorder, ReplyCollector, relay_body};
use crate::runtime::Spine;

const MAX_REQUEST_BYTES: usize = 32 * 1024 * 1024;
const MODE_HEADER: &str = "x-spine-mode";
const MEMORIES_HEADER: &str = "x-spine-memories";

pub struct ProxyState {
    pub spine: Spine,
    client: reqwest::Client,
    upstream_base: String,
    identity_header: String,
    default_identity: String,
    context_role: String,
    admin_token: Option<String>,
}

impl ProxyState {
    pub fn new(spine: Spine, config: &SpineConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            spine,
            client,
            upstream_base: config.upstream_base().to_string(),
            identity_header: config.proxy.identity_header.to_ascii_lowercase(),
            default_identity: config.proxy.default_identity.clone(),
            context_role: config.proxy.context_role.clone(),
            admin_token: config.admin.token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn upstream_url(&self, path: &str) -> String {
        format!("{}{path}", self.upstream_base)
    }

    /// Header first, then the body's `user` field, then the configured default.
    fn identity(&self, headers: &HeaderMap, payload: &Value) -> String {
        headers
            .get(self.identity_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                payload
                    .get("user")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
            .unwrap_or(&self.default_identity)
            .to_string()
    }

    async fn forward(
        &self,
        request: reqwest::RequestBuilder,
        inbound: &HeaderMap,
        served: Served,
        recorder: Option<ExchangeRecorder>,
    ) -> Response {
        let mut request = request;
        for name in [AUTHORIZATION, ACCEPT] {
            if let Some(value) = inbound.get(&name) {
                request = request.header(name, value.clone());
            }
        }

        let upstream = match request.send().await {
            Ok(upstream) => upstream,
            Err(e) => {
                let err = SpineError::Upstream(e.to_string());
                tracing::warn!(error = %err, "upstream unreachable");
                let body = json!({
                    "error": { "message": err.to_string(), "type": "upstream_unreachable" }
                });
                let mut response = (StatusCode::BAD_GATEWAY, Json(body)).into_response();
                served.apply(response.headers_mut());
                return response;
            }
        };

        let status = upstream.status();
        let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
        let streaming = content_type
            .as_ref()
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        let tee = if status.is_success() {
            recorder.map(|r| (r, ReplyCollector::new(streaming)))
        } else {
            tracing::warn!(%status, "upstream returned an error; relaying it");
            None
        };

        let mut response = Response::new(relay_body(upstream.bytes_stream(), tee));
        *response.status_mut() = status;
        if let Some(content_type) = content_type {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        served.apply(response.headers_mut());
        response
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeMode {
    /// Memory lookup succeeded; any memories found were spliced in.
    Context,
    /// Ledger locked or retrieval failed; forwarded without memory.
    Degraded,
    /// Not a chat turn we act on; forwarded untouched, nothing recorded.
    Passthrough,
}

impl ServeMode {
    fn as_str(self) -> &'static str {
        match self {
            ServeMode::Context => "context",
            ServeMode::Degraded => "degraded",
            ServeMode::Passthrough => "passthrough",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Served {
    mode: ServeMode,
    memories: usize,
}

impl Served {
    const PASSTHROUGH: Served = Served {
        mode: ServeMode::Passthrough,
        memories: 0,
    };

    fn apply(self, headers: &mut HeaderMap) {
        headers.insert(MODE_HEADER, HeaderValue::from_static(self.mode.as_str()));
        headers.insert(MEMORIES_HEADER, HeaderValue::from(self.memories));
    }
}

pub fn create_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/admin/reset", post(admin_reset))
        .route("/admin/verify", post(admin_verify))
        .route("/admin/rights/reload", post(admin_reload_rights))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %Uuid::new_v4(),
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until `shutdown` is cancelled. In-flight responses are drained.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ---------------------------------------------------------------------------
// Chat completions
// ---------------------------------------------------------------------------

async fn chat_completions(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = state.upstream_url("/v1/chat/completions");

    let Ok(mut payload) = serde_json::from_slice::<Value>(&body) else {
        tracing::debug!("request body is not JSON; passing through");
        let mut request = state.client.post(&url).body(body);
        if let Some(content_type) = headers.get(CONTENT_TYPE) {
            request = request.header(CONTENT_TYPE, content_type.clone());
        }
        return state.forward(request, &headers, Served::PASSTHROUGH, None).await;
    };

    let Some(user_message) = last_user_message(&payload) else {
        tracing::debug!("no user message; passing through");
        let request = state
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        return state.forward(request, &headers, Served::PASSTHROUGH, None).await;
    };

    let identity = state.identity(&headers, &payload);
    let built = {
        let interpreter = Arc::clone(state.spine.interpreter());
        let (query, who) = (user_message.clone(), identity.clone());
        tokio::task::spawn_blocking(move || interpreter.build_context(&query, &who))
            .await
            .unwrap_or_else(|e| BuiltContext::Degraded(format!("context task failed: {e}")))
    };

    let served = match &built {
        BuiltContext::Context(ctx) => {
            if ctx.memory_count > 0 {
                splice_context(&mut payload, &state.context_role, &ctx.block);
            }
            Served {
                mode: ServeMode::Context,
                memories: ctx.memory_count,
            }
        }
        BuiltContext::Locked | BuiltContext::Degraded(_) => Served {
            mode: ServeMode::Degraded,
            memories: 0,
        },
    };
    tracing::info!(
        identity = %identity,
        mode = served.mode.as_str(),
        memories = served.memories,
        "forwarding chat completion"
    );

    // A locked ledger refuses the write anyway.
    let recorder = (built != BuiltContext::Locked).then(|| ExchangeRecorder {
        interpreter: Arc::clone(state.spine.interpreter()),
        identity,
        user_message,
    });

    let request = state.client.post(&url).json(&payload);
    state.forward(request, &headers, served, recorder).await
}

async fn list_models(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    let request = state.client.get(state.upstream_url("/v1/models"));
    state.forward(request, &headers, Served::PASSTHROUGH, None).await
}

/// Text of the last `user` message. Array content has its text parts joined.
fn last_user_message(payload: &Value) -> Option<String> {
    let message = payload
        .get("messages")?
        .as_array()?
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;

    let text = match message.get("content")? {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    (!text.trim().is_empty()).then_some(text)
}

/// Insert the memory block as its own message after any leading
/// instruction messages. Existing messages are left as they are.
fn splice_context(payload: &mut Value, role: &str, block: &str) {
    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let at = messages
        .iter()
        .take_while(|m| {
            matches!(
                m.get("role").and_then(Value::as_str),
                Some("system" | "developer")
            )
        })
        .count();
    messages.insert(at, json!({ "role": role, "content": block }));
}

// ---------------------------------------------------------------------------
// Health and admin
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<ProxyState>>) -> Json<Value> {
    let monitor = state.spine.monitor();
    let ledger = monitor.ledger();
    let lock_state = monitor.lock_state();
    Json(json!({
        "status": if lock_state.is_locked() { "locked" } else { "ok" },
        "lock_state": lock_state,
        "entries": ledger.len(),
        "head_hash": ledger.head(),
        "last_verified": monitor.last_snapshot().as_ref().map(snapshot_json),
    }))
}

fn snapshot_json(snapshot: &IntegritySnapshot) -> Value {
    json!({
        "status": snapshot.status,
        "verified_at": snapshot.verified_at_iso8601(),
        "entries_checked": snapshot.entries_checked,
        "checked_through": snapshot.checked_through,
        "violation_at": snapshot.violation_at,
        "reason": snapshot.reason,
        "head_hash": snapshot.head_hash,
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Admin routes exist only when a token is configured.
fn check_admin(state: &ProxyState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_json(StatusCode::NOT_FOUND, "admin routes are disabled"));
    };
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if constant_time_eq(expected.as_bytes(), token.as_bytes()) => Ok(()),
        _ => {
            tracing::warn!("admin request rejected: bad or missing token");
            Err(error_json(StatusCode::UNAUTHORIZED, "invalid admin token"))
        }
    }
}

async fn admin_verify(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_admin(&state, &headers) {
        return denied;
    }
    let monitor = Arc::clone(state.spine.monitor());
    match tokio::task::spawn_blocking(move || monitor.verify()).await {
        Ok(Ok(snapshot)) => Json(snapshot_json(&snapshot)).into_response(),
        Ok(Err(e)) => error_json(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn admin_reset(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_admin(&state, &headers) {
        return denied;
    }
    let monitor = Arc::clone(state.spine.monitor());
    let outcome = tokio::task::spawn_blocking(move || {
        let result = monitor.reanchor();
        (result, monitor.lock_state())
    })
    .await;

    match outcome {
        Ok((Ok(snapshot), lock_state)) => Json(json!({
            "lock_state": lock_state,
            "integrity": snapshot_json(&snapshot),
        }))
        .into_response(),
        Ok((Err(e @ SpineError::IntegrityViolation { .. }), lock_state)) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string(), "lock_state": lock_state })),
        )
            .into_response(),
        Ok((Err(e), _)) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn admin_reload_rights(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_admin(&state, &headers) {
        return denied;
    }
    let spine = state.spine.clone();
    match tokio::task::spawn_blocking(move || spine.reload_rights()).await {
        Ok(Ok(identities)) => Json(json!({ "identities": identities })).into_response(),
        Ok(Err(e)) => error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use axum::body::Body;
    use spine_core::{
        GENESIS_HASH, InterpreterConfig, LockCell, LockState, MemoryLedger, RightsClass,
        RightsRegistry, VolatileSink, decode_context,
    };
    use tempfile::TempDir;

    // --- mock model endpoint ---

    #[derive(Default)]
    struct Upstream {
        seen: Mutex<Vec<Value>>,
        /// Lets a `"stall"` stream continue past its first chunk.
        release: tokio::sync::Notify,
    }

    impl Upstream {
        fn last(&self) -> Value {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    const SSE_CHUNKS: [&str; 3] = [
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel",
        "\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    ];

    async fn mock_chat(State(upstream): State<Arc<Upstream>>, Json(body): Json<Value>) -> Response {
        upstream.seen.lock().unwrap().push(body.clone());
        if body["model"] == "broken" {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "model overloaded" })),
            )
                .into_response();
        }
        if body["model"] == "stall" {
            let stream = async_stream::stream! {
                yield Ok::<Bytes, std::io::Error>(Bytes::from_static(SSE_CHUNKS[0].as_bytes()));
                upstream.release.notified().await;
                for chunk in &SSE_CHUNKS[1..] {
                    yield Ok(Bytes::from_static(chunk.as_bytes()));
                }
            };
            return ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(stream)).into_response();
        }
        if body["model"] == "reset" {
            let stream = async_stream::stream! {
                yield Ok::<Bytes, std::io::Error>(Bytes::from_static(SSE_CHUNKS[0].as_bytes()));
                tokio::time::sleep(Duration::from_millis(50)).await;
                yield Err(std::io::Error::other("connection reset by model"));
            };
            return ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(stream)).into_response();
        }
        if body["stream"] == true {
            let chunks = SSE_CHUNKS
                .iter()
                .map(|c| Ok::<Bytes, std::io::Error>(Bytes::from_static(c.as_bytes())));
            return (
                [(CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(futures_util::stream::iter(chunks)),
            )
                .into_response();
        }
        Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "Miso, I remember." } }]
        }))
        .into_response()
    }

    async fn mock_models() -> Json<Value> {
        Json(json!({ "object": "list", "data": [{ "id": "llama3" }] }))
    }

    async fn spawn(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    // --- harness ---

    struct Harness {
        base: String,
        upstream: Arc<Upstream>,
        spine: Spine,
        client: reqwest::Client,
        dir: TempDir,
    }

    impl Harness {
        fn url(&self, path: &str) -> String {
            format!("{}{path}", self.base)
        }

        async fn chat(&self, identity: Option<&str>, body: Value) -> reqwest::Response {
            let mut request = self.client.post(self.url("/v1/chat/completions")).json(&body);
            if let Some(identity) = identity {
                request = request.header("x-spine-identity", identity);
            }
            request.send().await.unwrap()
        }
    }

    async fn harness_with(ledger: MemoryLedger, admin_token: Option<&str>) -> Harness {
        let token = admin_token.map(str::to_string);
        harness_configured(ledger, |config| config.admin.token = token).await
    }

    async fn harness_configured(
        ledger: MemoryLedger,
        configure: impl FnOnce(&mut SpineConfig),
    ) -> Harness {
        let upstream = Arc::new(Upstream::default());
        let upstream_addr = spawn(
            Router::new()
                .route("/v1/chat/completions", post(mock_chat))
                .route("/v1/models", get(mock_models))
                .with_state(Arc::clone(&upstream)),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let spine = Spine::from_parts(
            Arc::new(ledger),
            RightsRegistry::new().grant(
                "paul",
                &[RightsClass::UserSovereign, RightsClass::SymbioticFluid],
            ),
            InterpreterConfig::default(),
            dir.path().join("rights.toml"),
        );

        let mut config = SpineConfig::default();
        config.proxy.upstream_base_url = format!("http://{upstream_addr}/");
        configure(&mut config);
        let state = Arc::new(ProxyState::new(spine.clone(), &config).unwrap());
        let addr = spawn(create_router(state)).await;

        Harness {
            base: format!("http://{addr}"),
            upstream,
            spine,
            client: reqwest::Client::new(),
            dir,
        }
    }

    async fn harness() -> Harness {
        harness_with(MemoryLedger::in_memory(), None).await
    }

    fn tampered_ledger() -> MemoryLedger {
        let clean = MemoryLedger::in_memory();
        clean.append("my cat is called Miso", RightsClass::Agent).unwrap();
        clean.append("second note", RightsClass::Agent).unwrap();
        let mut entries = clean.read_all().to_vec();
        entries[1].content = "forged note".into();
        MemoryLedger::open(
            Box::new(VolatileSink::with_entries(entries)),
            Arc::new(LockCell::new()),
            None,
        )
        .unwrap()
    }

    fn header<'a>(response: &'a reqwest::Response, name: &str) -> &'a str {
        response.headers()[name].to_str().unwrap()
    }

    // --- pure helpers ---

    #[test]
    fn test_last_user_message_variants() {
        let payload = json!({ "messages": [
            { "role": "user", "content": "first" },
            { "role": "assistant", "content": "reply" },
            { "role": "user", "content": [
                { "type": "text", "text": "look at" },
                { "type": "image_url", "image_url": { "url": "data:..." } },
                { "type": "text", "text": "this" }
            ]}
        ]});
        assert_eq!(last_user_message(&payload).as_deref(), Some("look at\nthis"));

        let none = json!({ "messages": [{ "role": "system", "content": "rules" }] });
        assert_eq!(last_user_message(&none), None);
        let blank = json!({ "messages": [{ "role": "user", "content": "  " }] });
        assert_eq!(last_user_message(&blank), None);
        assert_eq!(last_user_message(&json!({ "prompt": "x" })), None);
    }

    #[test]
    fn test_splice_after_leading_instructions() {
        let mut payload = json!({ "messages": [
            { "role": "system", "content": "be brief" },
            { "role": "developer", "content": "json only" },
            { "role": "user", "content": "hi" }
        ]});
        splice_context(&mut payload, "system", "<block/>");
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2], json!({ "role": "system", "content": "<block/>" }));
        assert_eq!(messages[3], json!({ "role": "user", "content": "hi" }));

        let mut bare = json!({ "messages": [{ "role": "user", "content": "hi" }] });
        splice_context(&mut bare, "system", "<block/>");
        assert_eq!(bare["messages"][0]["content"], "<block/>");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"token", b"token2"));
    }

    // --- end to end through the mock model ---

    #[tokio::test]
    async fn test_memory_spliced_and_exchange_recorded() {
        let h = harness().await;
        h.spine
            .interpreter()
            .commit_memory("paul", RightsClass::UserSovereign, "my cat is called Miso")
            .unwrap();

        let user_turn = json!({ "role": "user", "content": "what is my cat called?" });
        let response = h
            .chat(
                Some("paul"),
                json!({
                    "model": "llama3",
                    "messages": [{ "role": "system", "content": "be brief" }, user_turn],
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, MODE_HEADER), "context");
        assert_eq!(header(&response, MEMORIES_HEADER), "1");
        let reply: Value = response.json().await.unwrap();
        assert_eq!(reply["choices"][0]["message"]["content"], "Miso, I remember.");

        let sent = h.upstream.last();
        let messages = sent["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], "be brief");
        assert_eq!(messages[1]["role"], "system");
        let decoded = decode_context(messages[1]["content"].as_str().unwrap()).unwrap();
        assert_eq!(decoded[0].content, "my cat is called Miso");
        assert_eq!(messages[2], user_turn);

        let ledger = h.spine.ledger();
        assert_eq!(ledger.len(), 2);
        let recorded = ledger.read_all()[1].clone();
        assert_eq!(
            recorded.content,
            "USER: what is my cat called?\nASSISTANT: Miso, I remember."
        );
        assert_eq!(recorded.author_rights, RightsClass::SymbioticFluid);
    }

    #[tokio::test]
    async fn test_stream_relayed_byte_for_byte() {
        let h = harness().await;
        let response = h
            .chat(
                None,
                json!({
                    "model": "llama3",
                    "stream": true,
                    "user": "guest",
                    "messages": [{ "role": "user", "content": "hi there" }],
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "content-type").starts_with("text/event-stream"));
        assert_eq!(header(&response, MODE_HEADER), "context");
        assert_eq!(header(&response, MEMORIES_HEADER), "0");
        assert_eq!(response.text().await.unwrap(), SSE_CHUNKS.concat());

        assert_eq!(h.upstream.last()["messages"].as_array().unwrap().len(), 1);
        let recorded = h.spine.ledger().read_all()[0].clone();
        assert_eq!(recorded.content, "USER: hi there\nASSISTANT: Hello");
        assert_eq!(recorded.author_rights, RightsClass::Agent);
    }

    #[tokio::test]
    async fn test_first_chunk_relayed_before_upstream_finishes() {
        let h = harness().await;
        let mut response = h
            .chat(
                Some("guest"),
                json!({
                    "model": "stall",
                    "stream": true,
                    "messages": [{ "role": "user", "content": "hi there" }],
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let first = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("first chunk held back until the stream ended")
            .unwrap()
            .unwrap();
        assert!(!first.is_empty());
        assert!(SSE_CHUNKS[0].as_bytes().starts_with(&first));
        assert!(h.spine.ledger().is_empty());

        h.upstream.release.notify_one();
        let mut relayed = first.to_vec();
        while let Some(chunk) = response.chunk().await.unwrap() {
            relayed.extend_from_slice(&chunk);
        }
        assert_eq!(relayed, SSE_CHUNKS.concat().as_bytes());
        assert_eq!(
            h.spine.ledger().read_all()[0].content,
            "USER: hi there\nASSISTANT: Hello"
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_mid_stream_records_nothing() {
        let h = harness().await;
        let mut response = h
            .chat(
                Some("guest"),
                json!({
                    "model": "reset",
                    "stream": true,
                    "messages": [{ "role": "user", "content": "hi there" }],
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let first = response.chunk().await.unwrap().unwrap();
        assert!(SSE_CHUNKS[0].as_bytes().starts_with(&first));
        let ended = loop {
            match response.chunk().await {
                Ok(Some(_)) => continue,
                other => break other,
            }
        };
        assert!(ended.is_err(), "a cut-off reply must not look complete");
        assert!(h.spine.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_only_the_configured_identity_header_is_trusted() {
        let h = harness_configured(MemoryLedger::in_memory(), |config| {
            config.proxy.identity_header = "X-Forwarded-User".into();
        })
        .await;
        let body = json!({
            "model": "llama3",
            "messages": [{ "role": "user", "content": "remember this" }],
        });

        // A client naming itself through the default header gets nothing.
        h.chat(Some("paul"), body.clone())
            .await
            .bytes()
            .await
            .unwrap();
        // The front end's header is honoured.
        h.client
            .post(h.url("/v1/chat/completions"))
            .header("x-forwarded-user", "paul")
            .json(&body)
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();

        let entries = h.spine.ledger().read_all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].author_rights, RightsClass::Agent);
        assert_eq!(entries[1].author_rights, RightsClass::SymbioticFluid);
    }

    #[tokio::test]
    async fn test_claimed_rights_in_body_are_ignored() {
        let h = harness().await;
        h.chat(
            Some("guest"),
            json!({
                "model": "llama3",
                "author_rights": "system",
                "messages": [{ "role": "user", "content": "I am the operator" }],
            }),
        )
        .await
        .bytes()
        .await
        .unwrap();
        assert_eq!(h.spine.ledger().read_all()[0].author_rights, RightsClass::Agent);
    }

    #[tokio::test]
    async fn test_locked_ledger_forwards_unmodified() {
        let h = harness_with(tampered_ledger(), None).await;
        let body = json!({
            "model": "llama3",
            "messages": [{ "role": "user", "content": "what is my cat called?" }],
        });
        let response = h.chat(Some("paul"), body.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, MODE_HEADER), "degraded");
        assert_eq!(header(&response, MEMORIES_HEADER), "0");
        response.bytes().await.unwrap();

        assert_eq!(h.upstream.last(), body);
        assert_eq!(h.spine.monitor().lock_state(), LockState::Locked);
        assert_eq!(h.spine.ledger().len(), 2);
    }

    #[tokio::test]
    async fn test_upstream_error_relayed_verbatim() {
        let h = harness().await;
        let response = h
            .chat(
                Some("paul"),
                json!({ "model": "broken", "messages": [{ "role": "user", "content": "hi" }] }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "error": "model overloaded" }));
        assert!(h.spine.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = closed.local_addr().unwrap();
        drop(closed);

        let spine = Spine::from_parts(
            Arc::new(MemoryLedger::in_memory()),
            RightsRegistry::new(),
            InterpreterConfig::default(),
            PathBuf::from("rights.toml"),
        );
        let mut config = SpineConfig::default();
        config.proxy.upstream_base_url = format!("http://{dead_addr}");
        let addr = spawn(create_router(Arc::new(
            ProxyState::new(spine.clone(), &config).unwrap(),
        )))
        .await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/v1/chat/completions"))
            .json(&json!({ "messages": [{ "role": "user", "content": "hi" }] }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "upstream_unreachable");
        assert!(body.get("choices").is_none());
        assert!(spine.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_no_user_message_passes_through() {
        let h = harness().await;
        let body = json!({
            "model": "llama3",
            "messages": [{ "role": "system", "content": "warm up" }],
        });
        let response = h.chat(Some("paul"), body.clone()).await;
        assert_eq!(header(&response, MODE_HEADER), "passthrough");
        response.bytes().await.unwrap();
        assert_eq!(h.upstream.last(), body);
        assert!(h.spine.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_non_json_body_passes_through() {
        let h = harness().await;
        let response = h
            .client
            .post(h.url("/v1/chat/completions"))
            .header(CONTENT_TYPE, "text/plain")
            .body("hello?")
            .send()
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        assert_eq!(header(&response, MODE_HEADER), "passthrough");
        assert!(h.spine.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_models_listing_relayed() {
        let h = harness().await;
        let response = h.client.get(h.url("/v1/models")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"][0]["id"], "llama3");
    }

    #[tokio::test]
    async fn test_health_reports_lock_and_head() {
        let h = harness().await;
        let body: Value = h
            .client
            .get(h.url("/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["lock_state"], "open");
        assert_eq!(body["entries"], 0);
        assert_eq!(body["head_hash"], GENESIS_HASH);
        assert!(body["last_verified"].is_null());
    }

    #[tokio::test]
    async fn test_admin_routes_disabled_without_token() {
        let h = harness().await;
        let response = h.client.post(h.url("/admin/verify")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_requires_bearer_token() {
        let h = harness_with(MemoryLedger::in_memory(), Some("s3cret")).await;
        let missing = h.client.post(h.url("/admin/verify")).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        let wrong = h
            .client
            .post(h.url("/admin/verify"))
            .bearer_auth("guess")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = h
            .client
            .post(h.url("/admin/verify"))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body: Value = ok.json().await.unwrap();
        assert_eq!(body["status"], "secure");
    }

    #[tokio::test]
    async fn test_admin_reset_refuses_compromised_ledger() {
        let h = harness_with(tampered_ledger(), Some("s3cret")).await;
        let verify: Value = h
            .client
            .post(h.url("/admin/verify"))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(verify["status"], "compromised");
        assert_eq!(verify["violation_at"], 1);

        let reset = h
            .client
            .post(h.url("/admin/reset"))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::CONFLICT);
        let body: Value = reset.json().await.unwrap();
        assert_eq!(body["lock_state"], "locked");
        assert_eq!(h.spine.monitor().lock_state(), LockState::Locked);

        let health: Value = h
            .client
            .get(h.url("/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "locked");
        assert_eq!(health["last_verified"]["status"], "compromised");
    }

    #[tokio::test]
    async fn test_admin_reset_on_intact_ledger() {
        let h = harness_with(MemoryLedger::in_memory(), Some("s3cret")).await;
        h.spine.ledger().append("fine", RightsClass::Agent).unwrap();
        let reset = h
            .client
            .post(h.url("/admin/reset"))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::OK);
        let body: Value = reset.json().await.unwrap();
        assert_eq!(body["lock_state"], "open");
        assert_eq!(body["integrity"]["entries_checked"], 1);
    }

    #[tokio::test]
    async fn test_admin_rights_reload() {
        let h = harness_with(MemoryLedger::in_memory(), Some("s3cret")).await;
        std::fs::write(
            h.dir.path().join("rights.toml"),
            "[identities]\nops = [\"system\"]\n",
        )
        .unwrap();
        let response = h
            .client
            .post(h.url("/admin/rights/reload"))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["identities"], 1);
        assert!(h.spine.guard().authorize(RightsClass::System, "ops").is_ok());
    }
}
