use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lostlink_shared::{Identity, TopicKey, TopicKind};
use lostlink_store::{BlockEdge, Database, MatchSuggestion, Message};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::analysis::{AnalysisJob, AnalysisPool, Candidate, Embedder, MatchPublisher};
use crate::chat::{ChatService, ConversationSummary};
use crate::config::ServerConfig;
use crate::db::Db;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::topics::TopicPublisher;
use crate::{streams, ws};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub chat: ChatService,
    pub registry: ConnectionRegistry,
    pub publisher: MatchPublisher,
    pub analysis: Option<AnalysisPool>,
    pub rate_limiter: RateLimiter,
    pub event_limiter: RateLimiter<Identity>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the shared components around an open database. Match analysis
    /// runs only when an embedder is supplied.
    pub fn new(
        config: ServerConfig,
        database: Database,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        let db = Db::new(database);
        let registry = ConnectionRegistry::new(config.channel_buffer);
        let publisher: MatchPublisher = TopicPublisher::new(config.channel_buffer);
        let chat = ChatService::new(db.clone(), registry.clone());

        let analysis = embedder.map(|embedder| {
            AnalysisPool::start(
                config.analysis_workers,
                config.analysis_queue,
                config.match_limit,
                embedder,
                db.clone(),
                publisher.clone(),
            )
        });

        Self {
            db,
            chat,
            registry,
            publisher,
            analysis,
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            event_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            config: Arc::new(config),
        }
    }
}

/// The identity an upstream auth proxy verified for this request, read
/// from the configured header and normalized.
pub struct AuthenticatedIdentity(pub Identity);

impl FromRequestParts<AppState> for AuthenticatedIdentity {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(&state.config.identity_header)
            .and_then(|v| v.to_str().ok());
        Identity::from_optional(raw)
            .map(AuthenticatedIdentity)
            .map_err(|_| ServerError::Unauthenticated)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/api/chat/history", get(chat_history))
        .route("/api/chat/conversations", get(chat_conversations))
        .route("/api/chat/undelivered", get(chat_undelivered))
        .route("/api/chat/markRead", post(chat_mark_read))
        .route("/api/chat/block", post(chat_block))
        .route("/api/chat/blocked", get(chat_blocked))
        .route("/api/matches/analyze", post(matches_analyze))
        .route("/api/matches/{kind}/{id}", get(matches_list))
        .route("/api/stream/matches/{kind}/{id}", get(streams::match_stream))
        .route("/ws/chat", get(ws::chat_socket))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online_identities: usize,
    match_subscriptions: usize,
    analysis_enabled: bool,
}

#[derive(Deserialize)]
struct PartnerQuery {
    with: String,
}

#[derive(Deserialize)]
struct BlockQuery {
    with: String,
    reason: Option<String>,
}

#[derive(Serialize)]
struct BlockStatusResponse {
    blocked: bool,
}

#[derive(Serialize)]
struct MarkReadResponse {
    marked: usize,
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    kind: TopicKind,
    id: i64,
    description: String,
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct AnalyzeQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    topic: String,
    queued: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online_identities: state.registry.online_count().await,
        match_subscriptions: state.publisher.total_subscribers().await,
        analysis_enabled: state.analysis.is_some(),
    })
}

async fn chat_history(
    AuthenticatedIdentity(me): AuthenticatedIdentity,
    State(state): State<AppState>,
    Query(query): Query<PartnerQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let partner = Identity::new(&query.with)?;
    Ok(Json(state.chat.conversation(&me, &partner).await?))
}

async fn chat_conversations(
    AuthenticatedIdentity(me): AuthenticatedIdentity,
    State(state): State<AppState>,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    Ok(Json(state.chat.list_conversations(&me).await?))
}

async fn chat_undelivered(
    AuthenticatedIdentity(me): AuthenticatedIdentity,
    State(state): State<AppState>,
) -> Result<Json<Vec<Message>>, ServerError> {
    Ok(Json(state.chat.undelivered_for(&me).await?))
}

async fn chat_mark_read(
    AuthenticatedIdentity(me): AuthenticatedIdentity,
    State(state): State<AppState>,
    Query(query): Query<PartnerQuery>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let partner = Identity::new(&query.with)?;
    let marked = state
        .chat
        .mark_delivered_for_conversation(&me, &partner)
        .await?;
    Ok(Json(MarkReadResponse { marked }))
}

async fn chat_block(
    AuthenticatedIdentity(me): AuthenticatedIdentity,
    State(state): State<AppState>,
    Query(query): Query<BlockQuery>,
) -> Result<Json<BlockEdge>, ServerError> {
    let partner = Identity::new(&query.with)?;
    let reason = query.reason.as_deref().filter(|r| !r.trim().is_empty());

    let edge = state.chat.block_user(&me, &partner, reason).await?;
    let closed = state.registry.force_disconnect(&[&me, &partner]).await;

    info!(blocker = %me, blocked = %partner, closed, "user blocked");
    Ok(Json(edge))
}

async fn chat_blocked(
    AuthenticatedIdentity(me): AuthenticatedIdentity,
    State(state): State<AppState>,
    Query(query): Query<PartnerQuery>,
) -> Result<Json<BlockStatusResponse>, ServerError> {
    let partner = Identity::new(&query.with)?;
    let blocked = state.chat.is_blocked_between(&me, &partner).await?;
    Ok(Json(BlockStatusResponse { blocked }))
}

async fn matches_analyze(
    AuthenticatedIdentity(requester): AuthenticatedIdentity,
    State(state): State<AppState>,
    Query(query): Query<AnalyzeQuery>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Response, ServerError> {
    let pool = state.analysis.as_ref().ok_or(ServerError::AnalysisDisabled)?;
    let subject = TopicKey {
        kind: req.kind,
        id: req.id,
    };

    let ticket = pool.submit(AnalysisJob {
        subject,
        description: req.description,
        candidates: req.candidates,
    })?;
    info!(requester = %requester, topic = %subject, wait = query.wait, "match analysis queued");

    // By default results reach viewers through the topic stream only.
    if query.wait {
        let scores = ticket.wait().await?;
        return Ok(Json(scores).into_response());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(AnalyzeResponse {
            topic: subject.to_string(),
            queued: pool.queued(),
        }),
    )
        .into_response())
}

async fn matches_list(
    AuthenticatedIdentity(_viewer): AuthenticatedIdentity,
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<Json<Vec<MatchSuggestion>>, ServerError> {
    let key = TopicKey {
        kind: kind.parse()?,
        id,
    };
    Ok(Json(state.db.call(move |db| db.suggestions_for(&key)).await?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    AppState::new(
        ServerConfig::default(),
        Database::open_in_memory().expect("in-memory database"),
        None,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::Body;
    use axum::http::{header, Request};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use tower::ServiceExt;

    use super::*;

    const USER_HEADER: &str = "x-authenticated-user";

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn get(uri: &str, user: Option<&str>) -> Request<Body> {
        request(Method::GET, uri, user, Body::empty())
    }

    fn request(method: Method, uri: &str, user: Option<&str>, body: Body) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        builder.body(body).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(test_state());
        let response = app.oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_identity_is_rejected() {
        let app = build_router(test_state());
        for uri in ["/api/chat/conversations", "/api/chat/history?with=b@x.org", "/ws/chat"] {
            let response = app.clone().oneshot(get(uri, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
        let blank = app.oneshot(get("/api/chat/undelivered", Some("  "))).await.unwrap();
        assert_eq!(blank.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_history_and_conversations() {
        let state = test_state();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        state.chat.send(&a, &b, "hello").await.unwrap();
        state.chat.send(&b, &a, "hi back").await.unwrap();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(get("/api/chat/history?with=B@campus.edu", Some("A@campus.edu")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let history = json(response).await;
        assert_eq!(history.as_array().unwrap().len(), 2);
        assert_eq!(history[0]["text"], "hello");
        assert!(history[0].get("createdAt").is_some());

        let response = app
            .oneshot(get("/api/chat/conversations", Some("a@campus.edu")))
            .await
            .unwrap();
        let inbox = json(response).await;
        assert_eq!(inbox[0]["partnerIdentity"], "b@campus.edu");
        assert!(inbox[0].get("partner").is_none());
        assert_eq!(inbox[0]["lastText"], "hi back");
        assert_eq!(inbox[0]["unreadCount"], 1);
    }

    #[tokio::test]
    async fn test_mark_read_and_undelivered() {
        let state = test_state();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        state.chat.send(&a, &b, "1").await.unwrap();
        state.chat.send(&a, &b, "2").await.unwrap();
        let app = build_router(state);

        let pending = json(
            app.clone()
                .oneshot(get("/api/chat/undelivered", Some("b@campus.edu")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(pending.as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/chat/markRead?with=a@campus.edu",
                Some("b@campus.edu"),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(json(response).await["marked"], 2);

        let pending = json(
            app.oneshot(get("/api/chat/undelivered", Some("b@campus.edu")))
                .await
                .unwrap(),
        )
        .await;
        assert!(pending.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_block_purges_and_disconnects() {
        let state = test_state();
        let a = id("a@campus.edu");
        let b = id("b@campus.edu");
        for text in ["1", "2", "3"] {
            state.chat.send(&a, &b, text).await.unwrap();
        }
        let (tx_a, _rx_a) = state.registry.channel();
        let (tx_b, _rx_b) = state.registry.channel();
        state.registry.register(&a, tx_a).await;
        state.registry.register(&b, tx_b).await;

        let app = build_router(state.clone());
        let response = app
            .oneshot(request(
                Method::POST,
                "/api/chat/block?with=b@campus.edu&reason=harassment",
                Some("a@campus.edu"),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let edge = json(response).await;
        assert_eq!(edge["blocker"], "a@campus.edu");
        assert_eq!(edge["reason"], "harassment");

        assert!(state.chat.conversation(&a, &b).await.unwrap().is_empty());
        assert!(state.registry.channels_for(&a).await.is_empty());
        assert!(state.registry.channels_for(&b).await.is_empty());
        assert!(matches!(
            state.chat.send(&b, &a, "again").await,
            Err(ServerError::Blocked)
        ));
    }

    #[tokio::test]
    async fn test_block_status_is_symmetric() {
        let state = test_state();
        let app = build_router(state.clone());
        let status = |user: &'static str| {
            app.clone()
                .oneshot(get("/api/chat/blocked?with=b@campus.edu", Some(user)))
        };

        assert_eq!(json(status("a@campus.edu").await.unwrap()).await["blocked"], false);

        state
            .chat
            .block_user(&id("b@campus.edu"), &id("a@campus.edu"), None)
            .await
            .unwrap();
        assert_eq!(json(status("a@campus.edu").await.unwrap()).await["blocked"], true);
    }

    #[tokio::test]
    async fn test_match_stream_subscribes() {
        let state = test_state();
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(get("/api/stream/matches/found/42", Some("a@campus.edu")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
        assert_eq!(state.publisher.subscriber_count(&TopicKey::found(42)).await, 1);

        let bad = app
            .oneshot(get("/api/stream/matches/stolen/1", Some("a@campus.edu")))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        // Dropping the response body stands in for the viewer going away.
        drop(response);
        let key = TopicKey::found(42);
        for _ in 0..100 {
            if state.publisher.subscriber_count(&key).await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(state.publisher.subscriber_count(&key).await, 0);
    }

    #[tokio::test]
    async fn test_analyze_disabled_without_embedder() {
        let app = build_router(test_state());
        let body = Body::from(r#"{"kind":"found","id":1,"description":"wallet","candidates":[]}"#);
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/matches/analyze")
                    .header(USER_HEADER, "a@campus.edu")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    struct FixedEmbedder(HashMap<&'static str, Vec<f64>>);

    impl Embedder for FixedEmbedder {
        fn embed<'a>(&'a self, description: &'a str) -> BoxFuture<'a, Option<Vec<f64>>> {
            let vector = self.0.get(description).cloned();
            async move { vector }.boxed()
        }
    }

    #[tokio::test]
    async fn test_analyze_then_list_suggestions() {
        let embedder: Arc<dyn Embedder> = Arc::new(FixedEmbedder(HashMap::from([
            ("black wallet", vec![1.0, 0.0]),
            ("wallet", vec![0.8, 0.2]),
        ])));
        let state = AppState::new(
            ServerConfig::default(),
            Database::open_in_memory().unwrap(),
            Some(embedder),
        );
        let mut viewer = state
            .publisher
            .subscribe(TopicKey::lost(5), std::time::Duration::from_secs(60))
            .await;
        let app = build_router(state);

        let body = Body::from(
            r#"{"kind":"lost","id":5,"description":"black wallet",
                "candidates":[{"id":9,"description":"wallet"}]}"#,
        );
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/matches/analyze")
                    .header(USER_HEADER, "a@campus.edu")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json(response).await["topic"], "lost:5");

        let published = viewer.rx.recv().await.unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].found_item_id, 9);

        let listed = json(
            app.oneshot(get("/api/matches/lost/5", Some("a@campus.edu")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listed[0]["foundItemId"], 9);
        assert_eq!(listed[0]["lostItemId"], 5);
    }

    #[tokio::test]
    async fn test_analyze_wait_returns_ranked_scores() {
        let embedder: Arc<dyn Embedder> = Arc::new(FixedEmbedder(HashMap::from([
            ("red bike", vec![1.0, 0.0]),
            ("bike", vec![0.9, 0.1]),
            ("umbrella", vec![-1.0, 0.0]),
        ])));
        let state = AppState::new(
            ServerConfig::default(),
            Database::open_in_memory().unwrap(),
            Some(embedder),
        );
        let app = build_router(state);

        let body = Body::from(
            r#"{"kind":"found","id":3,"description":"red bike",
                "candidates":[{"id":1,"description":"umbrella"},{"id":2,"description":"bike"}]}"#,
        );
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/matches/analyze?wait=true")
                    .header(USER_HEADER, "a@campus.edu")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let scores = json(response).await;
        let scores = scores.as_array().unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0]["foundItemId"], 3);
        assert_eq!(scores[0]["lostItemId"], 2);
    }
}
