use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorState, IngestStats, RelayStatus};
use crate::discovery::{DiscoveryStats, RelayRecommendation};
use crate::topics::{TopicInsight, TopicSummary};

const RECENT_MESSAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct ApiServer {
    bind_address: String,
}

#[derive(Debug, Deserialize)]
pub struct TopicsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct SelectTopicRequest {
    pub topic: String,
}

#[derive(Debug, Deserialize)]
pub struct RelayRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: i64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub ingest: IngestStats,
    pub discovery: DiscoveryStats,
}

#[derive(Debug, Serialize)]
pub struct TopicsResponse {
    pub topics: Vec<TopicSummary>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: String,
    pub author: String,
    pub author_name: String,
    pub created_at: u64,
    pub arrived_at_ms: i64,
    pub kind: u16,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct TopicDetailResponse {
    #[serde(flatten)]
    pub insight: TopicInsight,
    pub messages: Vec<MessageResponse>,
}

#[derive(Debug, Serialize)]
pub struct SelectedTopicResponse {
    pub topic: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RelaysResponse {
    pub relays: Vec<RelayStatus>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct RelayChangeResponse {
    pub success: bool,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecommendationsResponse {
    pub relays: Vec<RelayRecommendation>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub imported: usize,
}

fn default_limit() -> usize {
    50
}

impl ApiServer {
    pub fn new(bind_address: String) -> Self {
        Self { bind_address }
    }

    pub async fn start(&self, state: Arc<CoordinatorState>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.bind_address))?;

        info!("API server listening on {}", self.bind_address);

        axum::serve(listener, router(state))
            .await
            .with_context(|| "API server error")?;

        Ok(())
    }
}

pub fn router(state: Arc<CoordinatorState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/topics", get(handle_topics))
        .route("/topics/select", post(handle_select_topic))
        .route("/topics/selected", get(handle_selected_topic))
        .route("/topics/{topic}", get(handle_topic))
        .route(
            "/relays",
            get(handle_relays)
                .post(handle_add_relay)
                .delete(handle_remove_relay),
        )
        .route("/recommendations", get(handle_recommendations))
        .route(
            "/recommendations/state",
            get(handle_export_state).put(handle_import_state),
        )
        .with_state(state)
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        time: chrono::Utc::now().timestamp(),
    })
}

async fn handle_stats(State(state): State<Arc<CoordinatorState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        ingest: state.stats().await,
        discovery: state.discovery_stats().await,
    })
}

async fn handle_topics(
    State(state): State<Arc<CoordinatorState>>,
    Query(query): Query<TopicsQuery>,
) -> Json<TopicsResponse> {
    let topics = state.ranked_topics(query.limit).await;
    Json(TopicsResponse {
        count: topics.len(),
        topics,
    })
}

async fn handle_topic(
    State(state): State<Arc<CoordinatorState>>,
    Path(topic): Path<String>,
) -> Result<Json<TopicDetailResponse>, StatusCode> {
    let insight = state
        .topic_insight(&topic)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    let recent = state.topic_messages(&topic, RECENT_MESSAGES).await;
    let authors: Vec<String> = recent.iter().map(|m| m.message.author.clone()).collect();
    let names = state.display_names(&authors).await;

    let messages = recent
        .into_iter()
        .map(|indexed| {
            let msg = indexed.message;
            MessageResponse {
                author_name: names.get(&msg.author).cloned().unwrap_or_default(),
                id: msg.id,
                author: msg.author,
                created_at: msg.created_at,
                arrived_at_ms: indexed.arrived_at_ms,
                kind: msg.kind,
                content: msg.content,
            }
        })
        .collect();

    Ok(Json(TopicDetailResponse { insight, messages }))
}

async fn handle_select_topic(
    State(state): State<Arc<CoordinatorState>>,
    Json(request): Json<SelectTopicRequest>,
) -> Json<SelectedTopicResponse> {
    debug!("Selecting topic {:?}", request.topic);
    state.select_topic(&request.topic).await;
    Json(SelectedTopicResponse {
        topic: state.selected_topic().await,
    })
}

async fn handle_selected_topic(
    State(state): State<Arc<CoordinatorState>>,
) -> Json<SelectedTopicResponse> {
    Json(SelectedTopicResponse {
        topic: state.selected_topic().await,
    })
}

async fn handle_relays(State(state): State<Arc<CoordinatorState>>) -> Json<RelaysResponse> {
    let relays = state.relay_statuses().await;
    Json(RelaysResponse {
        count: relays.len(),
        relays,
    })
}

async fn handle_add_relay(
    State(state): State<Arc<CoordinatorState>>,
    Json(request): Json<RelayRequest>,
) -> (StatusCode, Json<RelayChangeResponse>) {
    match state.add_relay(&request.url).await {
        Ok(changed) => (
            StatusCode::OK,
            Json(RelayChangeResponse {
                success: true,
                changed,
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(RelayChangeResponse {
                success: false,
                changed: false,
                error: Some(format!("{:#}", e)),
            }),
        ),
    }
}

async fn handle_remove_relay(
    State(state): State<Arc<CoordinatorState>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> (StatusCode, Json<RelayChangeResponse>) {
    let Some(url) = params.get("url") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(RelayChangeResponse {
                success: false,
                changed: false,
                error: Some("Missing url parameter".to_string()),
            }),
        );
    };

    match state.remove_relay(url).await {
        Ok(true) => (
            StatusCode::OK,
            Json(RelayChangeResponse {
                success: true,
                changed: true,
                error: None,
            }),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(RelayChangeResponse {
                success: false,
                changed: false,
                error: Some(format!("Relay not monitored: {}", url)),
            }),
        ),
        Err(e) => {
            warn!("Relay removal failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RelayChangeResponse {
                    success: false,
                    changed: true,
                    error: Some(format!("{:#}", e)),
                }),
            )
        }
    }
}

async fn handle_recommendations(
    State(state): State<Arc<CoordinatorState>>,
) -> Json<RecommendationsResponse> {
    let relays = state.recommended().await;
    Json(RecommendationsResponse {
        count: relays.len(),
        relays,
    })
}

async fn handle_export_state(State(state): State<Arc<CoordinatorState>>) -> Json<Value> {
    Json(state.export_recommendations().await)
}

async fn handle_import_state(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<Value>,
) -> Result<Json<ImportResponse>, StatusCode> {
    if !body.is_object() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let imported = state.import_recommendations(&body).await;
    info!("Imported {} relay endorsement entries", imported);
    Ok(Json(ImportResponse { imported }))
}
