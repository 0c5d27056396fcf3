use anyhow::Result;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use companion_scheduler::{
    DayPlanner, DueSweep, EventScheduler, EventStore, GenerationClient, MemoryActivitySource,
    MemoryClient, WebhookExecutor,
};
use companion_schemas::{CreateEventRequest, EventId, PersonaId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use tracing_subscriber;

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<EventStore>>,
    memory: Arc<MemoryClient>,
    planner: Arc<DayPlanner>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Companion Scheduler Service v0.1.0");

    // Initialize event store
    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "companion-events.db".to_string());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Arc::new(Mutex::new(EventStore::new(&db_path)?));
    info!("Event store initialized at: {}", db_path);

    let memory = Arc::new(MemoryClient::from_env());
    let generation = Arc::new(GenerationClient::from_env()?);

    let scheduler = Arc::new(EventScheduler::new(
        store.clone(),
        Arc::new(MemoryActivitySource::new(memory.clone())),
        Arc::new(WebhookExecutor::new(memory.clone(), generation.clone())),
    ));

    // Background due-event sweep
    let sweep = DueSweep::new(store.clone(), scheduler);
    tokio::spawn(sweep.run());

    let state = AppState {
        store,
        memory,
        planner: Arc::new(DayPlanner::new(generation)),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        // Events
        .route("/events", post(create_event))
        .route("/events/due", get(list_due_events))
        .route("/events/:event_id", get(get_event))
        .route("/events/:event_id/cancel", post(cancel_event))
        .route("/personas/:persona_id/events", get(list_persona_events))
        // Day planning
        .route("/plan/:persona_id", post(plan_day))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:21871".to_string());
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "scheduler",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    error!("Request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn create_event(
    State(state): State<AppState>,
    Json(request): Json<CreateEventRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if DateTime::parse_from_rfc3339(&request.scheduled_at).is_err() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("scheduled_at is not RFC3339: {}", request.scheduled_at),
        ));
    }

    let store = state.store.lock().await;
    let event = store.create_event(&request).map_err(internal_error)?;

    info!("Created event {} for {}", event.id, event.persona_id);
    Ok((StatusCode::CREATED, Json(event)))
}

async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let event_id = EventId(event_id);
    let store = state.store.lock().await;

    let event = store
        .get_event(&event_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("event {} not found", event_id),
            )
        })?;

    Ok(Json(event))
}

async fn list_due_events(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let now = Utc::now().to_rfc3339();
    let store = state.store.lock().await;
    let events = store.due_events(&now).map_err(internal_error)?;

    Ok(Json(serde_json::json!({ "events": events })))
}

async fn list_persona_events(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let store = state.store.lock().await;
    let events = store
        .events_for_persona(&PersonaId(persona_id))
        .map_err(internal_error)?;

    Ok(Json(serde_json::json!({ "events": events })))
}

async fn cancel_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let event_id = EventId(event_id);
    let store = state.store.lock().await;

    let cancelled = store.cancel(&event_id).map_err(internal_error)?;
    if !cancelled {
        return Err((
            StatusCode::CONFLICT,
            format!("event {} is terminal or unknown", event_id),
        ));
    }

    Ok(Json(serde_json::json!({ "status": "cancelled" })))
}

/// Generate and store today's proactive schedule for a persona. The persona
/// definition lives in the memory service.
async fn plan_day(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let persona_id = PersonaId(persona_id);

    let persona = state
        .memory
        .fetch_persona(&persona_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("persona {} not found", persona_id),
            )
        })?;

    let planned = state
        .planner
        .plan_day(&state.store, &persona, persona.user_id.clone())
        .await
        .map_err(internal_error)?;

    Ok(Json(serde_json::json!({ "planned": planned })))
}
