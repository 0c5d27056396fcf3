use anyhow::Result;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use companion_memory::{
    Consolidator, Database, LlmClient, Reconciler, ReconciliationWorker, RelevanceSelector,
};
use companion_schemas::{
    generate_persona_id, CreatePersonaRequest, FactsResponse, Persona, PersonaId, ReconcileRequest,
    SelectRequest, UpsertFactRequest, UserId,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use tracing_subscriber;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    selector: Arc<RelevanceSelector>,
    reconciler: Arc<Reconciler>,
    consolidator: Arc<Consolidator>,
    queue: mpsc::UnboundedSender<ReconcileRequest>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Companion Memory Service v0.1.0");

    // Initialize database
    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "companion-memory.db".to_string());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Arc::new(Mutex::new(Database::new(&db_path)?));
    info!("Database initialized at: {}", db_path);

    let reconciler = Arc::new(Reconciler::new(LlmClient::from_env()?));
    let consolidator = Arc::new(Consolidator::new(LlmClient::from_env()?));

    // Background reconciliation: the chat path enqueues and moves on
    let (queue, receiver) = mpsc::unbounded_channel();
    let worker = ReconciliationWorker::new(db.clone(), reconciler.clone(), receiver);
    tokio::spawn(worker.run());

    let state = AppState {
        db,
        selector: Arc::new(RelevanceSelector::new()),
        reconciler,
        consolidator,
        queue,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        // Retrieval
        .route("/facts/select", post(select_facts))
        .route("/facts/upsert", post(upsert_fact))
        .route("/facts/:persona_id", get(list_facts))
        // Reconciliation
        .route("/reconcile", post(enqueue_reconcile))
        .route("/reconcile/sync", post(reconcile_now))
        // Consolidation
        .route("/consolidate/:persona_id", post(consolidate))
        // Activity tracking
        .route("/activity/:user_id", get(get_activity).post(record_activity))
        // Personas
        .route("/personas", post(create_persona))
        .route("/personas/:persona_id", get(get_persona).delete(delete_persona))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:21870".to_string());
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "memory",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    error!("Request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ========== RETRIEVAL ==========

/// Tiered relevance selection against the inbound text. An empty `facts`
/// array means the persona has no relevant memories yet; callers render
/// their own placeholder.
async fn select_facts(
    State(state): State<AppState>,
    Json(request): Json<SelectRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;

    if db.get_persona(&request.persona_id).map_err(internal_error)?.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("persona {} not found", request.persona_id),
        ));
    }

    let facts = state
        .selector
        .select(&db, &request.persona_id, &request.text)
        .map_err(internal_error)?;

    Ok(Json(FactsResponse { facts }))
}

async fn list_facts(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;
    let facts = db
        .facts_for_persona(&PersonaId(persona_id))
        .map_err(internal_error)?;

    Ok(Json(FactsResponse { facts }))
}

/// Set a one-fact-per-category slot directly, e.g. the outfit after an
/// image generation. Replaces the existing row or creates the first one.
async fn upsert_fact(
    State(state): State<AppState>,
    Json(request): Json<UpsertFactRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;

    if db.get_persona(&request.persona_id).map_err(internal_error)?.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("persona {} not found", request.persona_id),
        ));
    }

    let fact = db
        .upsert_fact_by_category(
            &request.persona_id,
            request.target,
            &request.category,
            &request.value,
            request.context.as_deref(),
        )
        .map_err(internal_error)?;

    Ok(Json(fact))
}

// ========== RECONCILIATION ==========

/// Queue an excerpt for background reconciliation and return immediately.
async fn enqueue_reconcile(
    State(state): State<AppState>,
    Json(request): Json<ReconcileRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    info!("Queueing reconciliation for {}", request.persona_id);

    state.queue.send(request).map_err(|e| {
        error!("Reconciliation queue closed: {}", e);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "reconciliation worker unavailable".to_string(),
        )
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "queued" })),
    ))
}

/// Run a full reconciliation cycle inline and report the applied counts.
async fn reconcile_now(
    State(state): State<AppState>,
    Json(request): Json<ReconcileRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;

    let persona = db
        .get_persona(&request.persona_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("persona {} not found", request.persona_id),
            )
        })?;

    let response = state
        .reconciler
        .reconcile(&db, &persona, &request.excerpt)
        .await
        .map_err(internal_error)?;

    Ok(Json(response))
}

// ========== CONSOLIDATION ==========

async fn consolidate(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let persona_id = PersonaId(persona_id);
    let db = state.db.lock().await;

    let persona = db
        .get_persona(&persona_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("persona {} not found", persona_id),
            )
        })?;

    let response = state
        .consolidator
        .consolidate(&db, &persona)
        .await
        .map_err(internal_error)?;

    Ok(Json(response))
}

// ========== ACTIVITY ==========

#[derive(Deserialize, Default)]
struct RecordActivityRequest {
    /// RFC3339; defaults to now when omitted.
    at: Option<String>,
}

async fn record_activity(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    body: Option<Json<RecordActivityRequest>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let at = body
        .and_then(|Json(req)| req.at)
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    let db = state.db.lock().await;
    db.set_activity(&UserId(user_id), &at).map_err(internal_error)?;

    Ok(Json(serde_json::json!({ "recorded_at": at })))
}

async fn get_activity(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = state.db.lock().await;
    let record = db
        .get_activity(&UserId(user_id.clone()))
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("no activity recorded for {}", user_id),
            )
        })?;

    Ok(Json(record))
}

// ========== PERSONAS ==========

async fn create_persona(
    State(state): State<AppState>,
    Json(request): Json<CreatePersonaRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let persona = Persona {
        id: generate_persona_id(),
        name: request.name,
        description: request.description,
        chat_url: request.chat_url,
        user_id: request.user_id,
        created_at: Utc::now().to_rfc3339(),
    };

    let db = state.db.lock().await;
    db.insert_persona(&persona).map_err(internal_error)?;

    info!("Created persona {} ({})", persona.id, persona.name);
    Ok((StatusCode::CREATED, Json(persona)))
}

async fn get_persona(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let persona_id = PersonaId(persona_id);
    let db = state.db.lock().await;

    let persona = db
        .get_persona(&persona_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("persona {} not found", persona_id),
            )
        })?;

    Ok(Json(persona))
}

async fn delete_persona(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let persona_id = PersonaId(persona_id);
    let db = state.db.lock().await;

    let existed = db.delete_persona(&persona_id).map_err(internal_error)?;
    if !existed {
        return Err((
            StatusCode::NOT_FOUND,
            format!("persona {} not found", persona_id),
        ));
    }

    Ok(StatusCode::NO_CONTENT)
}
