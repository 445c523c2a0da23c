use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::database::{
    Character, ConflictError, ProviderSettings, Story, StoryCharacter, StoryDatabase, StoryMode,
    StoryTurn, World, WorldSchemaField,
};
use crate::engine::{self, StoryEngine, StoryEvent, ValidationError};
use crate::llm_client::MalformedOutput;
use crate::state::FieldType;

#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<StoryEngine>,
    pub db: Arc<StoryDatabase>,
    pub auth: BackendAuthConfig,
    pub config: Arc<AppConfig>,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct WorldRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    rules_text: String,
}

#[derive(Debug, Deserialize)]
struct CreateSchemaFieldRequest {
    schema_key: String,
    field_type: FieldType,
    label: String,
    #[serde(default)]
    default_value: Option<serde_json::Value>,
    #[serde(default)]
    enum_options: Vec<String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    step: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct UpdateSchemaFieldRequest {
    label: String,
    #[serde(default)]
    default_value: Option<serde_json::Value>,
    #[serde(default)]
    enum_options: Vec<String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    step: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CharacterRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateStoryRequest {
    world_id: String,
    title: String,
    #[serde(default)]
    premise: String,
    #[serde(default)]
    ai_prompt: String,
    mode: StoryMode,
    #[serde(default)]
    model_override: Option<String>,
    #[serde(default)]
    params_override: Option<serde_json::Value>,
    #[serde(default)]
    context_turns_override: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UpdateStoryRequest {
    title: String,
    #[serde(default)]
    premise: String,
    #[serde(default)]
    ai_prompt: String,
    mode: StoryMode,
    #[serde(default)]
    model_override: Option<String>,
    #[serde(default)]
    params_override: Option<serde_json::Value>,
    #[serde(default)]
    context_turns_override: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AddStoryCharacterRequest {
    character_id: String,
    #[serde(default)]
    is_player: bool,
    #[serde(default)]
    display_name_override: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateStoryCharacterRequest {
    is_player: bool,
    #[serde(default)]
    display_name_override: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitTurnRequest {
    user_input: String,
}

#[derive(Debug, Serialize)]
struct TurnResponse {
    turn: StoryTurn,
    turn_count: i64,
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    target_index: i64,
}

#[derive(Debug, Serialize)]
struct RollbackResponse {
    turns: Vec<StoryTurn>,
    turn_count: i64,
}

#[derive(Debug, Deserialize)]
struct StateQuery {
    character: Option<String>,
}

#[derive(Debug, Serialize)]
struct CharacterStateResponse {
    story_character_id: String,
    values: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PutStateRequest {
    value: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct PutStateResponse {
    schema_key: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PutSettingsRequest {
    #[serde(default)]
    api_key: Option<String>,
    model: String,
    temperature: f32,
    #[serde(default)]
    max_tokens: Option<u32>,
    context_turns: u32,
}

pub async fn serve_backend(
    config: AppConfig,
    db: Arc<StoryDatabase>,
    engine: Arc<StoryEngine>,
    event_rx: flume::Receiver<StoryEvent>,
) -> Result<()> {
    let bind_addr = config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid bind_addr (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        engine,
        db,
        auth,
        config: Arc::new(config),
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);

    let protected = Router::new()
        .route("/health", get(health))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/worlds", get(list_worlds).post(create_world))
        .route(
            "/worlds/:id",
            get(get_world).put(update_world).delete(delete_world),
        )
        .route(
            "/worlds/:id/schema",
            get(list_schema).post(create_schema_field),
        )
        .route(
            "/schema/:id",
            put(update_schema_field).delete(delete_schema_field),
        )
        .route("/characters", get(list_characters).post(create_character))
        .route(
            "/characters/:id",
            get(get_character).put(update_character).delete(delete_character),
        )
        .route("/stories", get(list_stories).post(create_story))
        .route(
            "/stories/:id",
            get(get_story).put(update_story).delete(delete_story),
        )
        .route(
            "/stories/:id/characters",
            get(list_story_characters).post(add_story_character),
        )
        .route(
            "/story-characters/:id",
            put(update_story_character).delete(remove_story_character),
        )
        .route("/stories/:id/turns", get(list_turns).post(submit_turn))
        .route("/stories/:id/regenerate", post(regenerate_turn))
        .route("/stories/:id/rollback", post(rollback_story))
        .route("/stories/:id/state", get(get_story_state))
        .route(
            "/stories/:id/state/:character_id/:key",
            put(put_state_value),
        )
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new().nest("/v1", protected);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Aetheria backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<StoryEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_story_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_story_event(event: StoryEvent) -> ApiEventEnvelope {
    match event {
        StoryEvent::TurnAppended {
            story_id,
            turn_index,
            turn_count,
        } => envelope(
            "turn_appended",
            serde_json::json!({
                "story_id": story_id,
                "turn_index": turn_index,
                "turn_count": turn_count
            }),
        ),
        StoryEvent::TurnsRolledBack {
            story_id,
            target_index,
            turn_count,
        } => envelope(
            "turns_rolled_back",
            serde_json::json!({
                "story_id": story_id,
                "target_index": target_index,
                "turn_count": turn_count
            }),
        ),
        StoryEvent::StateEdited {
            story_id,
            story_character_id,
            schema_key,
        } => envelope(
            "state_edited",
            serde_json::json!({
                "story_id": story_id,
                "story_character_id": story_character_id,
                "schema_key": schema_key
            }),
        ),
        StoryEvent::StoryUpdated { story_id } => envelope(
            "story_updated",
            serde_json::json!({ "story_id": story_id }),
        ),
        StoryEvent::ModelError { story_id, error } => envelope(
            "model_error",
            serde_json::json!({ "story_id": story_id, "error": error }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("AETHERIA_AUTH_MODE").ok())?;
    let token = std::env::var("AETHERIA_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "AETHERIA_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid AETHERIA_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ----- provider settings -----

async fn get_settings(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ProviderSettings>, (StatusCode, String)> {
    let settings = state
        .db
        .get_provider_settings()
        .map_err(map_error)?
        .unwrap_or_else(|| engine::provider_fallback(&state.config));
    Ok(Json(settings))
}

async fn put_settings(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<PutSettingsRequest>,
) -> Result<Json<ProviderSettings>, (StatusCode, String)> {
    let settings = ProviderSettings {
        api_key: body.api_key.filter(|key| !key.trim().is_empty()),
        model: body.model,
        temperature: body.temperature,
        max_tokens: body.max_tokens,
        context_turns: body.context_turns.max(1),
        updated_at: Utc::now(),
    };
    state.db.put_provider_settings(&settings).map_err(map_error)?;
    Ok(Json(settings))
}

// ----- worlds -----

async fn list_worlds(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<World>>, (StatusCode, String)> {
    state.db.list_worlds().map(Json).map_err(map_error)
}

async fn create_world(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<WorldRequest>,
) -> Result<Json<World>, (StatusCode, String)> {
    state
        .db
        .create_world(&body.name, &body.description, &body.rules_text)
        .map(Json)
        .map_err(map_error)
}

async fn get_world(
    State(state): State<Arc<ServerState>>,
    Path(world_id): Path<String>,
) -> Result<Json<World>, (StatusCode, String)> {
    match state.db.get_world(&world_id).map_err(map_error)? {
        Some(world) => Ok(Json(world)),
        None => Err(not_found(format!("world '{}' not found", world_id))),
    }
}

async fn update_world(
    State(state): State<Arc<ServerState>>,
    Path(world_id): Path<String>,
    Json(body): Json<WorldRequest>,
) -> Result<Json<World>, (StatusCode, String)> {
    state
        .db
        .update_world(&world_id, &body.name, &body.description, &body.rules_text)
        .map_err(map_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("world '{}' not found", world_id)))
}

async fn delete_world(
    State(state): State<Arc<ServerState>>,
    Path(world_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.db.delete_world(&world_id).map_err(map_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("world '{}' not found", world_id)))
    }
}

// ----- world schema -----

async fn list_schema(
    State(state): State<Arc<ServerState>>,
    Path(world_id): Path<String>,
) -> Result<Json<Vec<WorldSchemaField>>, (StatusCode, String)> {
    require_world(&state, &world_id)?;
    state
        .db
        .list_schema_for_world(&world_id)
        .map(Json)
        .map_err(map_error)
}

async fn create_schema_field(
    State(state): State<Arc<ServerState>>,
    Path(world_id): Path<String>,
    Json(body): Json<CreateSchemaFieldRequest>,
) -> Result<Json<WorldSchemaField>, (StatusCode, String)> {
    require_world(&state, &world_id)?;
    let default_value = body.default_value.map(|value| value.to_string());
    state
        .db
        .create_schema_field(
            &world_id,
            &body.schema_key,
            body.field_type,
            &body.label,
            default_value.as_deref(),
            &body.enum_options,
            body.min,
            body.max,
            body.step,
        )
        .map(Json)
        .map_err(map_error)
}

async fn update_schema_field(
    State(state): State<Arc<ServerState>>,
    Path(field_id): Path<String>,
    Json(body): Json<UpdateSchemaFieldRequest>,
) -> Result<Json<WorldSchemaField>, (StatusCode, String)> {
    let default_value = body.default_value.map(|value| value.to_string());
    state
        .db
        .update_schema_field(
            &field_id,
            &body.label,
            default_value.as_deref(),
            &body.enum_options,
            body.min,
            body.max,
            body.step,
        )
        .map_err(map_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("schema field '{}' not found", field_id)))
}

async fn delete_schema_field(
    State(state): State<Arc<ServerState>>,
    Path(field_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.db.delete_schema_field(&field_id).map_err(map_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("schema field '{}' not found", field_id)))
    }
}

// ----- characters -----

async fn list_characters(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Character>>, (StatusCode, String)> {
    state.db.list_characters().map(Json).map_err(map_error)
}

async fn create_character(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CharacterRequest>,
) -> Result<Json<Character>, (StatusCode, String)> {
    state
        .db
        .create_character(
            &body.name,
            &body.description,
            &body.tags,
            body.image_url.as_deref(),
        )
        .map(Json)
        .map_err(map_error)
}

async fn get_character(
    State(state): State<Arc<ServerState>>,
    Path(character_id): Path<String>,
) -> Result<Json<Character>, (StatusCode, String)> {
    match state.db.get_character(&character_id).map_err(map_error)? {
        Some(character) => Ok(Json(character)),
        None => Err(not_found(format!("character '{}' not found", character_id))),
    }
}

async fn update_character(
    State(state): State<Arc<ServerState>>,
    Path(character_id): Path<String>,
    Json(body): Json<CharacterRequest>,
) -> Result<Json<Character>, (StatusCode, String)> {
    state
        .db
        .update_character(
            &character_id,
            &body.name,
            &body.description,
            &body.tags,
            body.image_url.as_deref(),
        )
        .map_err(map_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("character '{}' not found", character_id)))
}

async fn delete_character(
    State(state): State<Arc<ServerState>>,
    Path(character_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.db.delete_character(&character_id).map_err(map_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("character '{}' not found", character_id)))
    }
}

// ----- stories -----

async fn list_stories(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Story>>, (StatusCode, String)> {
    state.db.list_stories().map(Json).map_err(map_error)
}

async fn create_story(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateStoryRequest>,
) -> Result<Json<Story>, (StatusCode, String)> {
    let params_override = body.params_override.map(|value| value.to_string());
    state
        .db
        .create_story(
            &body.world_id,
            &body.title,
            &body.premise,
            &body.ai_prompt,
            body.mode,
            body.model_override.as_deref(),
            params_override.as_deref(),
            body.context_turns_override,
        )
        .map(Json)
        .map_err(map_error)
}

async fn get_story(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
) -> Result<Json<Story>, (StatusCode, String)> {
    require_story(&state, &story_id).map(Json)
}

async fn update_story(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
    Json(body): Json<UpdateStoryRequest>,
) -> Result<Json<Story>, (StatusCode, String)> {
    let params_override = body.params_override.map(|value| value.to_string());
    let story = state
        .db
        .update_story(
            &story_id,
            &body.title,
            &body.premise,
            &body.ai_prompt,
            body.mode,
            body.model_override.as_deref(),
            params_override.as_deref(),
            body.context_turns_override,
        )
        .map_err(map_error)?
        .ok_or_else(|| not_found(format!("story '{}' not found", story_id)))?;

    let _ = state.ws_events.send(map_story_event(StoryEvent::StoryUpdated {
        story_id: story.id.clone(),
    }));
    Ok(Json(story))
}

async fn delete_story(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.db.delete_story(&story_id).map_err(map_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("story '{}' not found", story_id)))
    }
}

// ----- story characters -----

async fn list_story_characters(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
) -> Result<Json<Vec<StoryCharacter>>, (StatusCode, String)> {
    require_story(&state, &story_id)?;
    state
        .db
        .list_story_characters(&story_id)
        .map(Json)
        .map_err(map_error)
}

async fn add_story_character(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
    Json(body): Json<AddStoryCharacterRequest>,
) -> Result<Json<StoryCharacter>, (StatusCode, String)> {
    require_story(&state, &story_id)?;
    state
        .db
        .add_story_character(
            &story_id,
            &body.character_id,
            body.is_player,
            body.display_name_override.as_deref(),
        )
        .map(Json)
        .map_err(map_error)
}

async fn update_story_character(
    State(state): State<Arc<ServerState>>,
    Path(member_id): Path<String>,
    Json(body): Json<UpdateStoryCharacterRequest>,
) -> Result<Json<StoryCharacter>, (StatusCode, String)> {
    state
        .db
        .update_story_character(
            &member_id,
            body.is_player,
            body.display_name_override.as_deref(),
        )
        .map_err(map_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("story character '{}' not found", member_id)))
}

async fn remove_story_character(
    State(state): State<Arc<ServerState>>,
    Path(member_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state
        .db
        .remove_story_character(&member_id)
        .map_err(map_error)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("story character '{}' not found", member_id)))
    }
}

// ----- turns -----

async fn list_turns(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
) -> Result<Json<Vec<StoryTurn>>, (StatusCode, String)> {
    require_story(&state, &story_id)?;
    state.db.list_turns(&story_id).map(Json).map_err(map_error)
}

async fn submit_turn(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
    Json(body): Json<SubmitTurnRequest>,
) -> Result<Json<TurnResponse>, (StatusCode, String)> {
    require_story(&state, &story_id)?;
    let outcome = state
        .engine
        .execute_turn(&story_id, &body.user_input)
        .await
        .map_err(map_error)?;
    Ok(Json(TurnResponse {
        turn: outcome.turn,
        turn_count: outcome.turn_count,
    }))
}

async fn regenerate_turn(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
) -> Result<Json<TurnResponse>, (StatusCode, String)> {
    require_story(&state, &story_id)?;
    let outcome = state
        .engine
        .regenerate(&story_id)
        .await
        .map_err(map_error)?;
    Ok(Json(TurnResponse {
        turn: outcome.turn,
        turn_count: outcome.turn_count,
    }))
}

async fn rollback_story(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
    Json(body): Json<RollbackRequest>,
) -> Result<Json<RollbackResponse>, (StatusCode, String)> {
    require_story(&state, &story_id)?;
    let outcome = state
        .engine
        .rollback(&story_id, body.target_index)
        .await
        .map_err(map_error)?;
    Ok(Json(RollbackResponse {
        turns: outcome.turns,
        turn_count: outcome.turn_count,
    }))
}

// ----- story state -----

async fn get_story_state(
    State(state): State<Arc<ServerState>>,
    Path(story_id): Path<String>,
    Query(query): Query<StateQuery>,
) -> Result<Json<Vec<CharacterStateResponse>>, (StatusCode, String)> {
    require_story(&state, &story_id)?;
    let resolved = state
        .engine
        .resolve_story_state(&story_id, query.character.as_deref())
        .map_err(map_error)?;
    let response = resolved
        .into_iter()
        .map(|(story_character_id, values)| CharacterStateResponse {
            story_character_id,
            values: values
                .into_iter()
                .map(|(key, value)| (key, value.to_json()))
                .collect(),
        })
        .collect();
    Ok(Json(response))
}

async fn put_state_value(
    State(state): State<Arc<ServerState>>,
    Path((story_id, character_id, key)): Path<(String, String, String)>,
    Json(body): Json<PutStateRequest>,
) -> Result<Json<PutStateResponse>, (StatusCode, String)> {
    require_story(&state, &story_id)?;
    let value = state
        .engine
        .set_state_value(&story_id, &character_id, &key, &body.value)
        .map_err(map_error)?;
    Ok(Json(PutStateResponse {
        schema_key: key,
        value: value.to_json(),
    }))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn require_world(state: &ServerState, world_id: &str) -> Result<World, (StatusCode, String)> {
    state
        .db
        .get_world(world_id)
        .map_err(map_error)?
        .ok_or_else(|| not_found(format!("world '{}' not found", world_id)))
}

fn require_story(state: &ServerState, story_id: &str) -> Result<Story, (StatusCode, String)> {
    state
        .db
        .get_story(story_id)
        .map_err(map_error)?
        .ok_or_else(|| not_found(format!("story '{}' not found", story_id)))
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

/// Map typed failure markers to status codes; anything unrecognized is a 500.
fn map_error(error: anyhow::Error) -> (StatusCode, String) {
    if error.downcast_ref::<ConflictError>().is_some() {
        (StatusCode::CONFLICT, error.to_string())
    } else if error.downcast_ref::<ValidationError>().is_some() {
        (StatusCode::UNPROCESSABLE_ENTITY, error.to_string())
    } else if error.downcast_ref::<MalformedOutput>().is_some() {
        (StatusCode::BAD_GATEWAY, error.to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(
            &headers,
            &BackendAuthConfig {
                mode: AuthMode::Required,
                token: Some("token-123".to_string()),
            }
        )
        .is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let headers = HeaderMap::new();
        assert!(authorize(
            &headers,
            &BackendAuthConfig {
                mode: AuthMode::Required,
                token: Some("token-123".to_string()),
            }
        )
        .is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(
            &headers,
            &BackendAuthConfig {
                mode: AuthMode::Required,
                token: Some("token-123".to_string()),
            }
        )
        .is_err());
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        let headers = HeaderMap::new();
        assert!(authorize(
            &headers,
            &BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            }
        )
        .is_ok());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("disabled".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn map_error_distinguishes_typed_markers() {
        let conflict = anyhow::Error::new(ConflictError("duplicate".to_string()));
        assert_eq!(map_error(conflict).0, StatusCode::CONFLICT);

        let validation = anyhow::Error::new(ValidationError("bad input".to_string()));
        assert_eq!(map_error(validation).0, StatusCode::UNPROCESSABLE_ENTITY);

        let malformed = anyhow::Error::new(MalformedOutput {
            raw: "not json".to_string(),
        });
        assert_eq!(map_error(malformed).0, StatusCode::BAD_GATEWAY);

        let other = anyhow::anyhow!("disk full");
        assert_eq!(map_error(other).0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn map_story_event_includes_event_type_and_payload() {
        let envelope = map_story_event(StoryEvent::TurnAppended {
            story_id: "s-1".to_string(),
            turn_index: 3,
            turn_count: 3,
        });
        assert_eq!(envelope.event_type, "turn_appended");
        assert_eq!(envelope.payload["story_id"], "s-1");
        assert_eq!(envelope.payload["turn_index"], 3);
        assert!(envelope.emitted_at <= Utc::now());
    }
}
