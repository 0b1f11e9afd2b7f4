use crate::auth::{self, AuthContext};
use crate::error::ApiError;
use crate::models::{AgentRef, AgentView, LeadStatus, LeadView, Role};
use crate::pipeline::{self, StagedUpload, UploadError};
use crate::state::{AgentUpdate, AppState, NewAgent, StoreError};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;
// Headroom for multipart boundaries and part headers above the file ceiling.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    let upload_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health_check))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/:id", put(update_agent).delete(delete_agent))
        .route(
            "/api/upload",
            post(upload_leads).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/upload/leads/:agent_id", get(list_leads))
        .route("/api/leads/:id/status", put(update_lead_status))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health_check() -> &'static str {
    "OK"
}

// ── Input helpers ────────────────────────────────────────────────────────────

fn required(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    let ok = email
        .split_once('@')
        .map(|(user, domain)| {
            !user.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace)
        })
        .unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(ApiError::BadRequest("Please provide a valid email".to_string()))
    }
}

/// Hashing runs on the blocking pool.
async fn hash_password(password: String) -> Result<String, ApiError> {
    let hashed = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(e.into()))??;
    Ok(hashed)
}

// ── Auth ─────────────────────────────────────────────────────────────────────

/// Same wording whether the pre-check or the store catches the duplicate.
fn registration_error(err: StoreError) -> ApiError {
    match err {
        StoreError::DuplicateEmail => {
            ApiError::BadRequest("User with this email already exists".to_string())
        }
        other => other.into(),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: Option<String>,
    email: Option<String>,
    password: Option<String>,
    role: Option<String>,
    mobile: Option<String>,
}

async fn register(
    Extension(state): Extension<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config.allow_registration {
        return Err(ApiError::Forbidden("Registration is disabled"));
    }
    let Json(req) = payload?;

    let (Some(name), Some(email), Some(password)) =
        (required(&req.name), required(&req.email), required(&req.password))
    else {
        return Err(ApiError::BadRequest("Please provide all required fields".to_string()));
    };
    validate_email(email)?;
    let role = match required(&req.role) {
        Some(r) => r.parse::<Role>().map_err(ApiError::BadRequest)?,
        None => Role::Agent,
    };

    if state.agent_by_email(email).is_some() {
        return Err(registration_error(StoreError::DuplicateEmail));
    }
    let password_hash = hash_password(password.to_string()).await?;

    let account = state
        .create_agent(NewAgent {
            name: name.to_string(),
            email: email.to_string(),
            mobile: required(&req.mobile).unwrap_or_default().to_string(),
            password_hash,
            role,
        })
        .map_err(registration_error)?;
    tracing::info!("Registered {:?} account {}", account.role, account.email);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "User registered successfully",
            "user": AgentView::from(&account),
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: Option<String>,
    password: Option<String>,
}

async fn login(
    Extension(state): Extension<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let (Some(email), Some(password)) = (required(&req.email), req.password.clone()) else {
        return Err(ApiError::BadRequest("Please provide email and password".to_string()));
    };

    let account = state
        .agent_by_email(email)
        .ok_or(ApiError::Unauthorized("Invalid credentials"))?;
    let stored = account.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || auth::verify_password(&password, &stored))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    if !valid {
        tracing::debug!("Failed login for {}", account.email);
        return Err(ApiError::Unauthorized("Invalid credentials"));
    }

    let token = auth::issue_token(
        &state.config.jwt_secret,
        state.config.token_ttl_hours,
        account.id,
        &account.email,
        account.role,
    )?;

    Ok(Json(json!({
        "success": true,
        "token": token,
        "user": AgentView::from(&account),
    })))
}

// ── Agents ───────────────────────────────────────────────────────────────────

async fn list_agents(
    Extension(state): Extension<AppState>,
    _auth: AuthContext,
) -> Json<Value> {
    let agents: Vec<AgentView> = state.list_agents().iter().map(AgentView::from).collect();
    Json(json!({ "success": true, "agents": agents }))
}

#[derive(Debug, Deserialize)]
struct CreateAgentRequest {
    name: Option<String>,
    email: Option<String>,
    mobile: Option<String>,
    password: Option<String>,
}

async fn create_agent(
    Extension(state): Extension<AppState>,
    caller: AuthContext,
    payload: Result<Json<CreateAgentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let (Some(name), Some(email), Some(mobile), Some(password)) = (
        required(&req.name),
        required(&req.email),
        required(&req.mobile),
        required(&req.password),
    ) else {
        return Err(ApiError::BadRequest("Please provide all required fields".to_string()));
    };
    validate_email(email)?;

    // Checked again atomically by the store.
    if state.agent_by_email(email).is_some() {
        return Err(ApiError::BadRequest("Agent with this email already exists".to_string()));
    }
    let password_hash = hash_password(password.to_string()).await?;

    let agent = state.create_agent(NewAgent {
        name: name.to_string(),
        email: email.to_string(),
        mobile: mobile.to_string(),
        password_hash,
        role: Role::Agent,
    })?;
    tracing::info!("{} created agent {}", caller.email, agent.email);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Agent created successfully",
            "agent": AgentView::from(&agent),
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateAgentRequest {
    name: Option<String>,
    email: Option<String>,
    mobile: Option<String>,
    // Only a JSON boolean counts; anything else leaves the flag alone.
    is_active: Option<Value>,
}

async fn update_agent(
    Extension(state): Extension<AppState>,
    _auth: AuthContext,
    Path(id): Path<String>,
    payload: Result<Json<UpdateAgentRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("Agent not found"))?;
    if let Some(email) = required(&req.email) {
        validate_email(email)?;
    }

    let agent = state.update_agent(
        &id,
        AgentUpdate {
            name: req.name,
            email: req.email,
            mobile: req.mobile,
            is_active: req.is_active.as_ref().and_then(Value::as_bool),
        },
    )?;

    Ok(Json(json!({
        "success": true,
        "message": "Agent updated successfully",
        "agent": AgentView::from(&agent),
    })))
}

async fn delete_agent(
    Extension(state): Extension<AppState>,
    caller: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("Agent not found"))?;
    let orphaned = state.delete_agent(&id)?;
    tracing::info!(
        "{} ({}) deleted agent {} ({} leads left assigned)",
        caller.email,
        caller.user_id,
        id,
        orphaned
    );

    Ok(Json(json!({
        "success": true,
        "message": "Agent deleted successfully",
    })))
}

// ── Upload & leads ───────────────────────────────────────────────────────────

fn multipart_error(e: MultipartError, limit: usize) -> UploadError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::TooLarge { limit }
    } else {
        UploadError::Multipart(e.body_text())
    }
}

async fn upload_leads(
    Extension(state): Extension<AppState>,
    caller: AuthContext,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, ApiError> {
    let limit = state.config.max_upload_bytes;
    let mut multipart = multipart.map_err(|_| UploadError::NoFile)?;

    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| multipart_error(e, limit))?;
        file = Some((file_name, content_type, bytes));
        break;
    }
    let (file_name, content_type, bytes) = file.ok_or(UploadError::NoFile)?;

    tracing::info!(
        "{} [{:?}] uploaded {} ({} bytes)",
        caller.email,
        caller.role,
        file_name,
        bytes.len()
    );

    let result = match StagedUpload::stage(
        &state.config.upload_dir,
        &file_name,
        content_type.as_deref(),
        &bytes,
        limit,
    ) {
        Ok(staged) => pipeline::distribute_upload(&state, staged).await,
        Err(e) => Err(e),
    };
    let report = result.map_err(|e| {
        tracing::warn!("Upload of {} rejected: {}", file_name, e);
        e
    })?;

    Ok(Json(json!({
        "success": true,
        "message": report.message,
        "uploadBatch": report.upload_batch,
        "distribution": report.distribution,
    })))
}

#[derive(Debug, Deserialize)]
struct LeadQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

async fn list_leads(
    Extension(state): Extension<AppState>,
    _auth: AuthContext,
    Path(agent_id): Path<String>,
    query: Result<Query<LeadQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(q) = query?;
    let filter = match agent_id.as_str() {
        "all" => None,
        raw => Some(
            Uuid::parse_str(raw)
                .map_err(|_| ApiError::BadRequest("Invalid agent id".to_string()))?,
        ),
    };
    let page = q.page.unwrap_or(1).max(1) as usize;
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE) as usize;

    let (leads, total) = state.leads_page(filter, page, limit);

    let mut owners: HashMap<Uuid, Option<AgentRef>> = HashMap::new();
    let views: Vec<LeadView> = leads
        .iter()
        .map(|lead| {
            let owner = owners
                .entry(lead.agent)
                .or_insert_with(|| state.agent(&lead.agent).map(|a| AgentRef::from(&a)))
                .clone();
            LeadView::new(lead, owner)
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "leads": views,
        "total": total,
        "totalPages": total.div_ceil(limit),
        "currentPage": page,
    })))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: Option<Value>,
}

async fn update_lead_status(
    Extension(state): Extension<AppState>,
    _auth: AuthContext,
    Path(id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let status: LeadStatus = req
        .status
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::BadRequest("Invalid status value".to_string()))?;
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("Lead not found"))?;

    let lead = state.update_lead_status(&id, status)?;
    let owner = state.agent(&lead.agent).map(|a| AgentRef::from(&a));

    Ok(Json(json!({
        "success": true,
        "message": "Lead status updated successfully",
        "lead": LeadView::new(&lead, owner),
    })))
}
