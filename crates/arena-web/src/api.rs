//! REST API endpoint handlers.
//!
//! Every response uses one envelope: `{"status": "success", "data": ...}`
//! on success and `{"status": "error", "message": ...}` with a matching
//! HTTP status on failure. Provider API keys and hidden test cases never
//! leave the server.

use std::sync::Arc;

use arena_rs::coordinator::{
    Arena, ArenaError, HintRequest, NewCompetition, NewParticipant, RelayRequest,
};
use arena_rs::model::{Competition, Participant, TerminationReason};
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, warn};

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub arena: Arc<Arena>,
}

// ── Envelopes ──────────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ArenaError> for ApiError {
    fn from(e: ArenaError) -> Self {
        let status = match &e {
            ArenaError::UnknownCompetition(_)
            | ArenaError::UnknownParticipant(_)
            | ArenaError::UnknownProblem(_) => StatusCode::NOT_FOUND,
            ArenaError::ParticipantInactive { .. } | ArenaError::Busy(_) => StatusCode::CONFLICT,
            ArenaError::InvalidRequest(_) | ArenaError::Economy(_) => StatusCode::BAD_REQUEST,
            ArenaError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ArenaError::Forward(_) | ArenaError::Relay(_) => StatusCode::BAD_GATEWAY,
            ArenaError::Store(_) | ArenaError::Poisoned => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match e {
            // The agent sees what the provider said.
            ArenaError::Upstream { body, .. } => body,
            other => other.to_string(),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), "{message}");
        }
        Self { status, message }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"status": "error", "message": self.message});
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn success(data: impl Serialize) -> ApiResult {
    let data = serde_json::to_value(data).map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("failed to encode response: {e}"),
    })?;
    Ok(Json(json!({"status": "success", "data": data})))
}

fn redact_participant(mut participant: Participant) -> Participant {
    participant.provider.api_key.clear();
    participant
}

/// Drops provider keys and hidden test cases.
fn redact_competition(mut competition: Competition) -> Competition {
    for participant in &mut competition.participants {
        participant.provider.api_key.clear();
    }
    for problem in &mut competition.problems {
        problem.test_cases.clear();
    }
    competition
}

// ── Competitions ───────────────────────────────────────────────────

/// GET /api/competitions
pub async fn list_competitions(State(app): State<AppState>) -> ApiResult {
    let mut competitions = Vec::new();
    for id in app.arena.competition_ids() {
        match app.arena.competition(&id).await {
            Ok(c) => competitions.push(json!({
                "id": c.id,
                "title": c.title,
                "description": c.description,
                "problem_count": c.problems.len(),
                "participant_count": c.participants.len(),
                "created_at": c.created_at,
            })),
            Err(e) => warn!(competition = %id, "Skipping competition: {e}"),
        }
    }
    success(competitions)
}

/// POST /api/competitions
pub async fn create_competition(
    State(app): State<AppState>,
    body: Result<Json<NewCompetition>, JsonRejection>,
) -> ApiResult {
    let Json(new) = body?;
    let competition = app.arena.create_competition(new).await?;
    success(redact_competition(competition))
}

/// GET /api/competitions/{id}
pub async fn get_competition(
    State(app): State<AppState>,
    Path(competition_id): Path<String>,
) -> ApiResult {
    let competition = app.arena.competition(&competition_id).await?;
    success(redact_competition(competition))
}

// ── Participants ───────────────────────────────────────────────────

/// GET /api/competitions/{id}/participants
pub async fn list_participants(
    State(app): State<AppState>,
    Path(competition_id): Path<String>,
) -> ApiResult {
    let competition = app.arena.competition(&competition_id).await?;
    let participants: Vec<Participant> = competition
        .participants
        .into_iter()
        .map(redact_participant)
        .collect();
    success(participants)
}

/// POST /api/competitions/{id}/participants
pub async fn add_participant(
    State(app): State<AppState>,
    Path(competition_id): Path<String>,
    body: Result<Json<NewParticipant>, JsonRejection>,
) -> ApiResult {
    let Json(new) = body?;
    if new.name.trim().is_empty() {
        return Err(ApiError::bad_request("Participant name is required"));
    }
    let participant = app.arena.add_participant(&competition_id, new).await?;
    success(redact_participant(participant))
}

/// GET /api/competitions/{id}/participants/{pid}
pub async fn get_participant(
    State(app): State<AppState>,
    Path((competition_id, participant_id)): Path<(String, String)>,
) -> ApiResult {
    let participant = app
        .arena
        .participant(&competition_id, &participant_id)
        .await?;
    success(redact_participant(participant))
}

/// GET /api/competitions/{id}/participants/{pid}/status
pub async fn participant_status(
    State(app): State<AppState>,
    Path((competition_id, participant_id)): Path<(String, String)>,
) -> ApiResult {
    let p = app
        .arena
        .participant(&competition_id, &participant_id)
        .await?;
    success(json!({
        "is_running": p.is_running,
        "termination_reason": p.termination_reason,
        "remaining_tokens": p.remaining_tokens,
        "score": p.score,
    }))
}

#[derive(Deserialize, Default)]
pub struct TerminateRequest {
    #[serde(default)]
    pub reason: Option<TerminationReason>,
}

/// POST /api/competitions/{id}/participants/{pid}/terminate
///
/// The body is optional; the reason defaults to `competitor_terminated`.
pub async fn terminate_participant(
    State(app): State<AppState>,
    Path((competition_id, participant_id)): Path<(String, String)>,
    body: Option<Json<TerminateRequest>>,
) -> ApiResult {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or(TerminationReason::CompetitorTerminated);
    let participant = app
        .arena
        .terminate_participant(&competition_id, &participant_id, reason)
        .await?;
    success(json!({
        "participant_id": participant.id,
        "termination_reason": participant.termination_reason,
    }))
}

// ── Problems ───────────────────────────────────────────────────────

/// GET /api/competitions/{id}/problems
pub async fn list_problems(
    State(app): State<AppState>,
    Path(competition_id): Path<String>,
) -> ApiResult {
    success(app.arena.problems(&competition_id).await?)
}

/// GET /api/competitions/{id}/problems/{pid}
pub async fn get_problem(
    State(app): State<AppState>,
    Path((competition_id, problem_id)): Path<(String, String)>,
) -> ApiResult {
    success(app.arena.problem(&competition_id, &problem_id).await?)
}

// ── Submissions ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub participant_id: String,
    pub problem_id: String,
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "cpp".to_string()
}

/// POST /api/competitions/{id}/submit
pub async fn submit(
    State(app): State<AppState>,
    Path(competition_id): Path<String>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body?;
    if req.participant_id.is_empty() || req.problem_id.is_empty() || req.code.is_empty() {
        return Err(ApiError::bad_request("Missing required fields"));
    }
    let report = app
        .arena
        .submit_solution(
            &competition_id,
            &req.participant_id,
            &req.problem_id,
            &req.code,
            &req.language,
        )
        .await?;
    success(report)
}

#[derive(Deserialize)]
pub struct SubmissionFilter {
    pub participant_id: Option<String>,
    pub problem_id: Option<String>,
    #[serde(default)]
    pub include_code: bool,
}

/// GET /api/competitions/{id}/submissions
pub async fn list_submissions(
    State(app): State<AppState>,
    Path(competition_id): Path<String>,
    Query(filter): Query<SubmissionFilter>,
) -> ApiResult {
    let competition = app.arena.competition(&competition_id).await?;
    let mut submissions: Vec<_> = competition
        .participants
        .into_iter()
        .filter(|p| filter.participant_id.as_ref().is_none_or(|id| *id == p.id))
        .flat_map(|p| p.submissions)
        .filter(|s| filter.problem_id.as_ref().is_none_or(|id| *id == s.problem_id))
        .collect();
    submissions.sort_by_key(|s| s.submitted_at);
    if !filter.include_code {
        for s in &mut submissions {
            s.code.clear();
        }
    }
    success(submissions)
}

// ── Hints ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct HintBody {
    pub participant_id: String,
    #[serde(flatten)]
    pub request: HintRequest,
}

/// POST /api/competitions/{id}/hints
///
/// A denial is a successful response whose `decision` is `denied`.
pub async fn request_hint(
    State(app): State<AppState>,
    Path(competition_id): Path<String>,
    body: Result<Json<HintBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let reply = app
        .arena
        .request_hint(&competition_id, &body.participant_id, body.request)
        .await?;
    success(reply)
}

// ── Rankings ───────────────────────────────────────────────────────

/// GET /api/competitions/{id}/rankings
pub async fn rankings(
    State(app): State<AppState>,
    Path(competition_id): Path<String>,
) -> ApiResult {
    success(app.arena.rankings(&competition_id).await?)
}

// ── Agent requests ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AgentRequestBody {
    pub competition_id: String,
    pub participant_id: String,
    #[serde(flatten)]
    pub request: RelayRequest,
}

/// POST /api/agent/request
///
/// One provider call with the participant's credentials. Upstream failures
/// come back with the provider's status code.
pub async fn agent_request(
    State(app): State<AppState>,
    body: Result<Json<AgentRequestBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    if body.request.json.is_null() {
        return Err(ApiError::bad_request("No JSON data provided"));
    }
    let relayed = app
        .arena
        .relay_agent_request(&body.competition_id, &body.participant_id, body.request)
        .await?;
    success(relayed)
}

// ── System ─────────────────────────────────────────────────────────

/// GET /api/system/sandbox-status
pub async fn sandbox_status(State(app): State<AppState>) -> ApiResult {
    let connected = app.arena.judge().health_check().await;
    success(json!({"connected": connected}))
}
