use super::state::AppState;
use crate::application::{
    AccountError, AggregateError, GateError, LedgerError, PromptRequest, ProviderChoice,
    SelectionError, TurnUpdate,
};
use crate::domain::{
    all_tiers, format_price, tier, ConversationTurn, ProviderId, ProviderResponse,
    ProviderStatistic, Quota, ResponseState, TierDefinition, TierId, TurnError, UserAccount,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;
use validator::Validate;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/tiers", get(list_tiers))
        .route("/users", post(create_user))
        .route("/users/:id", get(get_user))
        .route("/users/:id/tier", post(change_tier))
        .route("/users/:id/usage", get(get_usage))
        .route("/users/:id/usage/reset", post(reset_usage))
        .route(
            "/users/:id/keys/:provider",
            put(put_provider_key).delete(delete_provider_key),
        )
        .route("/turns", post(submit_turn))
        .route("/turns/:id", get(get_turn))
        .route("/turns/:id/selection", post(select_response))
        .route("/sessions/:id/turns", get(list_session_turns))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/stats/providers", get(provider_stats))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn parse_provider(provider: &str) -> Option<ProviderId> {
    ProviderId::from_str(provider).ok()
}

fn parse_tier(tier: &str) -> Option<TierId> {
    TierId::from_str(tier).ok()
}

fn quota_to_option(quota: Quota) -> Option<u32> {
    match quota {
        Quota::Limited(cap) => Some(cap),
        Quota::Unlimited => None,
    }
}

const ALLOWED_PROVIDERS: [&str; 4] = ["openai", "gemini", "deepseek", "openrouter"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_provider_accepts_known_ids_only() {
        assert_eq!(parse_provider("openai"), Some(ProviderId::OpenAi));
        assert_eq!(parse_provider("openrouter"), Some(ProviderId::OpenRouter));
        assert!(parse_provider("tavus").is_none());
        assert!(parse_provider("").is_none());
    }

    #[test]
    fn parse_tier_accepts_known_ids_only() {
        assert_eq!(parse_tier("free"), Some(TierId::Free));
        assert_eq!(parse_tier("pro"), Some(TierId::Pro));
        assert!(parse_tier("enterprise").is_none());
    }

    #[test]
    fn quota_serializes_as_optional_cap() {
        assert_eq!(quota_to_option(Quota::Limited(50)), Some(50));
        assert_eq!(quota_to_option(Quota::Unlimited), None);
    }

    #[test]
    fn turn_view_carries_phase_and_selection() {
        use chrono::Utc;

        let mut turn = ConversationTurn::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "hello".to_string(),
            vec![],
            [(ProviderId::OpenAi, "gpt-4o".to_string())],
        );
        turn.settle_response(
            ProviderId::OpenAi,
            ResponseState::Success { content: "hi".into() },
            Utc::now(),
        )
        .unwrap();
        turn.select(ProviderId::OpenAi).unwrap();

        let view = TurnView::from(turn);
        assert_eq!(view.phase, "resolved");
        assert_eq!(view.selected_provider.as_deref(), Some("openai"));
        assert_eq!(view.responses[0].state, "success");
        assert_eq!(view.responses[0].content.as_deref(), Some("hi"));
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        list_tiers,
        create_user,
        get_user,
        change_tier,
        get_usage,
        reset_usage,
        put_provider_key,
        delete_provider_key,
        submit_turn,
        get_turn,
        select_response,
        list_session_turns,
        cancel_session,
        provider_stats,
    ),
    components(
        schemas(
            CreateUserRequest,
            ChangeTierRequest,
            PutKeyRequest,
            CreateTurnRequest,
            ProviderChoiceRequest,
            SelectionRequest,
            UserView,
            TurnView,
            ResponseView,
            UsageView,
            TierView,
            StatView,
            HealthResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Tiers", description = "Tier policy and usage gating"),
        (name = "Users", description = "Account management endpoints"),
        (name = "Turns", description = "Prompt fan-out and response selection"),
        (name = "Stats", description = "Provider analytics"),
    ),
    info(
        title = "Chorus API",
        version = "0.1.0",
        description = "Multi-provider AI prompt fan-out and response selection",
        license(name = "MIT")
    )
)]
struct ApiDoc;

/// Health check response
#[derive(Serialize, ToSchema)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// Verifies database connectivity and returns service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse)
    )
)]
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy".to_string(),
                error: None,
            }),
        ),
        Err(e) => {
            error!(error = %e, "Health check failed: DB connectivity issue");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy".to_string(),
                    error: Some("Database connectivity failed".to_string()),
                }),
            )
        }
    }
}

#[derive(Serialize, ToSchema)]
struct TierView {
    id: String,
    display_name: String,
    /// Monthly conversation allowance; absent means unlimited.
    monthly_conversation_quota: Option<u32>,
    /// Providers allowed per comparison; absent means unlimited.
    max_providers_per_comparison: Option<u32>,
    price_cents: u32,
    price_display: String,
    features: Vec<String>,
}

impl From<&TierDefinition> for TierView {
    fn from(def: &TierDefinition) -> Self {
        Self {
            id: def.id.to_string(),
            display_name: def.display_name.to_string(),
            monthly_conversation_quota: quota_to_option(def.monthly_conversation_quota),
            max_providers_per_comparison: quota_to_option(def.max_providers_per_comparison),
            price_cents: def.price_cents,
            price_display: format_price(def.price_cents),
            features: def.features.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// List the available tiers
#[utoipa::path(
    get,
    path = "/tiers",
    tag = "Tiers",
    responses((status = 200, description = "Tier definitions", body = [TierView]))
)]
async fn list_tiers() -> impl IntoResponse {
    let tiers: Vec<TierView> = all_tiers().iter().map(TierView::from).collect();
    (StatusCode::OK, Json(tiers))
}

/// Create user request
#[derive(Deserialize, Validate, ToSchema)]
struct CreateUserRequest {
    #[validate(email)]
    #[schema(example = "ada@example.com")]
    email: String,
    #[validate(length(min = 1, max = 80))]
    #[schema(example = "Ada")]
    display_name: String,
}

#[derive(Serialize, ToSchema)]
struct UserView {
    id: Uuid,
    email: String,
    display_name: String,
    role: String,
    tier: String,
    monthly_conversation_count: i32,
    last_reset_at: chrono::DateTime<chrono::Utc>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<UserAccount> for UserView {
    fn from(user: UserAccount) -> Self {
        Self {
            id: user.id,
            email: user.email,
            display_name: user.display_name,
            role: user.role.to_string(),
            tier: user.tier.to_string(),
            monthly_conversation_count: user.monthly_conversation_count,
            last_reset_at: user.last_reset_at,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Create a new account (free tier, zero usage)
#[utoipa::path(
    post,
    path = "/users",
    tag = "Users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "Account created", body = UserView),
        (status = 400, description = "Invalid sign-up payload", body = Object),
        (status = 409, description = "Email already registered", body = Object),
        (status = 500, description = "Failed to create account", body = Object)
    )
)]
async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> impl IntoResponse {
    if let Err(errors) = req.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid sign-up payload", "details": errors})),
        );
    }

    match state.accounts.sign_up(req.email, req.display_name).await {
        Ok(user) => (
            StatusCode::CREATED,
            Json(serde_json::json!(UserView::from(user))),
        ),
        Err(AccountError::EmailInUse) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "Email already registered"})),
        ),
        Err(e) => {
            error!(error = %e, "Failed to create account");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to create account"})),
            )
        }
    }
}

/// Fetch one account
#[utoipa::path(
    get,
    path = "/users/{id}",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Account found", body = UserView),
        (status = 404, description = "Account not found", body = Object)
    )
)]
async fn get_user(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.accounts.get(id).await {
        Ok(user) => (StatusCode::OK, Json(serde_json::json!(UserView::from(user)))),
        Err(AccountError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "User not found"})),
        ),
        Err(e) => {
            error!(error = %e, "Failed to fetch account");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to fetch account"})),
            )
        }
    }
}

/// Change tier request
#[derive(Deserialize, ToSchema)]
struct ChangeTierRequest {
    #[schema(example = "pro")]
    tier: String,
}

/// Move an account to another tier
#[utoipa::path(
    post,
    path = "/users/{id}/tier",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User ID")),
    request_body = ChangeTierRequest,
    responses(
        (status = 200, description = "Tier changed", body = UserView),
        (status = 400, description = "Invalid tier", body = Object),
        (status = 404, description = "Account not found", body = Object),
        (status = 500, description = "Tier change failed", body = Object)
    )
)]
async fn change_tier(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeTierRequest>,
) -> impl IntoResponse {
    let tier_id = match parse_tier(req.tier.as_str()) {
        Some(t) => t,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "Invalid tier",
                    "allowed": ["free", "pro"]
                })),
            );
        }
    };

    match state.accounts.change_tier(id, tier_id).await {
        Ok(user) => (StatusCode::OK, Json(serde_json::json!(UserView::from(user)))),
        Err(AccountError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "User not found"})),
        ),
        Err(e) => {
            error!(error = %e, "Tier change failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Tier change failed"})),
            )
        }
    }
}

#[derive(Serialize, ToSchema)]
struct UsageView {
    allowed: bool,
    used: u32,
    /// Absent means unlimited.
    quota: Option<u32>,
    unlimited: bool,
    tier: String,
    level: String,
}

/// Check the monthly usage allowance
///
/// Performs the lazy monthly rollover as a side effect when the stored
/// window is from a previous calendar month.
#[utoipa::path(
    get,
    path = "/users/{id}/usage",
    tag = "Tiers",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Usage status", body = UsageView),
        (status = 404, description = "Account not found", body = Object),
        (status = 503, description = "Usage service unavailable", body = Object)
    )
)]
async fn get_usage(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.ledger.check(id).await {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::json!(UsageView {
                allowed: status.allowed,
                used: status.used,
                quota: quota_to_option(status.quota),
                unlimited: status.quota.is_unlimited(),
                tier: status.tier.to_string(),
                level: status.level.to_string(),
            })),
        ),
        Err(LedgerError::UnknownUser(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "User not found"})),
        ),
        Err(e) => {
            error!(error = %e, "Usage check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Usage service unavailable, please try again"})),
            )
        }
    }
}

/// Reset the monthly usage counter (admin override)
#[utoipa::path(
    post,
    path = "/users/{id}/usage/reset",
    tag = "Tiers",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Counter reset", body = Object),
        (status = 404, description = "Account not found", body = Object),
        (status = 503, description = "Usage service unavailable", body = Object)
    )
)]
async fn reset_usage(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.ledger.reset(id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(LedgerError::UnknownUser(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "User not found"})),
        ),
        Err(e) => {
            error!(error = %e, "Usage reset failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Usage service unavailable, please try again"})),
            )
        }
    }
}

/// Store a personal provider key
#[derive(Deserialize, Validate, ToSchema)]
struct PutKeyRequest {
    #[validate(length(min = 1, max = 512))]
    api_key: String,
}

/// Store a personal API key for one provider (encrypted at rest)
#[utoipa::path(
    put,
    path = "/users/{id}/keys/{provider}",
    tag = "Users",
    params(
        ("id" = Uuid, Path, description = "User ID"),
        ("provider" = String, Path, description = "Provider ID")
    ),
    request_body = PutKeyRequest,
    responses(
        (status = 200, description = "Key stored", body = Object),
        (status = 400, description = "Invalid provider or key", body = Object),
        (status = 500, description = "Failed to store key", body = Object)
    )
)]
async fn put_provider_key(
    State(state): State<AppState>,
    Path((id, provider)): Path<(Uuid, String)>,
    Json(req): Json<PutKeyRequest>,
) -> impl IntoResponse {
    let provider = match parse_provider(provider.as_str()) {
        Some(p) => p,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "Invalid provider",
                    "allowed": ALLOWED_PROVIDERS
                })),
            );
        }
    };

    if let Err(errors) = req.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid key", "details": errors})),
        );
    }

    match state.keys.store_personal_key(id, provider, &req.api_key).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(e) => {
            error!(error = %e, "Failed to store provider key");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to store key"})),
            )
        }
    }
}

/// Remove a personal provider key
#[utoipa::path(
    delete,
    path = "/users/{id}/keys/{provider}",
    tag = "Users",
    params(
        ("id" = Uuid, Path, description = "User ID"),
        ("provider" = String, Path, description = "Provider ID")
    ),
    responses(
        (status = 200, description = "Key removed", body = Object),
        (status = 400, description = "Invalid provider", body = Object),
        (status = 500, description = "Failed to remove key", body = Object)
    )
)]
async fn delete_provider_key(
    State(state): State<AppState>,
    Path((id, provider)): Path<(Uuid, String)>,
) -> impl IntoResponse {
    let provider = match parse_provider(provider.as_str()) {
        Some(p) => p,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "Invalid provider",
                    "allowed": ALLOWED_PROVIDERS
                })),
            );
        }
    };

    match state.keys.delete_personal_key(id, provider).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(e) => {
            error!(error = %e, "Failed to remove provider key");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to remove key"})),
            )
        }
    }
}

#[derive(Deserialize, ToSchema)]
struct ProviderChoiceRequest {
    #[schema(example = "openai")]
    provider: String,
    #[schema(example = "gpt-4o")]
    model: Option<String>,
}

/// Submit a prompt for fan-out
#[derive(Deserialize, Validate, ToSchema)]
struct CreateTurnRequest {
    user_id: Uuid,
    session_id: Uuid,
    #[validate(length(min = 1, max = 32768))]
    message: String,
    #[serde(default)]
    image_urls: Vec<String>,
    providers: Vec<ProviderChoiceRequest>,
}

/// Submit a prompt and stream responses as they settle
///
/// Responds with an SSE stream: `turn_created`, then one
/// `response_settled` per provider in settlement order, then
/// `turn_completed`. Denials are returned as plain JSON before any
/// provider is called.
#[utoipa::path(
    post,
    path = "/turns",
    tag = "Turns",
    request_body = CreateTurnRequest,
    responses(
        (status = 200, description = "SSE stream of turn updates"),
        (status = 400, description = "Invalid request", body = Object),
        (status = 403, description = "Monthly quota exhausted", body = Object),
        (status = 404, description = "Account not found", body = Object),
        (status = 503, description = "Usage service unavailable", body = Object)
    )
)]
async fn submit_turn(
    State(state): State<AppState>,
    Json(req): Json<CreateTurnRequest>,
) -> Response {
    if let Err(errors) = req.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid prompt", "details": errors})),
        )
            .into_response();
    }

    let mut providers = Vec::with_capacity(req.providers.len());
    for choice in &req.providers {
        match parse_provider(choice.provider.as_str()) {
            Some(provider) => providers.push(ProviderChoice {
                provider,
                model: choice.model.clone(),
            }),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": format!("Invalid provider: {}", choice.provider),
                        "allowed": ALLOWED_PROVIDERS
                    })),
                )
                    .into_response();
            }
        }
    }

    let request = PromptRequest {
        user_id: req.user_id,
        session_id: req.session_id,
        message: req.message,
        image_urls: req.image_urls,
        providers,
    };

    let stream = match state.aggregator.submit(request).await {
        Ok(stream) => stream,
        Err(e) => return aggregate_error_response(e),
    };

    let mut updates = stream.updates;
    let sse_stream = async_stream::stream! {
        while let Some(update) = updates.recv().await {
            let name = match &update {
                TurnUpdate::TurnCreated { .. } => "turn_created",
                TurnUpdate::ResponseSettled { .. } => "response_settled",
                TurnUpdate::TurnCompleted { .. } => "turn_completed",
            };
            match Event::default().event(name).json_data(&update) {
                Ok(event) => yield Ok::<Event, Infallible>(event),
                Err(e) => warn!(error = %e, "Failed to serialize turn update"),
            }
        }
    };

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn aggregate_error_response(err: AggregateError) -> Response {
    match err {
        AggregateError::Gate(GateError::QuotaExceeded { used, quota, tier: current }) => {
            let upgrade = tier(TierId::Pro);
            (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": "Monthly conversation limit reached",
                    "used": used,
                    "quota": quota,
                    "tier": current.to_string(),
                    "upgrade": {
                        "tier": upgrade.id.to_string(),
                        "price": format_price(upgrade.price_cents),
                        "features": upgrade.features,
                    }
                })),
            )
                .into_response()
        }
        AggregateError::Gate(GateError::Unavailable(_))
        | AggregateError::Ledger(LedgerError::Unavailable(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "Usage service unavailable, please try again"})),
        )
            .into_response(),
        AggregateError::Gate(GateError::UnknownUser(_))
        | AggregateError::Ledger(LedgerError::UnknownUser(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "User not found"})),
        )
            .into_response(),
        AggregateError::NoProviders => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "At least one provider is required"})),
        )
            .into_response(),
        AggregateError::Repository(e) => {
            error!(error = %e, "Failed to create turn");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to create turn"})),
            )
                .into_response()
        }
    }
}

#[derive(Serialize, ToSchema)]
struct ResponseView {
    provider: String,
    model: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    selected: bool,
    #[schema(format = "date-time")]
    settled_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&ProviderResponse> for ResponseView {
    fn from(response: &ProviderResponse) -> Self {
        let (content, error_message) = match &response.state {
            ResponseState::Pending => (None, None),
            ResponseState::Success { content } => (Some(content.clone()), None),
            ResponseState::Error { message } => (None, Some(message.clone())),
        };
        Self {
            provider: response.provider.to_string(),
            model: response.model.clone(),
            state: response.state.as_str().to_string(),
            content,
            error_message,
            selected: response.selected,
            settled_at: response.settled_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
struct TurnView {
    id: Uuid,
    session_id: Uuid,
    user_id: Uuid,
    user_message: String,
    image_urls: Vec<String>,
    phase: String,
    responses: Vec<ResponseView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    selected_provider: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<ConversationTurn> for TurnView {
    fn from(turn: ConversationTurn) -> Self {
        Self {
            phase: turn.phase().to_string(),
            selected_provider: turn.selected_provider().map(|p| p.to_string()),
            responses: turn.responses.iter().map(ResponseView::from).collect(),
            id: turn.id,
            session_id: turn.session_id,
            user_id: turn.user_id,
            user_message: turn.user_message,
            image_urls: turn.image_urls,
            created_at: turn.created_at,
        }
    }
}

/// Fetch one turn with all responses
#[utoipa::path(
    get,
    path = "/turns/{id}",
    tag = "Turns",
    params(("id" = Uuid, Path, description = "Turn ID")),
    responses(
        (status = 200, description = "Turn found", body = TurnView),
        (status = 404, description = "Turn not found", body = Object)
    )
)]
async fn get_turn(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    use crate::infrastructure::{RepositoryError, TurnRepository};

    match state.turns.get_by_id(id).await {
        Ok(turn) => (StatusCode::OK, Json(serde_json::json!(TurnView::from(turn)))),
        Err(RepositoryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Turn not found"})),
        ),
        Err(e) => {
            error!(error = %e, "Failed to fetch turn");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to fetch turn"})),
            )
        }
    }
}

/// Select one response within a turn
#[derive(Deserialize, ToSchema)]
struct SelectionRequest {
    #[schema(example = "gemini")]
    provider: String,
}

/// Record which response the user picked
///
/// Re-selecting the same provider is a no-op; switching providers moves the
/// single selected flag without rewriting history.
#[utoipa::path(
    post,
    path = "/turns/{id}/selection",
    tag = "Turns",
    params(("id" = Uuid, Path, description = "Turn ID")),
    request_body = SelectionRequest,
    responses(
        (status = 200, description = "Selection recorded", body = TurnView),
        (status = 400, description = "Response not selectable", body = Object),
        (status = 404, description = "Turn not found", body = Object),
        (status = 409, description = "Turn still collecting", body = Object),
        (status = 500, description = "Selection failed", body = Object)
    )
)]
async fn select_response(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SelectionRequest>,
) -> impl IntoResponse {
    let provider = match parse_provider(req.provider.as_str()) {
        Some(p) => p,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("Invalid provider: {}", req.provider),
                    "allowed": ALLOWED_PROVIDERS
                })),
            );
        }
    };

    match state.recorder.record_selection(id, provider).await {
        Ok(turn) => (StatusCode::OK, Json(serde_json::json!(TurnView::from(turn)))),
        Err(SelectionError::TurnNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Turn not found"})),
        ),
        Err(SelectionError::Turn(TurnError::StillCollecting)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "Turn is still collecting responses"})),
        ),
        Err(SelectionError::Turn(e)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e) => {
            error!(error = %e, "Selection failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Selection failed"})),
            )
        }
    }
}

#[derive(Deserialize, Debug, IntoParams, ToSchema)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    #[param(default = 50, maximum = 200)]
    limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

const MAX_HISTORY_LIMIT: i64 = 200;

/// List a session's turns in chronological order
#[utoipa::path(
    get,
    path = "/sessions/{id}/turns",
    tag = "Turns",
    params(("id" = Uuid, Path, description = "Session ID"), HistoryParams),
    responses(
        (status = 200, description = "Session history", body = [TurnView]),
        (status = 500, description = "Failed to list turns", body = Object)
    )
)]
async fn list_session_turns(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    use crate::infrastructure::TurnRepository;

    let limit = params.limit.clamp(1, MAX_HISTORY_LIMIT);
    match state.turns.list_by_session(id, limit).await {
        Ok(turns) => {
            let views: Vec<TurnView> = turns.into_iter().map(TurnView::from).collect();
            (StatusCode::OK, Json(serde_json::json!(views)))
        }
        Err(e) => {
            error!(error = %e, "Failed to list session turns");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to list turns"})),
            )
        }
    }
}

/// Cancel a session's in-flight turn
#[utoipa::path(
    post,
    path = "/sessions/{id}/cancel",
    tag = "Turns",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses((status = 200, description = "Cancellation outcome", body = Object))
)]
async fn cancel_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let cancelled = state.aggregator.cancel_session(id);
    (StatusCode::OK, Json(serde_json::json!({"cancelled": cancelled})))
}

#[derive(Serialize, ToSchema)]
struct StatView {
    provider: String,
    total_responses: i64,
    total_selections: i64,
    error_count: i64,
    selection_rate: f64,
    error_rate: f64,
    #[schema(format = "date-time")]
    last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<ProviderStatistic> for StatView {
    fn from(stats: ProviderStatistic) -> Self {
        Self {
            selection_rate: stats.selection_rate(),
            error_rate: stats.error_rate(),
            provider: stats.provider.to_string(),
            total_responses: stats.total_responses,
            total_selections: stats.total_selections,
            error_count: stats.error_count,
            last_used_at: stats.last_used_at,
        }
    }
}

/// Per-provider selection and error rates
#[utoipa::path(
    get,
    path = "/stats/providers",
    tag = "Stats",
    responses(
        (status = 200, description = "Provider statistics", body = [StatView]),
        (status = 500, description = "Failed to list stats", body = Object)
    )
)]
async fn provider_stats(State(state): State<AppState>) -> impl IntoResponse {
    use crate::infrastructure::StatsRepository;

    match state.stats.list().await {
        Ok(stats) => {
            let views: Vec<StatView> = stats.into_iter().map(StatView::from).collect();
            (StatusCode::OK, Json(serde_json::json!(views)))
        }
        Err(e) => {
            error!(error = %e, "Failed to list provider stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to list stats"})),
            )
        }
    }
}
