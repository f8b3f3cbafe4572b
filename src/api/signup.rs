//! Signup API handler
//!
//! `POST /api/signup` onboards an organization and its first administrator.
//! The handler validates input, runs the onboarding pipeline and renders
//! exactly one terminal JSON result.

use crate::error::AppError;
use crate::onboarding::{OnboardingOutcome, OnboardingRequest, SignupPayload};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Successful signup response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupResponse {
    /// Always `true`
    pub success: bool,
    /// Organization as returned by the platform
    pub organization: Value,
    /// Admin user as returned by the platform
    pub user: Value,
    /// Role patch response
    pub role_assignment: Value,
}

/// Reject requests for an application this deployment does not serve
fn check_application(state: &AppState, request: &OnboardingRequest) -> Result<(), AppError> {
    match &state.config().platform.application_name {
        Some(expected) if expected != &request.application_name => Err(AppError::Validation(
            format!("Unknown application: {}", request.application_name),
        )),
        _ => Ok(()),
    }
}

/// POST /api/signup - Onboard a new organization and its admin user
///
/// # Flow
/// 1. Validate the payload (no remote call is made when this fails). A body
///    that is not a JSON object of strings is a validation error too.
/// 2. Run the onboarding pipeline
/// 3. Return `201` with the created records, or the first failure
///
/// # Returns
/// * `Ok((201, SignupResponse))` - Organization, user and role assignment
/// * `Err(AppError)` - Validation error or the failing stage
pub async fn signup(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SignupPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<SignupResponse>), AppError> {
    let Json(payload) = payload.map_err(|rejection| {
        tracing::warn!(status_code = rejection.status().as_u16(), "Malformed signup body");
        AppError::Validation(rejection.body_text())
    })?;
    let request = OnboardingRequest::try_from(payload)?;
    check_application(&state, &request)?;

    tracing::info!(
        organization = %request.organization_name,
        application = %request.application_name,
        "Signup requested"
    );

    match state.orchestrator().run(&request).await {
        OnboardingOutcome::Done(result) => Ok((
            StatusCode::CREATED,
            Json(SignupResponse {
                success: true,
                organization: result.organization.raw,
                user: result.user.raw,
                role_assignment: result.role_assignment.raw,
            }),
        )),
        OnboardingOutcome::Failed(failure) => Err(failure.into()),
    }
}
