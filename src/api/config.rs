//! Configuration API handler
//!
//! Exposes the effective onboarding configuration for operators. The client
//! secret is never serialized.

use crate::config::OnboardingConfig;
use crate::state::AppState;
use axum::{extract::State, Json};
use std::sync::Arc;

/// GET /api/config - Effective onboarding configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<OnboardingConfig> {
    Json(state.config().clone())
}
