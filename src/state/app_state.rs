// Application state shared by the HTTP handlers
// Holds the onboarding orchestrator; nothing in here is mutated per request

use crate::config::OnboardingConfig;
use crate::onboarding::platform::build_http_client;
use crate::onboarding::OnboardingOrchestrator;

/// State shared across handlers
///
/// Onboarding runs share no mutable state, so this is wrapped in a plain
/// `Arc` rather than a lock.
#[derive(Clone)]
pub struct AppState {
    orchestrator: OnboardingOrchestrator,
}

impl AppState {
    /// Build state from the onboarding configuration
    ///
    /// Creates the pooled HTTP client used for every platform call.
    pub fn new(config: OnboardingConfig) -> Result<Self, reqwest::Error> {
        let http = build_http_client(&config.platform)?;
        Ok(Self::with_client(http, config))
    }

    /// Build state around an existing HTTP client
    pub fn with_client(http: reqwest::Client, config: OnboardingConfig) -> Self {
        Self {
            orchestrator: OnboardingOrchestrator::new(http, config),
        }
    }

    /// The onboarding orchestrator
    pub fn orchestrator(&self) -> &OnboardingOrchestrator {
        &self.orchestrator
    }

    /// Configuration the orchestrator runs with
    pub fn config(&self) -> &OnboardingConfig {
        self.orchestrator.config()
    }
}
