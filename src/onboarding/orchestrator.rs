//! Onboarding orchestrator
//!
//! Runs the onboarding stages strictly in order, stops at the first
//! unrecoverable failure and produces exactly one terminal outcome. A run
//! cannot be resumed; calling [`OnboardingOrchestrator::run`] again replays
//! the whole pipeline from the token request.

use crate::config::OnboardingConfig;
use crate::onboarding::platform::PlatformClient;
use crate::onboarding::pollers::{poll_default_userstore, poll_role_assignment, poll_user_creation};
use crate::onboarding::steps::{
    acquire_token, create_org, delete_org, lookup_application, lookup_role, switch_org,
    validate_org_name,
};
use crate::onboarding::types::{
    AccessTokenContext, FailureKind, OnboardingRequest, OrgRecord, RoleAssignment, StepOutcome,
    UserRecord,
};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::time::Instant;
use tracing::Instrument;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Client-credentials token
    AcquireToken,
    /// Organization name availability
    ValidateName,
    /// Organization creation
    CreateOrg,
    /// Token exchange into the new organization
    SwitchContext,
    /// Wait for the DEFAULT userstore
    AwaitUserstore,
    /// Admin user creation
    ProvisionUser,
    /// Application id resolution
    LookupApplication,
    /// Admin role resolution
    LookupRole,
    /// Admin role membership
    AssignRole,
}

impl Stage {
    /// Stable identifier used in logs and error bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AcquireToken => "acquire_token",
            Stage::ValidateName => "validate_name",
            Stage::CreateOrg => "create_org",
            Stage::SwitchContext => "switch_context",
            Stage::AwaitUserstore => "await_userstore",
            Stage::ProvisionUser => "provision_user",
            Stage::LookupApplication => "lookup_application",
            Stage::LookupRole => "lookup_role",
            Stage::AssignRole => "assign_role",
        }
    }

    /// Short error summary reported when this stage fails
    pub fn failure_summary(&self) -> &'static str {
        match self {
            Stage::AcquireToken => "Failed to obtain access token",
            Stage::ValidateName => "Organization name validation failed",
            Stage::CreateOrg => "Organization creation failed",
            Stage::SwitchContext => "Failed to switch to the new organization",
            Stage::AwaitUserstore => "DEFAULT userstore check failed",
            Stage::ProvisionUser => "User creation failed",
            Stage::LookupApplication => "Application lookup failed",
            Stage::LookupRole => "Admin role lookup failed",
            Stage::AssignRole => "Adding user to role failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything created by a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct OnboardingResult {
    /// New organization
    pub organization: OrgRecord,
    /// New admin user
    pub user: UserRecord,
    /// Admin role membership confirmation
    pub role_assignment: RoleAssignment,
}

/// Terminal failure of a run
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    /// Stage that failed
    pub stage: Stage,
    /// Failure classification
    pub kind: FailureKind,
    /// HTTP status to report
    pub status: u16,
    /// Short summary
    pub error: String,
    /// Longer description
    pub message: Option<String>,
    /// Upstream error body, passed through verbatim
    pub details: Option<Value>,
}

impl StageFailure {
    fn timeout(stage: Stage, error: &str, message: &str) -> Self {
        Self {
            stage,
            kind: FailureKind::Timeout,
            status: 408,
            error: error.to_string(),
            message: Some(message.to_string()),
            details: None,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with HTTP {}: {}", self.stage, self.status, self.error)?;
        if let Some(message) = &self.message {
            write!(f, " ({})", message)?;
        }
        Ok(())
    }
}

/// Terminal state of an onboarding run
#[derive(Debug, Clone, PartialEq)]
pub enum OnboardingOutcome {
    /// Every stage succeeded
    Done(OnboardingResult),
    /// The first unrecoverable failure
    Failed(StageFailure),
}

/// Map a stage outcome onto the pipeline's control flow
///
/// A retryable failure only reaches the orchestrator when a poller gave up,
/// so it is reported as a timeout.
fn settle<T>(stage: Stage, outcome: StepOutcome<T>) -> Result<T, StageFailure> {
    match outcome {
        StepOutcome::Success(value) => Ok(value),
        StepOutcome::RetryableFailure(reason) => Err(StageFailure::timeout(
            stage,
            &reason,
            &format!(
                "The {} stage did not complete within its retry budget. Please try again later.",
                stage
            ),
        )),
        StepOutcome::FatalFailure(fault) => Err(StageFailure {
            stage,
            kind: fault.kind,
            status: fault.status,
            error: stage.failure_summary().to_string(),
            message: Some(fault.message),
            details: fault.details,
        }),
    }
}

/// Mutations already applied to the platform by the current run
#[derive(Default)]
struct RunProgress {
    service_token: Option<AccessTokenContext>,
    organization: Option<OrgRecord>,
}

/// Sequences the onboarding stages for one request at a time
///
/// Holds only immutable configuration and a pooled HTTP client, so one
/// instance can serve concurrent runs for different tenants.
#[derive(Clone)]
pub struct OnboardingOrchestrator {
    client: PlatformClient,
    config: OnboardingConfig,
}

impl OnboardingOrchestrator {
    /// Create an orchestrator for the configured platform
    pub fn new(http: reqwest::Client, config: OnboardingConfig) -> Self {
        Self {
            client: PlatformClient::new(http, &config.platform),
            config,
        }
    }

    /// Configuration the orchestrator was built with
    pub fn config(&self) -> &OnboardingConfig {
        &self.config
    }

    /// Run the whole pipeline for one request
    pub async fn run(&self, request: &OnboardingRequest) -> OnboardingOutcome {
        let span = tracing::info_span!(
            "onboarding",
            organization = %request.organization_name,
            application = %request.application_name,
        );
        async {
            let started = Instant::now();
            let mut progress = RunProgress::default();

            match self.execute(request, &mut progress).await {
                Ok(result) => {
                    tracing::info!(
                        org_id = %result.organization.id,
                        user_id = %result.user.id,
                        elapsed_ms = started.elapsed().as_millis(),
                        "Onboarding completed"
                    );
                    OnboardingOutcome::Done(result)
                }
                Err(failure) => {
                    tracing::error!(
                        stage = %failure.stage,
                        status_code = failure.status,
                        error = %failure,
                        elapsed_ms = started.elapsed().as_millis(),
                        "Onboarding failed"
                    );
                    if self.config.rollback_on_failure {
                        self.roll_back(&progress).await;
                    }
                    OnboardingOutcome::Failed(failure)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        request: &OnboardingRequest,
        progress: &mut RunProgress,
    ) -> Result<OnboardingResult, StageFailure> {
        let client = &self.client;
        let polling = &self.config.polling;

        tracing::debug!(stage = %Stage::AcquireToken, "Entering stage");
        let service_token = settle(Stage::AcquireToken, acquire_token(client).await)?;
        progress.service_token = Some(service_token.clone());

        tracing::debug!(stage = %Stage::ValidateName, "Entering stage");
        settle(
            Stage::ValidateName,
            validate_org_name(client, &service_token, &request.organization_name).await,
        )?;

        tracing::debug!(stage = %Stage::CreateOrg, "Entering stage");
        let organization = settle(
            Stage::CreateOrg,
            create_org(client, &service_token, &request.organization_name).await,
        )?;
        progress.organization = Some(organization.clone());
        tracing::info!(org_id = %organization.id, "Organization created");

        tracing::debug!(stage = %Stage::SwitchContext, "Entering stage");
        let org_token = settle(
            Stage::SwitchContext,
            switch_org(client, &service_token, &organization.id).await,
        )?;

        tracing::debug!(stage = %Stage::AwaitUserstore, "Entering stage");
        let userstore_ready = settle(
            Stage::AwaitUserstore,
            StepOutcome::<bool>::from(
                poll_default_userstore(client, &org_token, polling.userstore_policy()).await,
            ),
        )?;
        if !userstore_ready {
            return Err(StageFailure::timeout(
                Stage::AwaitUserstore,
                "Timed out waiting for DEFAULT userstore to be provisioned",
                "The organization was created, but the DEFAULT userstore was not provisioned in time. Please try again later.",
            ));
        }

        tracing::debug!(stage = %Stage::ProvisionUser, "Entering stage");
        let user = settle(
            Stage::ProvisionUser,
            poll_user_creation(
                client,
                &org_token,
                request,
                polling.user_policy(),
                self.config.verify_before_retry,
            )
            .await,
        )?;

        tracing::debug!(stage = %Stage::LookupApplication, "Entering stage");
        let application_id = settle(
            Stage::LookupApplication,
            lookup_application(client, &org_token, &request.application_name).await,
        )?;

        tracing::debug!(stage = %Stage::LookupRole, "Entering stage");
        let role = settle(
            Stage::LookupRole,
            lookup_role(
                client,
                &org_token,
                &self.config.platform.admin_role_name,
                &application_id,
            )
            .await,
        )?;

        tracing::debug!(stage = %Stage::AssignRole, "Entering stage");
        let role_assignment = settle(
            Stage::AssignRole,
            poll_role_assignment(client, &org_token, &role.id, &user.id, polling.role_policy())
                .await,
        )?;

        Ok(OnboardingResult {
            organization,
            user,
            role_assignment,
        })
    }

    /// Delete the organization created by a failed run
    ///
    /// Best effort: the outcome is logged and never replaces the original
    /// failure.
    async fn roll_back(&self, progress: &RunProgress) {
        let (Some(token), Some(org)) = (&progress.service_token, &progress.organization) else {
            return;
        };

        match delete_org(&self.client, token, &org.id).await {
            StepOutcome::Success(()) => {
                tracing::info!(org_id = %org.id, "Rolled back organization")
            }
            StepOutcome::FatalFailure(fault) => {
                tracing::error!(org_id = %org.id, error = %fault, "Organization rollback failed")
            }
            StepOutcome::RetryableFailure(reason) => {
                tracing::error!(org_id = %org.id, reason = %reason, "Organization rollback failed")
            }
        }
    }
}
