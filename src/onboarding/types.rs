//! Onboarding data model
//!
//! Request, credential, record and outcome types threaded through the
//! onboarding pipeline. Every stage returns a [`StepOutcome`]; the
//! orchestrator branches on its tag and never on transport details.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Raw onboarding payload as sent by the UI
///
/// Every field is optional here so that missing values are reported by
/// [`OnboardingRequest::try_from`] as validation errors instead of being
/// rejected by the JSON extractor.
#[derive(Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SignupPayload {
    /// Admin user's given name
    pub first_name: Option<String>,
    /// Admin user's family name
    pub last_name: Option<String>,
    /// Admin user's email, also used as the user name
    pub email: Option<String>,
    /// Admin user's initial password
    pub password: Option<String>,
    /// Desired organization name
    pub organization_name: Option<String>,
    /// Display name of the application the admin role belongs to
    pub application_name: Option<String>,
}

/// Validated onboarding request
///
/// Immutable for the lifetime of one onboarding run.
#[derive(Clone, PartialEq, Eq)]
pub struct OnboardingRequest {
    /// Admin user's given name
    pub first_name: String,
    /// Admin user's family name
    pub last_name: String,
    /// Admin user's email
    pub email: String,
    /// Admin user's initial password
    pub password: String,
    /// Desired organization name
    pub organization_name: String,
    /// Application display name
    pub application_name: String,
}

impl fmt::Debug for OnboardingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnboardingRequest")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("organization_name", &self.organization_name)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl TryFrom<SignupPayload> for OnboardingRequest {
    type Error = AppError;

    fn try_from(payload: SignupPayload) -> Result<Self, Self::Error> {
        let mut missing = Vec::new();
        let mut take = |value: Option<String>, label: &'static str| {
            match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
                Some(v) => v,
                None => {
                    missing.push(label);
                    String::new()
                }
            }
        };

        let first_name = take(payload.first_name, "First Name");
        let last_name = take(payload.last_name, "Last Name");
        let email = take(payload.email, "Email");
        let organization_name = take(payload.organization_name, "Team Name");
        let application_name = take(payload.application_name, "Application Name");
        // Passwords are taken verbatim; only emptiness is rejected.
        let password = match payload.password.filter(|p| !p.is_empty()) {
            Some(p) => p,
            None => {
                missing.push("Password");
                String::new()
            }
        };

        if !missing.is_empty() {
            return Err(AppError::Validation(format!(
                "All fields are required: Email, Password, First Name, Last Name, Team Name and Application Name (missing: {})",
                missing.join(", ")
            )));
        }

        if !is_plausible_email(&email) {
            return Err(AppError::Validation(format!(
                "Invalid email address: {}",
                email
            )));
        }

        Ok(Self {
            first_name,
            last_name,
            email,
            password,
            organization_name,
            application_name,
        })
    }
}

fn is_plausible_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

/// Authority carried by an access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenScope {
    /// Root organization service authority
    Service,
    /// Authority restricted to one organization
    Organization(String),
}

/// Bearer credential plus the scope it was issued for
///
/// Owned by a single onboarding run and dropped with it. Only
/// [`steps::switch_org`](crate::onboarding::steps::switch_org) produces an
/// organization-scoped context.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessTokenContext {
    token: String,
    scope: TokenScope,
}

impl AccessTokenContext {
    pub(crate) fn service(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            scope: TokenScope::Service,
        }
    }

    pub(crate) fn organization(token: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            scope: TokenScope::Organization(org_id.into()),
        }
    }

    /// Raw bearer token
    pub fn bearer(&self) -> &str {
        &self.token
    }

    /// Scope the token was issued for
    pub fn scope(&self) -> &TokenScope {
        &self.scope
    }

    /// Organization id when the token is organization-scoped
    pub fn org_id(&self) -> Option<&str> {
        match &self.scope {
            TokenScope::Organization(id) => Some(id),
            TokenScope::Service => None,
        }
    }
}

impl fmt::Debug for AccessTokenContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenContext")
            .field("token", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Organization created by this run
#[derive(Debug, Clone, PartialEq)]
pub struct OrgRecord {
    /// Platform-assigned id, the join key for every later stage
    pub id: String,
    /// Organization name
    pub name: String,
    /// Body returned by the platform
    pub raw: Value,
}

/// Admin user created by this run
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    /// SCIM user id
    pub id: String,
    /// Body returned by the platform
    pub raw: Value,
}

/// Administrator role resolved for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRecord {
    /// SCIM role id
    pub id: String,
    /// Role display name
    pub display_name: String,
    /// Application id the role is scoped to
    pub audience: String,
}

/// Confirmation that the user was added to the role
#[derive(Debug, Clone, PartialEq)]
pub struct RoleAssignment {
    /// Role the user was added to
    pub role_id: String,
    /// User that was added
    pub user_id: String,
    /// Body returned by the platform
    pub raw: Value,
}

/// Classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Platform declined the step; status is passed through
    Rejected,
    /// Name already taken or duplicate resource
    Conflict,
    /// Application or role the run depends on does not exist
    NotFound,
    /// A poller exhausted its budget
    Timeout,
    /// Platform could not be reached
    Unavailable,
    /// Unexpected response shape or local error
    Internal,
}

/// Fatal failure reported by a stage
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Failure classification
    pub kind: FailureKind,
    /// HTTP status to report
    pub status: u16,
    /// Human-readable description
    pub message: String,
    /// Upstream error body, passed through verbatim
    pub details: Option<Value>,
}

impl Fault {
    /// Platform declined the step with the given status
    ///
    /// Only 409 is reclassified; every other status, 404 included, is
    /// passed through as a rejection with its body.
    pub fn rejected(status: u16, message: impl Into<String>, details: Option<Value>) -> Self {
        let kind = match status {
            409 => FailureKind::Conflict,
            _ => FailureKind::Rejected,
        };
        Self {
            kind,
            status,
            message: message.into(),
            details,
        }
    }

    /// Name or resource conflict
    pub fn conflict(message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            kind: FailureKind::Conflict,
            status: 409,
            message: message.into(),
            details,
        }
    }

    /// Expected resource missing
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NotFound,
            status: 404,
            message: message.into(),
            details: None,
        }
    }

    /// Transport-level failure
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unavailable,
            status: 500,
            message: message.into(),
            details: None,
        }
    }

    /// Unexpected response or local error
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            status: 500,
            message: message.into(),
            details: None,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (HTTP {})", self.message, self.status)
    }
}

/// Result shape shared by every pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T> {
    /// Stage completed
    Success(T),
    /// Stage did not complete but may on a later attempt
    RetryableFailure(String),
    /// Stage failed and the pipeline must stop
    FatalFailure(Fault),
}

impl<T> From<Result<T, Fault>> for StepOutcome<T> {
    fn from(result: Result<T, Fault>) -> Self {
        match result {
            Ok(value) => StepOutcome::Success(value),
            Err(fault) => StepOutcome::FatalFailure(fault),
        }
    }
}

/// Bound on a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBudget {
    /// At most this many attempts
    Attempts(u32),
    /// No attempt starts after this much time has passed
    Elapsed(Duration),
}

/// Budget and pacing for one poller invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Termination bound
    pub budget: PollBudget,
    /// Wait between attempts
    pub interval: Duration,
}

impl PollPolicy {
    /// Attempt-bounded policy
    pub fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            budget: PollBudget::Attempts(max_attempts),
            interval,
        }
    }

    /// Time-bounded policy
    pub fn elapsed(max_elapsed: Duration, interval: Duration) -> Self {
        Self {
            budget: PollBudget::Elapsed(max_elapsed),
            interval,
        }
    }
}
