//! Bounded polling stages
//!
//! The platform provisions a new organization's userstore asynchronously, so
//! the stages that depend on it retry responses that mean "not ready yet"
//! and fail fast on everything else. Every loop is bounded by a
//! [`PollPolicy`] and terminates.

use crate::onboarding::constants::{
    DEFAULT_USERSTORE, INVALID_USERSTORE_SCIM_TYPE, SCIM_PATCH_OP_SCHEMA, SCIM_ROLES_PATH,
    SCIM_USERS_PATH, SCIM_USER_SCHEMA, USERSTORES_PATH,
};
use crate::onboarding::platform::{PlatformClient, PlatformResponse};
use crate::onboarding::types::{
    AccessTokenContext, Fault, OnboardingRequest, PollBudget, PollPolicy, RoleAssignment,
    StepOutcome, UserRecord,
};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};

/// Attempt counter and deadline for one poller invocation
struct PollClock {
    policy: PollPolicy,
    started: Instant,
    attempts: u32,
}

impl PollClock {
    fn start(policy: PollPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            attempts: 0,
        }
    }

    /// Claim the next attempt, or `None` once the budget is spent
    fn next_attempt(&mut self) -> Option<u32> {
        let allowed = match self.policy.budget {
            PollBudget::Attempts(max) => self.attempts < max,
            PollBudget::Elapsed(limit) => self.started.elapsed() < limit,
        };
        if !allowed {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Wait before the next attempt
    ///
    /// Skips the wait after the final attempt and never sleeps past the
    /// deadline of an elapsed budget.
    async fn wait(&self) {
        let pause = match self.policy.budget {
            PollBudget::Attempts(max) if self.attempts >= max => return,
            PollBudget::Attempts(_) => self.policy.interval,
            PollBudget::Elapsed(limit) => {
                let remaining = limit.saturating_sub(self.started.elapsed());
                if remaining.is_zero() {
                    return;
                }
                remaining.min(self.policy.interval)
            }
        };
        sleep(pause).await;
    }

    fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

fn has_default_userstore(body: &Value) -> bool {
    body.as_array()
        .map(|stores| {
            stores.iter().any(|store| {
                store.get("name").and_then(Value::as_str) == Some(DEFAULT_USERSTORE)
                    || store.get("id").and_then(Value::as_str) == Some(DEFAULT_USERSTORE)
            })
        })
        .unwrap_or(false)
}

/// Poll until the organization's `DEFAULT` userstore is listed
///
/// Listing errors, transport errors and lists without `DEFAULT` are all
/// treated as provisioning lag. Returns `Ok(false)` once the budget is
/// spent; `Err` only when the token cannot address the organization.
pub async fn poll_default_userstore(
    client: &PlatformClient,
    token: &AccessTokenContext,
    policy: PollPolicy,
) -> Result<bool, Fault> {
    let url = client.org_url(token, USERSTORES_PATH)?;

    let mut clock = PollClock::start(policy);
    while let Some(attempt) = clock.next_attempt() {
        let request = client
            .http()
            .get(&url)
            .bearer_auth(token.bearer())
            .header(reqwest::header::ACCEPT, "application/json");

        match client.send(request, "userstore listing").await {
            Ok(response) if response.status == 200 => {
                if has_default_userstore(&response.body) {
                    tracing::info!(
                        attempt = attempt,
                        elapsed_ms = clock.elapsed_ms(),
                        "DEFAULT userstore available"
                    );
                    return Ok(true);
                }
                tracing::debug!(attempt = attempt, "DEFAULT userstore not listed yet");
            }
            Ok(response) => {
                tracing::debug!(
                    attempt = attempt,
                    status_code = response.status,
                    "Userstore listing not ready"
                );
            }
            Err(fault) => {
                tracing::warn!(attempt = attempt, error = %fault, "Userstore listing failed");
            }
        }

        clock.wait().await;
    }

    tracing::warn!(
        attempts = clock.attempts,
        elapsed_ms = clock.elapsed_ms(),
        "Gave up waiting for DEFAULT userstore"
    );
    Ok(false)
}

fn scim_user_name(email: &str) -> String {
    format!("{}/{}", DEFAULT_USERSTORE, email)
}

fn user_record(response: PlatformResponse) -> Result<UserRecord, Fault> {
    let id = response
        .body
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Fault::internal("User creation response contains no id"))?;
    Ok(UserRecord {
        id,
        raw: response.body,
    })
}

fn is_userstore_not_ready(response: &PlatformResponse) -> bool {
    response.status == 400
        && response.body.get("scimType").and_then(Value::as_str)
            == Some(INVALID_USERSTORE_SCIM_TYPE)
}

/// Look for a user an earlier attempt may already have created
async fn find_existing_user(
    client: &PlatformClient,
    token: &AccessTokenContext,
    user_name: &str,
) -> Option<UserRecord> {
    let url = client.org_url(token, SCIM_USERS_PATH).ok()?;
    let filter = format!("userName eq \"{}\"", user_name);
    let request = client
        .http()
        .get(url)
        .bearer_auth(token.bearer())
        .query(&[("filter", filter.as_str())]);
    let response = client.send(request, "user lookup").await.ok()?;
    if response.status != 200 {
        return None;
    }

    match response.body.get("Resources").and_then(Value::as_array) {
        Some(resources) if resources.len() == 1 => {
            let existing = resources[0].clone();
            let id = existing.get("id").and_then(Value::as_str)?.to_string();
            Some(UserRecord { id, raw: existing })
        }
        _ => None,
    }
}

/// Create the admin user, retrying while the userstore is not attached
///
/// A 400 with SCIM type `Invalid user store name.` and transport errors are
/// retried; any other non-success response fails immediately. With
/// `verify_before_retry`, every retry first checks whether a previous
/// attempt already created the user, so the create is issued at most once
/// per user that actually exists.
pub async fn poll_user_creation(
    client: &PlatformClient,
    token: &AccessTokenContext,
    request: &OnboardingRequest,
    policy: PollPolicy,
    verify_before_retry: bool,
) -> StepOutcome<UserRecord> {
    let url = match client.org_url(token, SCIM_USERS_PATH) {
        Ok(url) => url,
        Err(fault) => return StepOutcome::FatalFailure(fault),
    };
    let user_name = scim_user_name(&request.email);
    let body = json!({
        "schemas": [SCIM_USER_SCHEMA],
        "userName": user_name,
        "name": {
            "givenName": request.first_name,
            "familyName": request.last_name,
        },
        "emails": [{ "value": request.email, "primary": true }],
        "password": request.password,
    });

    let mut clock = PollClock::start(policy);
    while let Some(attempt) = clock.next_attempt() {
        if attempt > 1 && verify_before_retry {
            if let Some(existing) = find_existing_user(client, token, &user_name).await {
                tracing::info!(
                    attempt = attempt,
                    user_id = %existing.id,
                    "User already exists from an earlier attempt"
                );
                return StepOutcome::Success(existing);
            }
        }

        let create = client
            .http()
            .post(&url)
            .bearer_auth(token.bearer())
            .json(&body);

        match client.send(create, "user creation").await {
            Ok(response) if response.status == 200 || response.status == 201 => {
                tracing::info!(
                    attempt = attempt,
                    elapsed_ms = clock.elapsed_ms(),
                    "Admin user created"
                );
                return user_record(response).into();
            }
            Ok(response) if is_userstore_not_ready(&response) => {
                tracing::debug!(attempt = attempt, "Userstore not attached yet, retrying");
            }
            Ok(response) => {
                tracing::error!(
                    attempt = attempt,
                    status_code = response.status,
                    "User creation rejected"
                );
                return StepOutcome::FatalFailure(response.into_fault("User creation failed"));
            }
            Err(fault) => {
                tracing::warn!(attempt = attempt, error = %fault, "User creation request failed");
            }
        }

        clock.wait().await;
    }

    tracing::warn!(
        attempts = clock.attempts,
        elapsed_ms = clock.elapsed_ms(),
        "User creation timed out"
    );
    StepOutcome::RetryableFailure("User creation timed out".to_string())
}

/// Add the user to the role, retrying while the platform answers 400
///
/// A freshly created user is not always linkable straight away; the
/// platform reports that as 400. 200, 201 and 204 are success; anything
/// else fails immediately.
pub async fn poll_role_assignment(
    client: &PlatformClient,
    token: &AccessTokenContext,
    role_id: &str,
    user_id: &str,
    policy: PollPolicy,
) -> StepOutcome<RoleAssignment> {
    let url = match client.org_url(token, &format!("{}/{}", SCIM_ROLES_PATH, role_id)) {
        Ok(url) => url,
        Err(fault) => return StepOutcome::FatalFailure(fault),
    };
    let body = json!({
        "schemas": [SCIM_PATCH_OP_SCHEMA],
        "Operations": [{
            "op": "add",
            "path": "users",
            "value": [{ "value": user_id }],
        }],
    });

    let mut clock = PollClock::start(policy);
    while let Some(attempt) = clock.next_attempt() {
        let patch = client
            .http()
            .patch(&url)
            .bearer_auth(token.bearer())
            .json(&body);

        match client.send(patch, "role assignment").await {
            Ok(response) if matches!(response.status, 200 | 201 | 204) => {
                tracing::info!(
                    attempt = attempt,
                    elapsed_ms = clock.elapsed_ms(),
                    "User added to admin role"
                );
                let raw = match response.body {
                    Value::Null => json!({ "id": role_id }),
                    body => body,
                };
                return StepOutcome::Success(RoleAssignment {
                    role_id: role_id.to_string(),
                    user_id: user_id.to_string(),
                    raw,
                });
            }
            Ok(response) if response.status == 400 => {
                tracing::debug!(attempt = attempt, "Role patch not accepted yet, retrying");
            }
            Ok(response) => {
                tracing::error!(
                    attempt = attempt,
                    status_code = response.status,
                    "Role assignment rejected"
                );
                return StepOutcome::FatalFailure(
                    response.into_fault("Adding user to role failed"),
                );
            }
            Err(fault) => {
                tracing::warn!(attempt = attempt, error = %fault, "Role patch request failed");
            }
        }

        clock.wait().await;
    }

    tracing::warn!(
        attempts = clock.attempts,
        elapsed_ms = clock.elapsed_ms(),
        "Role assignment timed out"
    );
    StepOutcome::RetryableFailure("Role assignment timed out".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::onboarding::types::FailureKind;
    use mockito::{Matcher, Server};
    use std::time::Duration;

    const USER_STORE_NOT_READY: &str =
        r#"{"schemas": ["urn:ietf:params:scim:api:messages:2.0:Error"], "scimType": "Invalid user store name.", "detail": "Invalid user store name.", "status": "400"}"#;

    fn client_for(base_url: &str) -> PlatformClient {
        let config = PlatformConfig {
            base_url: base_url.to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec![],
            admin_role_name: "Administrator".to_string(),
            application_name: None,
            request_timeout_secs: 5,
        };
        PlatformClient::new(reqwest::Client::new(), &config)
    }

    fn org_token() -> AccessTokenContext {
        AccessTokenContext::organization("org-token", "org-1")
    }

    fn request() -> OnboardingRequest {
        OnboardingRequest {
            first_name: "Ann".to_string(),
            last_name: "Lee".to_string(),
            email: "ann@x.com".to_string(),
            password: "P@ssw0rd".to_string(),
            organization_name: "acme".to_string(),
            application_name: "Teamspace".to_string(),
        }
    }

    fn fast_attempts(max: u32) -> PollPolicy {
        PollPolicy::attempts(max, Duration::from_millis(5))
    }

    fn fast_elapsed(max_ms: u64) -> PollPolicy {
        PollPolicy::elapsed(Duration::from_millis(max_ms), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_clock_attempt_budget() {
        let mut clock = PollClock::start(fast_attempts(3));
        assert_eq!(clock.next_attempt(), Some(1));
        assert_eq!(clock.next_attempt(), Some(2));
        assert_eq!(clock.next_attempt(), Some(3));
        assert_eq!(clock.next_attempt(), None);
    }

    #[tokio::test]
    async fn test_clock_elapsed_budget_never_oversleeps() {
        let policy = PollPolicy::elapsed(Duration::from_millis(30), Duration::from_secs(10));
        let mut clock = PollClock::start(policy);
        assert_eq!(clock.next_attempt(), Some(1));
        let before = Instant::now();
        clock.wait().await;
        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(clock.next_attempt(), None);
    }

    #[tokio::test]
    async fn test_userstore_found_on_nth_attempt() {
        let mut server = Server::new_async().await;
        let pending = server
            .mock("GET", "/o/org-1/api/server/v1/userstores")
            .match_header("authorization", "Bearer org-token")
            .with_status(200)
            .with_body(r#"[{"id": "U0VDT05EQVJZ", "name": "SECONDARY"}]"#)
            .expect(3)
            .create_async()
            .await;
        let ready = server
            .mock("GET", "/o/org-1/api/server/v1/userstores")
            .with_status(200)
            .with_body(r#"[{"id": "REVGQVVMVA", "name": "DEFAULT"}]"#)
            .expect(1)
            .create_async()
            .await;

        let found =
            poll_default_userstore(&client_for(&server.url()), &org_token(), fast_attempts(10))
                .await
                .unwrap();

        assert!(found);
        pending.assert_async().await;
        ready.assert_async().await;
    }

    #[tokio::test]
    async fn test_userstore_non_200_is_retried() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", "/o/org-1/api/server/v1/userstores")
            .with_status(404)
            .with_body(r#"{"code": "USS-20001"}"#)
            .expect(1)
            .create_async()
            .await;
        let ready = server
            .mock("GET", "/o/org-1/api/server/v1/userstores")
            .with_status(200)
            .with_body(r#"[{"id": "DEFAULT", "name": "PRIMARY"}]"#)
            .expect(1)
            .create_async()
            .await;

        let found =
            poll_default_userstore(&client_for(&server.url()), &org_token(), fast_attempts(5))
                .await
                .unwrap();

        assert!(found);
        failing.assert_async().await;
        ready.assert_async().await;
    }

    #[tokio::test]
    async fn test_userstore_never_ready_stops_at_max_attempts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/o/org-1/api/server/v1/userstores")
            .with_status(200)
            .with_body("[]")
            .expect(4)
            .create_async()
            .await;

        let found =
            poll_default_userstore(&client_for(&server.url()), &org_token(), fast_attempts(4))
                .await
                .unwrap();

        assert!(!found);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_userstore_service_token_is_internal_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let token = AccessTokenContext::service("svc");
        let fault = poll_default_userstore(&client_for(&server.url()), &token, fast_attempts(3))
            .await
            .unwrap_err();

        assert_eq!(fault.kind, FailureKind::Internal);
        assert_eq!(fault.status, 500);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_user_created_after_userstore_attaches() {
        let mut server = Server::new_async().await;
        // 10 s / 1 s budget scaled down: 9 not-ready answers, then created
        let not_ready = server
            .mock("POST", "/o/org-1/scim2/Users")
            .with_status(400)
            .with_body(USER_STORE_NOT_READY)
            .expect(9)
            .create_async()
            .await;
        let created = server
            .mock("POST", "/o/org-1/scim2/Users")
            .match_body(Matcher::PartialJson(json!({
                "userName": "DEFAULT/ann@x.com",
                "name": {"givenName": "Ann", "familyName": "Lee"}
            })))
            .with_status(201)
            .with_body(r#"{"id": "user-1", "userName": "DEFAULT/ann@x.com"}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = poll_user_creation(
            &client_for(&server.url()),
            &org_token(),
            &request(),
            fast_elapsed(5_000),
            false,
        )
        .await;

        not_ready.assert_async().await;
        created.assert_async().await;
        match outcome {
            StepOutcome::Success(user) => {
                assert_eq!(user.id, "user-1");
                assert_eq!(user.raw["userName"], "DEFAULT/ann@x.com");
            }
            other => panic!("Expected created user, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_other_400_fails_on_first_attempt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/o/org-1/scim2/Users")
            .with_status(400)
            .with_body(r#"{"scimType": "invalidValue", "detail": "Password policy violation."}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = poll_user_creation(
            &client_for(&server.url()),
            &org_token(),
            &request(),
            fast_elapsed(5_000),
            true,
        )
        .await;

        mock.assert_async().await;
        match outcome {
            StepOutcome::FatalFailure(fault) => {
                assert_eq!(fault.status, 400);
                assert_eq!(fault.message, "Password policy violation.");
            }
            other => panic!("Expected fatal failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_creation_times_out() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/o/org-1/scim2/Users")
            .with_status(400)
            .with_body(USER_STORE_NOT_READY)
            .expect_at_least(2)
            .create_async()
            .await;

        let outcome = poll_user_creation(
            &client_for(&server.url()),
            &org_token(),
            &request(),
            fast_elapsed(100),
            false,
        )
        .await;

        assert_eq!(
            outcome,
            StepOutcome::RetryableFailure("User creation timed out".to_string())
        );
    }

    #[tokio::test]
    async fn test_user_retry_adopts_user_created_by_earlier_attempt() {
        let mut server = Server::new_async().await;
        let create = server
            .mock("POST", "/o/org-1/scim2/Users")
            .with_status(400)
            .with_body(USER_STORE_NOT_READY)
            .expect(1)
            .create_async()
            .await;
        let lookup = server
            .mock("GET", "/o/org-1/scim2/Users")
            .match_query(Matcher::UrlEncoded(
                "filter".into(),
                "userName eq \"DEFAULT/ann@x.com\"".into(),
            ))
            .with_status(200)
            .with_body(r#"{"totalResults": 1, "Resources": [{"id": "user-1"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = poll_user_creation(
            &client_for(&server.url()),
            &org_token(),
            &request(),
            fast_elapsed(5_000),
            true,
        )
        .await;

        create.assert_async().await;
        lookup.assert_async().await;
        match outcome {
            StepOutcome::Success(user) => assert_eq!(user.id, "user-1"),
            other => panic!("Expected adopted user, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_role_assignment_retries_400() {
        let mut server = Server::new_async().await;
        let pending = server
            .mock("PATCH", "/o/org-1/scim2/v2/Roles/role-1")
            .with_status(400)
            .expect(2)
            .create_async()
            .await;
        let done = server
            .mock("PATCH", "/o/org-1/scim2/v2/Roles/role-1")
            .match_body(Matcher::PartialJson(json!({
                "Operations": [{"op": "add", "path": "users", "value": [{"value": "user-1"}]}]
            })))
            .with_status(200)
            .with_body(r#"{"id": "role-1", "displayName": "Administrator"}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = poll_role_assignment(
            &client_for(&server.url()),
            &org_token(),
            "role-1",
            "user-1",
            fast_elapsed(5_000),
        )
        .await;

        pending.assert_async().await;
        done.assert_async().await;
        match outcome {
            StepOutcome::Success(assignment) => {
                assert_eq!(assignment.user_id, "user-1");
                assert_eq!(assignment.raw["displayName"], "Administrator");
            }
            other => panic!("Expected assignment, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_role_assignment_other_status_is_fatal() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/o/org-1/scim2/v2/Roles/role-1")
            .with_status(403)
            .with_body(r#"{"detail": "Operation is not permitted."}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = poll_role_assignment(
            &client_for(&server.url()),
            &org_token(),
            "role-1",
            "user-1",
            fast_elapsed(5_000),
        )
        .await;

        mock.assert_async().await;
        match outcome {
            StepOutcome::FatalFailure(fault) => {
                assert_eq!(fault.status, 403);
                assert_eq!(fault.kind, FailureKind::Rejected);
            }
            other => panic!("Expected fatal failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_role_assignment_times_out() {
        let mut server = Server::new_async().await;
        server
            .mock("PATCH", "/o/org-1/scim2/v2/Roles/role-1")
            .with_status(400)
            .expect_at_least(1)
            .create_async()
            .await;

        let outcome = poll_role_assignment(
            &client_for(&server.url()),
            &org_token(),
            "role-1",
            "user-1",
            fast_elapsed(80),
        )
        .await;

        assert_eq!(
            outcome,
            StepOutcome::RetryableFailure("Role assignment timed out".to_string())
        );
    }

    #[tokio::test]
    async fn test_role_assignment_empty_body_is_synthesised() {
        let mut server = Server::new_async().await;
        server
            .mock("PATCH", "/o/org-1/scim2/v2/Roles/role-1")
            .with_status(201)
            .create_async()
            .await;

        let outcome = poll_role_assignment(
            &client_for(&server.url()),
            &org_token(),
            "role-1",
            "user-1",
            fast_elapsed(1_000),
        )
        .await;

        match outcome {
            StepOutcome::Success(assignment) => assert_eq!(assignment.raw, json!({"id": "role-1"})),
            other => panic!("Expected assignment, got {:?}", other),
        }
    }
}
