//! Single-shot onboarding stages
//!
//! Each stage sends exactly one request and maps the response onto a
//! [`StepOutcome`]. None of them retries: a negative answer from these
//! endpoints is a business outcome or a misconfiguration, not provisioning
//! lag. Transport errors surface as `FailureKind::Unavailable`.

use crate::onboarding::constants::{
    APPLICATIONS_PATH, CHECK_NAME_PATH, ORGANIZATIONS_PATH, SCIM_ROLES_PATH, TOKEN_PATH,
};
use crate::onboarding::platform::PlatformClient;
use crate::onboarding::types::{AccessTokenContext, Fault, OrgRecord, RoleRecord, StepOutcome};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

fn parse_access_token(body: &Value, operation: &str) -> Result<String, Fault> {
    let parsed: TokenResponse = serde_json::from_value(body.clone()).map_err(|e| {
        Fault::internal(format!("Malformed {} response: {}", operation, e))
    })?;
    parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Fault::internal(format!("{} response contains no access_token", operation)))
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Obtain a service token with the client-credentials grant
///
/// Credentials failures are never transient, so there is no retry.
pub async fn acquire_token(client: &PlatformClient) -> StepOutcome<AccessTokenContext> {
    acquire_token_inner(client).await.into()
}

async fn acquire_token_inner(client: &PlatformClient) -> Result<AccessTokenContext, Fault> {
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", client.client_id()),
        ("client_secret", client.client_secret()),
        ("scope", client.scopes()),
    ];
    let request = client.http().post(client.root_url(TOKEN_PATH)).form(&form);
    let response = client.send(request, "token acquisition").await?;

    if !response.is_success() {
        tracing::error!(
            status_code = response.status,
            "Client credentials grant rejected"
        );
        return Err(response.into_fault("Failed to obtain access token"));
    }

    let token = parse_access_token(&response.body, "Token")?;
    Ok(AccessTokenContext::service(token))
}

/// Check that an organization name is available
///
/// A 200 whose body explicitly says `"available": false` is reported as a
/// conflict; any other non-2xx is passed through.
pub async fn validate_org_name(
    client: &PlatformClient,
    token: &AccessTokenContext,
    name: &str,
) -> StepOutcome<()> {
    validate_org_name_inner(client, token, name).await.into()
}

async fn validate_org_name_inner(
    client: &PlatformClient,
    token: &AccessTokenContext,
    name: &str,
) -> Result<(), Fault> {
    client.require_service(token)?;
    let request = client
        .http()
        .post(client.root_url(CHECK_NAME_PATH))
        .bearer_auth(token.bearer())
        .json(&json!({ "name": name }));
    let response = client.send(request, "organization name check").await?;

    if !response.is_success() {
        return Err(response.into_fault("Organization name validation failed"));
    }

    if response.body.get("available").and_then(Value::as_bool) == Some(false) {
        return Err(Fault::conflict(
            format!("Organization name '{}' is already taken", name),
            Some(response.body),
        ));
    }

    Ok(())
}

/// Create the organization
///
/// Not idempotent: the orchestrator calls this at most once per run. Only
/// `201 Created` counts as success; every other status is passed through.
pub async fn create_org(
    client: &PlatformClient,
    token: &AccessTokenContext,
    name: &str,
) -> StepOutcome<OrgRecord> {
    create_org_inner(client, token, name).await.into()
}

async fn create_org_inner(
    client: &PlatformClient,
    token: &AccessTokenContext,
    name: &str,
) -> Result<OrgRecord, Fault> {
    client.require_service(token)?;
    let request = client
        .http()
        .post(client.root_url(ORGANIZATIONS_PATH))
        .bearer_auth(token.bearer())
        .json(&json!({ "name": name }));
    let response = client.send(request, "organization creation").await?;

    if response.status != 201 {
        return Err(response.into_fault("Organization creation failed"));
    }

    let id = string_field(&response.body, "id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Fault::internal("Organization creation response contains no id"))?;
    let name = string_field(&response.body, "name").unwrap_or_else(|| name.to_string());

    Ok(OrgRecord {
        id,
        name,
        raw: response.body,
    })
}

/// Exchange the service token for one scoped to the new organization
pub async fn switch_org(
    client: &PlatformClient,
    token: &AccessTokenContext,
    org_id: &str,
) -> StepOutcome<AccessTokenContext> {
    switch_org_inner(client, token, org_id).await.into()
}

async fn switch_org_inner(
    client: &PlatformClient,
    token: &AccessTokenContext,
    org_id: &str,
) -> Result<AccessTokenContext, Fault> {
    client.require_service(token)?;
    let form = [
        ("grant_type", "organization_switch"),
        ("token", token.bearer()),
        ("switching_organization", org_id),
        ("scope", client.scopes()),
    ];
    let request = client
        .http()
        .post(client.root_url(TOKEN_PATH))
        .basic_auth(client.client_id(), Some(client.client_secret()))
        .form(&form);
    let response = client.send(request, "organization switch").await?;

    if response.status != 200 {
        return Err(response.into_fault("Failed to switch to the new organization"));
    }

    let org_token = parse_access_token(&response.body, "Organization switch")?;
    Ok(AccessTokenContext::organization(org_token, org_id))
}

/// Resolve the application id for a display name
///
/// Only entries whose name matches exactly are considered. None is a 404,
/// more than one is a 409.
pub async fn lookup_application(
    client: &PlatformClient,
    token: &AccessTokenContext,
    app_name: &str,
) -> StepOutcome<String> {
    lookup_application_inner(client, token, app_name).await.into()
}

async fn lookup_application_inner(
    client: &PlatformClient,
    token: &AccessTokenContext,
    app_name: &str,
) -> Result<String, Fault> {
    let url = client.org_url(token, APPLICATIONS_PATH)?;
    let filter = format!("name eq {}", app_name);
    let request = client
        .http()
        .get(url)
        .bearer_auth(token.bearer())
        .query(&[("filter", filter.as_str())]);
    let response = client.send(request, "application lookup").await?;

    if response.status != 200 {
        return Err(response.into_fault("Application lookup failed"));
    }

    let matches: Vec<&Value> = response
        .body
        .get("applications")
        .and_then(Value::as_array)
        .map(|apps| {
            apps.iter()
                .filter(|app| app.get("name").and_then(Value::as_str) == Some(app_name))
                .collect()
        })
        .unwrap_or_default();

    match matches.as_slice() {
        [] => Err(Fault::not_found(format!("Application '{}' not found", app_name))),
        [app] => string_field(app, "id")
            .ok_or_else(|| Fault::internal("Application entry contains no id")),
        many => Err(Fault::conflict(
            format!(
                "Application name '{}' is ambiguous ({} matches)",
                app_name,
                many.len()
            ),
            None,
        )),
    }
}

/// Resolve the role id for a display name within an application audience
pub async fn lookup_role(
    client: &PlatformClient,
    token: &AccessTokenContext,
    role_name: &str,
    audience: &str,
) -> StepOutcome<RoleRecord> {
    lookup_role_inner(client, token, role_name, audience).await.into()
}

async fn lookup_role_inner(
    client: &PlatformClient,
    token: &AccessTokenContext,
    role_name: &str,
    audience: &str,
) -> Result<RoleRecord, Fault> {
    let url = client.org_url(token, SCIM_ROLES_PATH)?;
    let filter = format!(
        "displayName eq {} and audience.value eq {}",
        role_name, audience
    );
    let request = client
        .http()
        .get(url)
        .bearer_auth(token.bearer())
        .query(&[("filter", filter.as_str())]);
    let response = client.send(request, "role lookup").await?;

    if response.status != 200 {
        return Err(response.into_fault("Role lookup failed"));
    }

    let first = response
        .body
        .get("Resources")
        .and_then(Value::as_array)
        .and_then(|resources| resources.first())
        .ok_or_else(|| Fault::not_found("Admin role not found"))?;

    let id = string_field(first, "id").ok_or_else(|| Fault::internal("Role entry contains no id"))?;
    Ok(RoleRecord {
        id,
        display_name: string_field(first, "displayName").unwrap_or_else(|| role_name.to_string()),
        audience: first
            .pointer("/audience/value")
            .and_then(Value::as_str)
            .unwrap_or(audience)
            .to_string(),
    })
}

/// Delete an organization created earlier in the run
///
/// Used only as a compensating action after a later stage failed.
pub async fn delete_org(
    client: &PlatformClient,
    token: &AccessTokenContext,
    org_id: &str,
) -> StepOutcome<()> {
    delete_org_inner(client, token, org_id).await.into()
}

async fn delete_org_inner(
    client: &PlatformClient,
    token: &AccessTokenContext,
    org_id: &str,
) -> Result<(), Fault> {
    client.require_service(token)?;
    let url = client.root_url(&format!("{}/{}", ORGANIZATIONS_PATH, org_id));
    let request = client.http().delete(url).bearer_auth(token.bearer());
    let response = client.send(request, "organization deletion").await?;

    if !response.is_success() {
        return Err(response.into_fault("Organization deletion failed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::onboarding::types::{FailureKind, TokenScope};
    use mockito::{Matcher, Server};

    fn client_for(base_url: &str) -> PlatformClient {
        let config = PlatformConfig {
            base_url: base_url.to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec!["internal_organization_create".to_string()],
            admin_role_name: "Administrator".to_string(),
            application_name: None,
            request_timeout_secs: 5,
        };
        PlatformClient::new(reqwest::Client::new(), &config)
    }

    fn fatal<T: std::fmt::Debug>(outcome: StepOutcome<T>) -> Fault {
        match outcome {
            StepOutcome::FatalFailure(fault) => fault,
            other => panic!("Expected fatal failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acquire_token_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                Matcher::UrlEncoded("client_id".into(), "client".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token": "svc-token", "expires_in": 3600}"#)
            .create_async()
            .await;

        let outcome = acquire_token(&client_for(&server.url())).await;

        mock.assert_async().await;
        match outcome {
            StepOutcome::Success(token) => {
                assert_eq!(token.bearer(), "svc-token");
                assert_eq!(token.scope(), &TokenScope::Service);
            }
            other => panic!("Expected token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acquire_token_rejected_credentials() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .with_status(401)
            .with_body(r#"{"error": "invalid_client", "error_description": "Client credentials are invalid."}"#)
            .expect(1)
            .create_async()
            .await;

        let fault = fatal(acquire_token(&client_for(&server.url())).await);

        mock.assert_async().await;
        assert_eq!(fault.status, 401);
        assert_eq!(fault.message, "Client credentials are invalid.");
        assert!(fault.details.is_some());
    }

    #[tokio::test]
    async fn test_acquire_token_unreachable_platform() {
        // Nothing listens on port 9 locally
        let fault = fatal(acquire_token(&client_for("http://127.0.0.1:9")).await);
        assert_eq!(fault.kind, FailureKind::Unavailable);
        assert_eq!(fault.status, 500);
    }

    #[tokio::test]
    async fn test_validate_org_name_unavailable_is_conflict() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/server/v1/organizations/check-name")
            .match_header("authorization", "Bearer svc")
            .match_body(Matcher::Json(json!({"name": "acme"})))
            .with_status(200)
            .with_body(r#"{"available": false}"#)
            .create_async()
            .await;

        let token = AccessTokenContext::service("svc");
        let fault = fatal(validate_org_name(&client_for(&server.url()), &token, "acme").await);

        mock.assert_async().await;
        assert_eq!(fault.kind, FailureKind::Conflict);
        assert_eq!(fault.status, 409);
    }

    #[tokio::test]
    async fn test_validate_org_name_passes_status_through() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/server/v1/organizations/check-name")
            .with_status(400)
            .with_body(r#"{"code": "ORG-60001", "message": "Invalid organization name"}"#)
            .create_async()
            .await;

        let token = AccessTokenContext::service("svc");
        let fault = fatal(validate_org_name(&client_for(&server.url()), &token, "a/b").await);
        assert_eq!(fault.status, 400);
        assert_eq!(fault.message, "Invalid organization name");
    }

    #[tokio::test]
    async fn test_create_org_requires_created_status() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/server/v1/organizations")
            .with_status(200)
            .with_body(r#"{"id": "org-1", "name": "acme"}"#)
            .create_async()
            .await;

        let token = AccessTokenContext::service("svc");
        let fault = fatal(create_org(&client_for(&server.url()), &token, "acme").await);
        assert_eq!(fault.status, 200);
        assert_eq!(fault.details, Some(json!({"id": "org-1", "name": "acme"})));
    }

    #[tokio::test]
    async fn test_create_org_success() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/server/v1/organizations")
            .with_status(201)
            .with_body(r#"{"id": "org-1", "name": "acme", "status": "ACTIVE"}"#)
            .create_async()
            .await;

        let token = AccessTokenContext::service("svc");
        match create_org(&client_for(&server.url()), &token, "acme").await {
            StepOutcome::Success(org) => {
                assert_eq!(org.id, "org-1");
                assert_eq!(org.raw["status"], "ACTIVE");
            }
            other => panic!("Expected org, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_switch_org_uses_basic_auth_and_org_id() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "organization_switch".into()),
                Matcher::UrlEncoded("switching_organization".into(), "org-1".into()),
                Matcher::UrlEncoded("token".into(), "svc".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token": "org-token"}"#)
            .expect(1)
            .create_async()
            .await;

        let token = AccessTokenContext::service("svc");
        let outcome = switch_org(&client_for(&server.url()), &token, "org-1").await;

        mock.assert_async().await;
        match outcome {
            StepOutcome::Success(org_token) => {
                assert_eq!(org_token.bearer(), "org-token");
                assert_eq!(org_token.org_id(), Some("org-1"));
            }
            other => panic!("Expected org token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_application_none_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/o/org-1/api/server/v1/applications")
            .match_query(Matcher::UrlEncoded("filter".into(), "name eq Teamspace".into()))
            .with_status(200)
            .with_body(r#"{"totalResults": 0, "applications": []}"#)
            .create_async()
            .await;

        let token = AccessTokenContext::organization("org-token", "org-1");
        let fault = fatal(lookup_application(&client_for(&server.url()), &token, "Teamspace").await);
        assert_eq!(fault.status, 404);
        assert!(fault.message.contains("Teamspace"));
    }

    #[tokio::test]
    async fn test_lookup_application_exact_match_only() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/o/org-1/api/server/v1/applications")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"applications": [
                    {"id": "app-2", "name": "Teamspace Legacy"},
                    {"id": "app-1", "name": "Teamspace"}
                ]}"#,
            )
            .create_async()
            .await;

        let token = AccessTokenContext::organization("org-token", "org-1");
        let outcome = lookup_application(&client_for(&server.url()), &token, "Teamspace").await;
        assert_eq!(outcome, StepOutcome::Success("app-1".to_string()));
    }

    #[tokio::test]
    async fn test_lookup_application_ambiguous() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/o/org-1/api/server/v1/applications")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"applications": [
                    {"id": "app-1", "name": "Teamspace"},
                    {"id": "app-3", "name": "Teamspace"}
                ]}"#,
            )
            .create_async()
            .await;

        let token = AccessTokenContext::organization("org-token", "org-1");
        let fault = fatal(lookup_application(&client_for(&server.url()), &token, "Teamspace").await);
        assert_eq!(fault.kind, FailureKind::Conflict);
    }

    #[tokio::test]
    async fn test_lookup_application_rejects_service_token() {
        let token = AccessTokenContext::service("svc");
        let fault = fatal(
            lookup_application(&client_for("http://127.0.0.1:9"), &token, "Teamspace").await,
        );
        assert_eq!(fault.kind, FailureKind::Internal);
    }

    #[tokio::test]
    async fn test_lookup_role_filters_by_audience() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/o/org-1/scim2/v2/Roles")
            .match_query(Matcher::UrlEncoded(
                "filter".into(),
                "displayName eq Administrator and audience.value eq app-1".into(),
            ))
            .with_status(200)
            .with_body(
                r#"{"totalResults": 1, "Resources": [
                    {"id": "role-1", "displayName": "Administrator",
                     "audience": {"value": "app-1", "type": "application"}}
                ]}"#,
            )
            .create_async()
            .await;

        let token = AccessTokenContext::organization("org-token", "org-1");
        let outcome =
            lookup_role(&client_for(&server.url()), &token, "Administrator", "app-1").await;

        mock.assert_async().await;
        assert_eq!(
            outcome,
            StepOutcome::Success(RoleRecord {
                id: "role-1".to_string(),
                display_name: "Administrator".to_string(),
                audience: "app-1".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_lookup_role_empty_resources() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/o/org-1/scim2/v2/Roles")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"totalResults": 0}"#)
            .create_async()
            .await;

        let token = AccessTokenContext::organization("org-token", "org-1");
        let fault =
            fatal(lookup_role(&client_for(&server.url()), &token, "Administrator", "app-1").await);
        assert_eq!(fault.status, 404);
        assert_eq!(fault.message, "Admin role not found");
    }

    #[tokio::test]
    async fn test_delete_org() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", "/api/server/v1/organizations/org-1")
            .match_header("authorization", "Bearer svc")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let token = AccessTokenContext::service("svc");
        let outcome = delete_org(&client_for(&server.url()), &token, "org-1").await;

        mock.assert_async().await;
        assert_eq!(outcome, StepOutcome::Success(()));
    }
}
