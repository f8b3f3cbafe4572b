//! Operator utility that runs one onboarding from the command line
//! This is a utility binary, not part of the main application
//!
//! Usage: onboard_tenant <first-name> <last-name> <email> <password> <organization> <application>
//!
//! Reads the platform configuration from the same environment variables as
//! the server and prints the outcome as JSON.

use serde_json::json;
use std::env;
use std::process::ExitCode;
use tenant_onboarding_backend::config::Config;
use tenant_onboarding_backend::onboarding::{
    OnboardingOutcome, OnboardingRequest, SignupPayload,
};
use tenant_onboarding_backend::state::AppState;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() != 6 {
        eprintln!(
            "Usage: onboard_tenant <first-name> <last-name> <email> <password> <organization> <application>"
        );
        return Ok(ExitCode::from(2));
    }

    let mut fields = args.into_iter().map(Some);
    let payload = SignupPayload {
        first_name: fields.next().flatten(),
        last_name: fields.next().flatten(),
        email: fields.next().flatten(),
        password: fields.next().flatten(),
        organization_name: fields.next().flatten(),
        application_name: fields.next().flatten(),
    };

    let request = OnboardingRequest::try_from(payload)?;
    let config = Config::from_env()?;
    let state = AppState::new(config.onboarding)?;

    eprintln!("Onboarding '{}'...", request.organization_name);

    match state.orchestrator().run(&request).await {
        OnboardingOutcome::Done(result) => {
            let output = json!({
                "success": true,
                "organization": result.organization.raw,
                "user": result.user.raw,
                "roleAssignment": result.role_assignment.raw,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        OnboardingOutcome::Failed(failure) => {
            let output = json!({
                "success": false,
                "stage": failure.stage,
                "status": failure.status,
                "error": failure.error,
                "message": failure.message,
                "details": failure.details,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            eprintln!("✗ {}", failure);
            Ok(ExitCode::FAILURE)
        }
    }
}
