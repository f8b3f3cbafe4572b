//! Onboarding module
//!
//! Drives the fixed sequence of identity platform calls that turns a signup
//! request into an organization with an administrator. Single-shot stages
//! live in [`steps`], bounded retry loops in [`pollers`], and
//! [`orchestrator`] chains them together.

pub mod constants;
pub mod orchestrator;
pub mod platform;
pub mod pollers;
pub mod steps;
pub mod types;

pub use orchestrator::{
    OnboardingOrchestrator, OnboardingOutcome, OnboardingResult, Stage, StageFailure,
};
pub use types::{OnboardingRequest, SignupPayload, StepOutcome};
