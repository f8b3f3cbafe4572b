//! API module
//!
//! Contains HTTP request handlers for the onboarding endpoints

pub mod config;
pub mod signup;
