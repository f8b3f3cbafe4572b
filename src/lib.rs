//! Tenant Onboarding Backend Library
//!
//! This library exposes modules for testing and external use.
//! The main binary is in `src/main.rs`.

pub mod api;
pub mod config;
pub mod error;
pub mod onboarding;
/// Application state shared by request handlers
pub mod state;
