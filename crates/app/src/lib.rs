//! Explicit application context for the Tether substrate.
//!
//! An [`Application`] replaces process-wide singletons: it is created with
//! [`Application::start`], passed to whoever needs it, and torn down with
//! [`Application::shutdown`].

pub mod application;
pub mod config;

pub use application::{Application, ShutdownReport};
pub use config::AppConfig;
