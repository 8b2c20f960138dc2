//! Single-writer / multi-reader access discipline.
//!
//! [`AccessRule`] hands out [`AccessToken`] read grants on any thread and
//! runs write actions on the one thread owned by [`WriteThread`].

pub mod config;
pub mod listeners;
pub mod rule;
pub mod write_thread;

pub use config::AccessConfig;
pub use listeners::{ListenerHandle, WriteActionListener};
pub use rule::{AccessRule, AccessStats, AccessToken, ReadProgress};
pub use write_thread::{WriteStats, WriteThread};
