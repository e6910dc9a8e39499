//! Process-level plumbing for long-running hosts.

pub mod instance;
pub mod shutdown;
