//! Session lifecycle orchestration and storage for the support tunnel.
//!
//! Provides:
//! - `SessionManager` - Open, join, close and reap sessions
//! - Storage implementations (memory, sqlite)

pub mod manager;
pub mod storage;

pub use manager::{ManagerError, SessionManager};
