//! Session Registry (spec §4.1): record shape, persistence, and the
//! in-memory authority that coordinates the Port Allocator, Workspace
//! Provisioner, and Container Manager.

pub mod models;
pub mod registry;
pub mod repository;

pub use models::{CloseReason, SessionRecord, SessionSpec, SessionStatus};
pub use registry::SessionRegistry;
pub use repository::SessionRepository;
