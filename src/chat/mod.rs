//! Chat Proxy (spec §4.5): event taxonomy, task-tag dispatch, and the
//! per-session turn concurrency core.

pub mod events;
pub mod proxy;

pub use events::{AgentCommand, ChatEvent, TaskTag, dispatch};
pub use proxy::ChatProxy;
