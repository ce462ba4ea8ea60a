//! Container Manager (spec §4.4): the shell-out runtime plus the
//! state-machine wrapper that drives a single container from creation
//! through teardown.

pub mod manager;
pub mod runtime;

pub use manager::{ContainerHandle, ContainerManager, ContainerStatus, SESSION_LABEL};
pub use runtime::{
    Container, ContainerConfig, ContainerError, ContainerResult, ContainerRuntime,
    ContainerRuntimeApi, PortMapping, RuntimeKind,
};
