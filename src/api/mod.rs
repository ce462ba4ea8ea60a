//! HTTP edge (spec §6): the router, shared state, and route handlers.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
