pub mod app;
pub mod error;
pub mod routes;
pub mod state;

pub use app::{router, serve};
pub use state::{AppState, ServerMode};
