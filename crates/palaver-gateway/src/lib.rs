pub mod api;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

pub use router::build_router;
pub use server::run;
pub use state::{AppState, SharedState};
