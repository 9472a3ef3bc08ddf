#![warn(clippy::unwrap_used)]

pub mod enrollment_rest;
pub mod rest;
pub mod scenario_rest;
pub mod server;

pub use rest::AppState;
pub use server::ApiServer;
