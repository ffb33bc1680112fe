//! HTTP surface: health, WebSocket upgrade, tiebreak reporting

pub mod routes;

pub use routes::build_router;
