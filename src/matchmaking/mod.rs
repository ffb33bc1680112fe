//! Duel queue, session registry and per-match rosters

pub mod queue;
pub mod roster;
pub mod service;

pub use roster::MatchRoster;
pub use service::MatchmakingService;
