//! Match-flow core: commit collection, exchange resolution, phase machine

pub mod commit;
pub mod r#match;
pub mod round;

pub use r#match::{GameMatch, MatchControl, MatchHandle, MatchRegistry, PlayerRuntimeState};

use crate::ws::protocol::ClientMsg;
use uuid::Uuid;

/// Player input received from WebSocket
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub user_id: Uuid,
    pub msg: ClientMsg,
    pub received_at: u64,
}

/// Collaborator signal: the currently connected participant identifiers.
/// Queried fresh at every completion check; the population may change
/// mid-match.
pub trait PopulationProvider: Send + Sync {
    fn connected_ids(&self) -> Vec<Uuid>;
}

/// Collaborator signal: whether the surrounding match-start condition
/// holds (all matched players seated).
pub trait ReadinessProvider: Send + Sync {
    fn match_ready(&self) -> bool;
}
