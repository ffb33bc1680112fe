//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Match phases, traversed in order by the authoritative coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Waiting for the match-start condition
    Waiting,
    /// Attackers commit direction + power
    Attack,
    /// Defenders commit a block direction
    Defend,
    /// Commits revealed and scored
    Resolve,
    /// Between rounds (and between sets)
    Transition,
    /// Terminal
    MatchOver,
}

/// Slap directions available to attackers and defenders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlapDirection {
    Left,
    Up,
    Right,
}

impl Default for SlapDirection {
    fn default() -> Self {
        Self::Left
    }
}

/// Outcome of a single resolved exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlapOutcome {
    Hit,
    Blocked,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Join the match this connection was assigned to
    JoinMatch {
        /// Cosmetic name shown on the HUD
        display_name: Option<String>,
    },

    /// Sealed attack intent for the current Attack window
    SubmitAttack {
        direction: SlapDirection,
        /// Committed power, clamped server-side to [0, 999]
        power: i32,
        /// Declared defender; None in 1v1 duel mode
        target: Option<Uuid>,
    },

    /// Sealed defense intent for the current Defend window
    SubmitDefense { direction: SlapDirection },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave current match
    LeaveMatch,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome { user_id: Uuid, server_time: u64 },

    /// Confirmation of match join
    MatchJoined {
        match_id: Uuid,
        /// All players in the match at join time
        players: Vec<PlayerInfo>,
    },

    /// Player joined the match
    PlayerJoined { player: PlayerInfo },

    /// Player left the match
    PlayerLeft { user_id: Uuid, reason: String },

    /// Phase transition (raised on every phase write, including the seed)
    PhaseChanged {
        previous: MatchPhase,
        current: MatchPhase,
    },

    /// Who attacks whom this round, grouped by declared defender.
    /// Sent once per round, before Defend.
    AttackAssignments { assignments: Vec<AssignmentEntry> },

    /// Per-player resource/score snapshot for the HUD
    HudSnapshot { players: Vec<PlayerHud> },

    /// All exchanges resolved this round
    RoundSummary { events: Vec<RoundEvent> },

    /// A set concluded (possibly in a tie awaiting tiebreak)
    SetEnded { summary: SetSummary },

    /// Match has ended
    MatchEnd { winner_user_id: Option<Uuid> },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// Player info for lobby/join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub user_id: Uuid,
    pub display_name: String,
}

/// One defender and everyone who declared an attack on them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentEntry {
    pub defender: Uuid,
    pub attackers: Vec<Uuid>,
}

/// Per-player HUD state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerHud {
    pub user_id: Uuid,
    pub display_name: String,
    /// Power remaining this set
    pub power_left: i32,
    /// Attacks remaining this set
    pub slaps_left: i32,
    /// Cumulative score within the current set (0.5 increments)
    pub advantage: f32,
    /// Sets won so far this match
    pub set_wins: u32,
}

/// One attacker's committed attack resolved against one defender's block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundEvent {
    pub attacker: Uuid,
    pub defender: Uuid,
    pub attack_dir: SlapDirection,
    pub defense_dir: SlapDirection,
    /// Power actually spent (bounded by the attacker's remaining power)
    pub power_spent: i32,
    pub outcome: SlapOutcome,
    /// +spend on a hit, 0 when blocked
    pub attacker_delta: f32,
    /// +0.5*spend when blocked, 0 on a hit
    pub defender_delta: f32,
}

/// Result of one set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetSummary {
    /// 1-based
    pub set_index: u32,
    /// true => match holds for an external tiebreak
    pub is_tie: bool,
    pub winner: Option<Uuid>,
    /// true if this set clinched the match
    pub match_over: bool,
    pub match_winner: Option<Uuid>,
}
