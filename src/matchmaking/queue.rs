//! Matchmaking queue implementation

use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use uuid::Uuid;

/// Player in the matchmaking queue
#[derive(Debug, Clone)]
pub struct QueuedPlayer {
    pub user_id: Uuid,
    pub display_name: String,
    pub queued_at: Instant,
}

impl QueuedPlayer {
    pub fn new(user_id: Uuid, display_name: String) -> Self {
        Self {
            user_id,
            display_name,
            queued_at: Instant::now(),
        }
    }
}

/// The matchmaking queue
pub struct MatchmakingQueue {
    queue: VecDeque<QueuedPlayer>,
    /// Minimum players to start a match
    min_players: usize,
    /// Maximum players per match
    max_players: usize,
}

impl MatchmakingQueue {
    pub fn new(min_players: usize, max_players: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            min_players,
            max_players,
        }
    }

    /// Add a player to the queue
    pub fn enqueue(&mut self, player: QueuedPlayer) {
        // Remove if already in queue (rejoin)
        self.queue.retain(|p| p.user_id != player.user_id);
        self.queue.push_back(player);
    }

    /// Remove a player from the queue
    pub fn dequeue(&mut self, user_id: Uuid) -> Option<QueuedPlayer> {
        if let Some(pos) = self.queue.iter().position(|p| p.user_id == user_id) {
            self.queue.remove(pos)
        } else {
            None
        }
    }

    /// Check if a player is in the queue
    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.queue.iter().any(|p| &p.user_id == user_id)
    }

    /// Get queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Try to form a match from still-connected queued players, oldest
    /// first. Returns None until enough connected players are waiting.
    pub fn try_form_match(&mut self, connected: &HashSet<Uuid>) -> Option<Vec<QueuedPlayer>> {
        let connected_count = self
            .queue
            .iter()
            .filter(|p| connected.contains(&p.user_id))
            .count();
        if connected_count < self.min_players {
            return None;
        }

        let mut players = Vec::with_capacity(self.max_players);
        let mut remaining = VecDeque::with_capacity(self.queue.len());
        for player in self.queue.drain(..) {
            if players.len() < self.max_players && connected.contains(&player.user_id) {
                players.push(player);
            } else {
                remaining.push_back(player);
            }
        }
        self.queue = remaining;

        Some(players)
    }
}
