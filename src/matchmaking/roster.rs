//! Per-match roster - the live population and readiness source

use dashmap::DashMap;
use uuid::Uuid;

use crate::game::{PopulationProvider, ReadinessProvider};

/// Shared between the session layer and one match task. The session layer
/// seats players on match creation and unseats them on disconnect; the
/// match task reads it through the provider traits, so completion
/// thresholds always reflect the live population.
pub struct MatchRoster {
    players: DashMap<Uuid, String>,
    min_players: usize,
}

impl MatchRoster {
    pub fn new(min_players: usize) -> Self {
        Self {
            players: DashMap::new(),
            min_players,
        }
    }

    pub fn seat(&self, user_id: Uuid, display_name: String) {
        self.players.insert(user_id, display_name);
    }

    pub fn unseat(&self, user_id: Uuid) -> bool {
        self.players.remove(&user_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

impl PopulationProvider for MatchRoster {
    fn connected_ids(&self) -> Vec<Uuid> {
        self.players.iter().map(|entry| *entry.key()).collect()
    }
}

impl ReadinessProvider for MatchRoster {
    fn match_ready(&self) -> bool {
        self.players.len() >= self.min_players
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_tracks_seated_count() {
        let roster = MatchRoster::new(2);
        assert!(roster.is_empty());
        assert!(!roster.match_ready());

        let a = Uuid::new_v4();
        roster.seat(a, "A".to_string());
        assert!(!roster.match_ready());

        roster.seat(Uuid::new_v4(), "B".to_string());
        assert!(roster.match_ready());

        roster.unseat(a);
        assert!(!roster.match_ready());
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.connected_ids().len(), 1);
    }
}
