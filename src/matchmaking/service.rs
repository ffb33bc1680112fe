//! Matchmaking service - manages the duel queue and match creation

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MatchRules;
use crate::game::{GameMatch, MatchControl, MatchRegistry, PlayerInput};
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

use super::queue::{MatchmakingQueue, QueuedPlayer};
use super::roster::MatchRoster;

/// Player connection handle for routing messages
#[derive(Clone)]
pub struct PlayerConnection {
    pub user_id: Uuid,
    /// Channel to send inputs to the current match
    pub input_tx: mpsc::Sender<PlayerInput>,
    /// Channel to receive events from the current match
    pub events_tx: broadcast::Sender<ServerMsg>,
}

/// Matchmaking service
pub struct MatchmakingService {
    queue: Mutex<MatchmakingQueue>,
    registry: Arc<MatchRegistry>,
    rules: MatchRules,
    /// Connected players awaiting or in matches
    players: Arc<DashMap<Uuid, PlayerConnection>>,
    /// Map of player -> current match
    player_matches: Arc<DashMap<Uuid, Uuid>>,
    /// Live rosters per match (population/readiness source)
    rosters: Arc<DashMap<Uuid, Arc<MatchRoster>>>,
}

impl MatchmakingService {
    pub fn new(registry: Arc<MatchRegistry>, rules: MatchRules) -> Self {
        Self {
            queue: Mutex::new(MatchmakingQueue::new(rules.min_players, rules.max_players)),
            registry,
            rules,
            players: Arc::new(DashMap::new()),
            player_matches: Arc::new(DashMap::new()),
            rosters: Arc::new(DashMap::new()),
        }
    }

    /// Register a player connection (called when WebSocket connects) and
    /// put them in the duel queue. Returns channels for the session.
    pub async fn register_player(
        &self,
        user_id: Uuid,
        display_name: String,
    ) -> (mpsc::Sender<PlayerInput>, broadcast::Receiver<ServerMsg>) {
        // Personal channels for this player
        let (input_tx, mut input_rx) = mpsc::channel::<PlayerInput>(64);
        let (events_tx, events_rx) = broadcast::channel::<ServerMsg>(64);

        let connection = PlayerConnection {
            user_id,
            input_tx: input_tx.clone(),
            events_tx: events_tx.clone(),
        };
        self.players.insert(user_id, connection);

        // Route inputs from the personal channel to the current match
        let registry = self.registry.clone();
        let player_matches = self.player_matches.clone();
        let players_for_input = self.players.clone();

        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                if let Some(match_id) = player_matches.get(&user_id).map(|r| *r) {
                    if let Some(handle) = registry.get(&match_id) {
                        if handle.input_tx.send(input).await.is_err() {
                            warn!(user_id = %user_id, "Failed to send input to match");
                        }
                    }
                }
            }
            // Cleanup when the session closes its sender
            players_for_input.remove(&user_id);
        });

        // Route match events to the personal channel
        let registry = self.registry.clone();
        let player_matches = self.player_matches.clone();
        let players_for_events = self.players.clone();

        tokio::spawn(async move {
            let mut current_match_id: Option<Uuid> = None;
            let mut current_match_rx: Option<broadcast::Receiver<ServerMsg>> = None;

            loop {
                let new_match_id = player_matches.get(&user_id).map(|r| *r);
                if new_match_id != current_match_id {
                    current_match_id = new_match_id;
                    current_match_rx = new_match_id
                        .and_then(|mid| registry.get(&mid).map(|h| h.events_tx.subscribe()));
                }

                if let Some(ref mut rx) = current_match_rx {
                    match rx.recv().await {
                        Ok(msg) => {
                            let _ = events_tx.send(msg);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(user_id = %user_id, lagged = n, "Event receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            current_match_rx = None;
                            current_match_id = None;
                        }
                    }
                } else {
                    // No match yet, wait a bit
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }

                if !players_for_events.contains_key(&user_id) {
                    break;
                }
            }
        });

        // Straight into the duel queue
        {
            let mut queue = self.queue.lock().await;
            queue.enqueue(QueuedPlayer::new(user_id, display_name));
            info!(user_id = %user_id, queue_size = queue.len(), "Player queued for a duel");
        }

        (input_tx, events_rx)
    }

    /// Unregister a player (called when WebSocket disconnects). Unseats
    /// them from their match roster, shrinking the live population.
    pub async fn unregister_player(&self, user_id: Uuid) {
        self.players.remove(&user_id);

        if let Some((_, match_id)) = self.player_matches.remove(&user_id) {
            if let Some(roster) = self.rosters.get(&match_id).map(|r| r.value().clone()) {
                roster.unseat(user_id);
            }
        }

        let mut queue = self.queue.lock().await;
        queue.dequeue(user_id);

        info!(user_id = %user_id, "Player unregistered from matchmaking");
    }

    /// Forward an external tiebreak decision to the match task.
    pub async fn resolve_tiebreak(&self, match_id: Uuid, winner: Uuid) -> Result<(), String> {
        let Some(handle) = self.registry.get(&match_id) else {
            return Err("match not found".to_string());
        };
        handle
            .control_tx
            .send(MatchControl::ResolveTiebreak { winner })
            .await
            .map_err(|_| "match task stopped".to_string())
    }

    /// Create a match with the given players
    async fn create_match(&self, players: Vec<QueuedPlayer>) {
        let match_id = Uuid::new_v4();

        let roster = Arc::new(MatchRoster::new(self.rules.min_players));
        for player in &players {
            roster.seat(player.user_id, player.display_name.clone());
        }
        self.rosters.insert(match_id, roster.clone());

        let (game_match, handle) =
            GameMatch::new(match_id, self.rules, roster.clone(), roster.clone());

        self.registry.insert(handle.clone());
        for player in &players {
            self.player_matches.insert(player.user_id, match_id);
        }

        let longest_wait_secs = players
            .iter()
            .map(|p| p.queued_at.elapsed().as_secs())
            .max()
            .unwrap_or(0);
        info!(
            match_id = %match_id,
            player_count = players.len(),
            longest_wait_secs,
            "Created new match"
        );

        // Spawn match task
        let registry = self.registry.clone();
        let rosters = self.rosters.clone();
        let player_matches = self.player_matches.clone();
        let match_player_ids: Vec<Uuid> = players.iter().map(|p| p.user_id).collect();

        tokio::spawn(async move {
            game_match.run().await;

            registry.remove(&match_id);
            rosters.remove(&match_id);
            for pid in match_player_ids {
                player_matches.remove(&pid);
            }

            info!(match_id = %match_id, "Match removed from registry");
        });

        // Seat the players in the match flow
        for player in players {
            let join_input = PlayerInput {
                user_id: player.user_id,
                msg: ClientMsg::JoinMatch {
                    display_name: Some(player.display_name),
                },
                received_at: unix_millis(),
            };

            if handle.input_tx.send(join_input).await.is_err() {
                warn!(user_id = %player.user_id, "Failed to send join to match");
            }
        }
    }

    /// Run the matchmaking service (periodic queue processing)
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(500));

        loop {
            interval.tick().await;

            // Only still-connected, not-yet-matched players can pair up
            let connected: HashSet<Uuid> = self
                .players
                .iter()
                .map(|entry| *entry.key())
                .filter(|id| !self.player_matches.contains_key(id))
                .collect();

            let players = {
                let mut queue = self.queue.lock().await;
                queue.try_form_match(&connected)
            };

            if let Some(players) = players {
                self.create_match(players).await;
            }
        }
    }

    /// Get current queue size
    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }
}
