//! Match flow state machine and authoritative tick loop

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{MatchRules, PHASE_TIMER_FLOOR};
use crate::util::time::{tick_delta, TICK_DURATION_MICROS};
use crate::ws::protocol::{
    AssignmentEntry, ClientMsg, MatchPhase, PlayerHud, PlayerInfo, RoundEvent, ServerMsg,
    SetSummary, SlapDirection,
};

use super::commit::{CommitBuffer, SubmitOutcome};
use super::round::resolve_exchange;
use super::{PlayerInput, PopulationProvider, ReadinessProvider};

/// Per-player match state (authoritative, owned by the match task)
#[derive(Debug, Clone)]
pub struct PlayerRuntimeState {
    pub user_id: Uuid,
    pub display_name: String,
    /// Power remaining this set, consumed by committing attacks
    pub power_left: i32,
    /// Attacks remaining this set
    pub slaps_left: i32,
    /// Cumulative score within the current set
    pub advantage: f32,
    /// Persists across sets within a match
    pub set_wins: u32,
}

impl PlayerRuntimeState {
    pub fn new(user_id: Uuid, display_name: String, power_left: i32, slaps_left: i32) -> Self {
        Self {
            user_id,
            display_name,
            power_left,
            slaps_left,
            advantage: 0.0,
            set_wins: 0,
        }
    }
}

/// Out-of-band decisions from external collaborators
#[derive(Debug, Clone)]
pub enum MatchControl {
    /// Outcome of the external tiebreak procedure for a tied set
    ResolveTiebreak { winner: Uuid },
}

/// Match state (owned by match task)
pub struct MatchState {
    pub id: Uuid,
    pub phase: MatchPhase,
    pub players: HashMap<Uuid, PlayerRuntimeState>,
    /// Countdown for the current phase, decremented by the tick loop only
    pub timer: f32,
    pub started: bool,
    /// 1-based
    pub set_index: u32,
    pub end_set_pending: bool,
    pub awaiting_tiebreak: bool,
    pub match_over: bool,
    pub match_winner: Option<Uuid>,
}

impl MatchState {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            phase: MatchPhase::Waiting,
            players: HashMap::new(),
            timer: 0.0,
            started: false,
            set_index: 1,
            end_set_pending: false,
            awaiting_tiebreak: false,
            match_over: false,
            match_winner: None,
        }
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<PlayerInput>,
    pub control_tx: mpsc::Sender<MatchControl>,
    pub events_tx: broadcast::Sender<ServerMsg>,
    /// Cached (previous, current) phase for late subscribers
    pub phase_rx: watch::Receiver<(MatchPhase, MatchPhase)>,
    pub player_count: Arc<std::sync::atomic::AtomicUsize>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches.iter().map(|m| m.value().player_count()).sum()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative match-flow coordinator. Owns phase, timers, player
/// state and the commit buffer; every mutation funnels through its tick
/// loop, so timer-driven and completion-driven transitions never race.
pub struct GameMatch {
    state: MatchState,
    rules: MatchRules,
    buffer: CommitBuffer,
    input_rx: mpsc::Receiver<PlayerInput>,
    control_rx: mpsc::Receiver<MatchControl>,
    events_tx: broadcast::Sender<ServerMsg>,
    phase_tx: watch::Sender<(MatchPhase, MatchPhase)>,
    population: Arc<dyn PopulationProvider>,
    readiness: Arc<dyn ReadinessProvider>,
    /// Display names learned from join inputs
    names: HashMap<Uuid, String>,
    /// Scratch for the current round's resolution
    round_events: Vec<RoundEvent>,
    player_count: Arc<std::sync::atomic::AtomicUsize>,
}

impl GameMatch {
    /// Create a new match
    pub fn new(
        id: Uuid,
        rules: MatchRules,
        population: Arc<dyn PopulationProvider>,
        readiness: Arc<dyn ReadinessProvider>,
    ) -> (Self, MatchHandle) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (control_tx, control_rx) = mpsc::channel(16);
        let (events_tx, _) = broadcast::channel(64);
        let (phase_tx, phase_rx) = watch::channel((MatchPhase::Waiting, MatchPhase::Waiting));
        let player_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handle = MatchHandle {
            id,
            input_tx,
            control_tx,
            events_tx: events_tx.clone(),
            phase_rx,
            player_count: player_count.clone(),
        };

        let game_match = Self {
            state: MatchState::new(id),
            rules,
            buffer: CommitBuffer::new(),
            input_rx,
            control_rx,
            events_tx,
            phase_tx,
            population,
            readiness,
            names: HashMap::new(),
            round_events: Vec::new(),
            player_count,
        };

        (game_match, handle)
    }

    /// Run the authoritative tick loop
    pub async fn run(mut self) {
        info!(match_id = %self.state.id, "Match task started");

        let tick_duration = Duration::from_micros(TICK_DURATION_MICROS);
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;

            // Drain pending control decisions and submissions
            self.process_controls();
            self.process_inputs();

            // Advance the phase timer
            self.run_tick();

            let connected = self.population.connected_ids().len();
            self.player_count
                .store(connected, std::sync::atomic::Ordering::Relaxed);

            if self.state.phase == MatchPhase::MatchOver {
                info!(match_id = %self.state.id, "Match over");
                break;
            }

            if self.state.started && connected == 0 {
                info!(match_id = %self.state.id, "All players left, ending match");
                break;
            }
        }

        let _ = self.events_tx.send(ServerMsg::MatchEnd {
            winner_user_id: self.state.match_winner,
        });
    }

    /// Apply queued external control decisions
    fn process_controls(&mut self) {
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                MatchControl::ResolveTiebreak { winner } => self.apply_tiebreak(winner),
            }
        }
    }

    /// Process all pending inputs from players
    fn process_inputs(&mut self) {
        while let Ok(input) = self.input_rx.try_recv() {
            match input.msg {
                ClientMsg::JoinMatch { display_name } => {
                    self.handle_join(input.user_id, display_name);
                }
                ClientMsg::SubmitAttack {
                    direction,
                    power,
                    target,
                } => {
                    self.handle_attack_submit(input.user_id, direction, power, target);
                }
                ClientMsg::SubmitDefense { direction } => {
                    self.handle_defense_submit(input.user_id, direction);
                }
                ClientMsg::Ping { t } => {
                    let _ = self.events_tx.send(ServerMsg::Pong { t });
                }
                ClientMsg::LeaveMatch => {
                    self.handle_leave(input.user_id);
                }
            }
        }
    }

    fn handle_join(&mut self, user_id: Uuid, display_name: Option<String>) {
        let name =
            display_name.unwrap_or_else(|| format!("Player_{}", &user_id.to_string()[..8]));
        self.names.insert(user_id, name.clone());

        let _ = self.events_tx.send(ServerMsg::PlayerJoined {
            player: PlayerInfo {
                user_id,
                display_name: name,
            },
        });

        let _ = self.events_tx.send(ServerMsg::MatchJoined {
            match_id: self.state.id,
            players: self.roster_infos(),
        });

        info!(
            match_id = %self.state.id,
            user_id = %user_id,
            "Player joined match"
        );
    }

    fn handle_leave(&mut self, user_id: Uuid) {
        let _ = self.events_tx.send(ServerMsg::PlayerLeft {
            user_id,
            reason: "disconnected".to_string(),
        });

        info!(
            match_id = %self.state.id,
            user_id = %user_id,
            "Player left match"
        );
    }

    fn handle_attack_submit(
        &mut self,
        sender: Uuid,
        direction: SlapDirection,
        power: i32,
        target: Option<Uuid>,
    ) {
        // Expected count queried fresh; the population may have changed
        let expected = self.population.connected_ids().len();
        let outcome = self
            .buffer
            .submit_attack(sender, direction, power, target, expected);
        if outcome == SubmitOutcome::AllSubmitted {
            self.on_all_attacks_submitted();
        }
    }

    fn handle_defense_submit(&mut self, sender: Uuid, direction: SlapDirection) {
        let expected = self.population.connected_ids().len();
        let outcome = self.buffer.submit_defense(sender, direction, expected);
        if outcome == SubmitOutcome::AllSubmitted {
            self.on_all_defenses_submitted();
        }
    }

    /// Early path out of Attack: everyone committed before the timer
    fn on_all_attacks_submitted(&mut self) {
        if self.state.phase != MatchPhase::Attack {
            return;
        }

        // Broadcast who attacks whom before the defenders choose
        self.publish_attack_assignments();

        self.set_phase(MatchPhase::Defend);
        self.state.timer = self.rules.defend_seconds.max(PHASE_TIMER_FLOOR);
    }

    fn on_all_defenses_submitted(&mut self) {
        if self.state.phase != MatchPhase::Defend {
            return;
        }
        self.enter_resolve();
    }

    /// Collaborator polling + phase countdown, once per tick
    fn run_tick(&mut self) {
        if !self.state.started {
            if self.readiness.match_ready() {
                self.start_match();
            }
            return;
        }

        if self.state.timer <= 0.0 {
            return;
        }

        self.state.timer -= tick_delta();
        if self.state.timer <= 0.0 {
            self.advance_phase();
        }
    }

    /// Waiting -> Attack once the surrounding start condition holds.
    /// Idempotent: ignored when already started.
    fn start_match(&mut self) {
        if self.state.started {
            return;
        }

        let ids = self.population.connected_ids();
        if ids.len() < self.rules.min_players {
            return;
        }
        self.state.started = true;

        self.init_player_states(&ids);
        self.publish_hud_snapshot();

        self.set_phase(MatchPhase::Attack);
        self.state.timer = self.rules.attack_seconds.max(PHASE_TIMER_FLOOR);

        info!(
            match_id = %self.state.id,
            players = ids.len(),
            "Match flow started"
        );
    }

    fn init_player_states(&mut self, ids: &[Uuid]) {
        self.state.players.clear();
        for id in ids {
            let name = self
                .names
                .get(id)
                .cloned()
                .unwrap_or_else(|| format!("Player_{}", &id.to_string()[..8]));
            self.state.players.insert(
                *id,
                PlayerRuntimeState::new(*id, name, self.rules.power_per_set, self.rules.slaps_per_set),
            );
        }
    }

    /// Timer-expiry transitions
    fn advance_phase(&mut self) {
        match self.state.phase {
            MatchPhase::Attack => {
                self.set_phase(MatchPhase::Defend);
                self.state.timer = self.rules.defend_seconds.max(PHASE_TIMER_FLOOR);
            }

            MatchPhase::Defend => {
                self.enter_resolve();
            }

            MatchPhase::Resolve => {
                self.set_phase(MatchPhase::Transition);
                self.state.timer = self.rules.transition_seconds.max(PHASE_TIMER_FLOOR);
            }

            MatchPhase::Transition => {
                if self.state.awaiting_tiebreak {
                    // Hold at the decision point until the external
                    // tiebreak reports a winner
                    self.state.timer = self.rules.transition_seconds.max(PHASE_TIMER_FLOOR);
                } else if self.state.match_over {
                    self.set_phase(MatchPhase::MatchOver);
                    self.state.timer = 0.0;
                } else {
                    if self.state.end_set_pending {
                        self.reset_for_next_set();
                        self.state.end_set_pending = false;
                    }
                    self.set_phase(MatchPhase::Attack);
                    self.state.timer = self.rules.attack_seconds.max(PHASE_TIMER_FLOOR);
                }
            }

            MatchPhase::Waiting | MatchPhase::MatchOver => {}
        }
    }

    /// Resolve entry: reveal commits, score every exchange, evaluate the
    /// set, publish the round's outcome
    fn enter_resolve(&mut self) {
        self.set_phase(MatchPhase::Resolve);
        self.state.timer = self.rules.resolve_seconds.max(PHASE_TIMER_FLOOR);

        self.resolve_duel_round();
        self.evaluate_set_end();
        self.publish_hud_snapshot();
        self.publish_round_summary();
    }

    fn resolve_duel_round(&mut self) {
        self.round_events.clear();

        let attacks = self.buffer.duel_attacks();
        let defenses = self.buffer.defenses();

        let mut ids: Vec<Uuid> = self.state.players.keys().copied().collect();
        if ids.len() != 2 {
            warn!(
                match_id = %self.state.id,
                players = ids.len(),
                "Resolution requires exactly two tracked players, skipping round"
            );
            return;
        }
        // Deterministic resolution order
        ids.sort();
        let (a, b) = (ids[0], ids[1]);

        // Missing commits resolve as a free exchange: default direction,
        // zero power
        let (a_atk_dir, a_power) = attacks.get(&a).copied().unwrap_or_default();
        let (b_atk_dir, b_power) = attacks.get(&b).copied().unwrap_or_default();
        let a_def_dir = defenses.get(&a).copied().unwrap_or_default();
        let b_def_dir = defenses.get(&b).copied().unwrap_or_default();

        if let Some(event) =
            resolve_exchange(a, b, a_atk_dir, b_def_dir, a_power, &mut self.state.players)
        {
            self.round_events.push(event);
        }
        if let Some(event) =
            resolve_exchange(b, a, b_atk_dir, a_def_dir, b_power, &mut self.state.players)
        {
            self.round_events.push(event);
        }
    }

    /// Run once per Resolve: end of set when both players used all slaps,
    /// or early-end when the comeback is mathematically impossible.
    fn evaluate_set_end(&mut self) {
        let mut ids: Vec<Uuid> = self.state.players.keys().copied().collect();
        if ids.len() != 2 {
            return;
        }
        ids.sort();
        let (a, b) = (ids[0], ids[1]);

        let (Some(ps_a), Some(ps_b)) = (
            self.state.players.get(&a).cloned(),
            self.state.players.get(&b).cloned(),
        ) else {
            return;
        };

        let both_out_of_slaps = ps_a.slaps_left <= 0 && ps_b.slaps_left <= 0;
        let early = is_early_end(&ps_a, &ps_b);
        if !both_out_of_slaps && !early {
            return;
        }

        // Decide set winner by advantage; exact tie defers to an external
        // tiebreak
        let winner = if ps_a.advantage > ps_b.advantage {
            Some(a)
        } else if ps_b.advantage > ps_a.advantage {
            Some(b)
        } else {
            None
        };

        match winner {
            Some(winner_id) => {
                if let Some(ps) = self.state.players.get_mut(&winner_id) {
                    ps.set_wins += 1;
                    if ps.set_wins >= self.rules.sets_to_win() {
                        self.state.match_over = true;
                        self.state.match_winner = Some(winner_id);
                    }
                }
            }
            None => {
                self.state.awaiting_tiebreak = true;
            }
        }

        let summary = SetSummary {
            set_index: self.state.set_index,
            is_tie: winner.is_none(),
            winner,
            match_over: self.state.match_over,
            match_winner: self.state.match_winner,
        };

        info!(
            match_id = %self.state.id,
            set_index = summary.set_index,
            is_tie = summary.is_tie,
            early_end = early,
            match_over = summary.match_over,
            "Set ended"
        );

        let _ = self.events_tx.send(ServerMsg::SetEnded { summary });

        self.state.end_set_pending = true;
    }

    /// External tiebreak decision for a tied set
    fn apply_tiebreak(&mut self, winner: Uuid) {
        if !self.state.awaiting_tiebreak {
            debug!(match_id = %self.state.id, "Tiebreak decision with no tie pending, ignoring");
            return;
        }
        let Some(ps) = self.state.players.get_mut(&winner) else {
            warn!(match_id = %self.state.id, user_id = %winner, "Tiebreak winner not tracked, ignoring");
            return;
        };

        ps.set_wins += 1;
        if ps.set_wins >= self.rules.sets_to_win() {
            self.state.match_over = true;
            self.state.match_winner = Some(winner);
        }
        self.state.awaiting_tiebreak = false;

        let summary = SetSummary {
            set_index: self.state.set_index,
            is_tie: false,
            winner: Some(winner),
            match_over: self.state.match_over,
            match_winner: self.state.match_winner,
        };

        info!(
            match_id = %self.state.id,
            set_index = summary.set_index,
            user_id = %winner,
            "Tiebreak resolved"
        );

        let _ = self.events_tx.send(ServerMsg::SetEnded { summary });
        self.publish_hud_snapshot();
    }

    /// Power/slaps/advantage reset; set wins persist
    fn reset_for_next_set(&mut self) {
        for ps in self.state.players.values_mut() {
            ps.power_left = self.rules.power_per_set;
            ps.slaps_left = self.rules.slaps_per_set;
            ps.advantage = 0.0;
        }
        self.publish_hud_snapshot();
        self.state.set_index += 1;
    }

    /// Write the phase, notify the commit buffer, publish the change.
    /// Every phase write goes through here.
    fn set_phase(&mut self, next: MatchPhase) {
        let previous = self.state.phase;
        self.state.phase = next;

        self.buffer.on_phase_entered(next);

        let _ = self.phase_tx.send((previous, next));
        let _ = self.events_tx.send(ServerMsg::PhaseChanged {
            previous,
            current: next,
        });

        debug!(match_id = %self.state.id, ?previous, ?next, "Phase change");
    }

    /// Group this window's targeted attacks by declared defender and
    /// broadcast the grouping (empty in duel mode, harmless)
    fn publish_attack_assignments(&mut self) {
        let mut by_defender: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for commit in self.buffer.targeted_attacks().values() {
            if let Some(target) = commit.target {
                by_defender.entry(target).or_default().push(commit.attacker);
            }
        }

        let mut assignments: Vec<AssignmentEntry> = by_defender
            .into_iter()
            .map(|(defender, mut attackers)| {
                attackers.sort();
                AssignmentEntry {
                    defender,
                    attackers,
                }
            })
            .collect();
        assignments.sort_by_key(|entry| entry.defender);

        let _ = self
            .events_tx
            .send(ServerMsg::AttackAssignments { assignments });
    }

    fn publish_hud_snapshot(&self) {
        let mut players: Vec<PlayerHud> = self
            .state
            .players
            .values()
            .map(|ps| PlayerHud {
                user_id: ps.user_id,
                display_name: ps.display_name.clone(),
                power_left: ps.power_left,
                slaps_left: ps.slaps_left,
                advantage: ps.advantage,
                set_wins: ps.set_wins,
            })
            .collect();
        players.sort_by_key(|p| p.user_id);

        let _ = self.events_tx.send(ServerMsg::HudSnapshot { players });
    }

    fn publish_round_summary(&self) {
        let _ = self.events_tx.send(ServerMsg::RoundSummary {
            events: self.round_events.clone(),
        });
    }

    fn roster_infos(&self) -> Vec<PlayerInfo> {
        let mut infos: Vec<PlayerInfo> = self
            .population
            .connected_ids()
            .into_iter()
            .map(|id| PlayerInfo {
                user_id: id,
                display_name: self
                    .names
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| format!("Player_{}", &id.to_string()[..8])),
            })
            .collect();
        infos.sort_by_key(|p| p.user_id);
        infos
    }
}

/// Upper bound on the advantage a player could still earn: full credit
/// for their own remaining power spent attacking, half credit for every
/// point the opponent could still throw at them and get blocked
fn max_potential_gain(me: &PlayerRuntimeState, opp: &PlayerRuntimeState) -> f32 {
    me.power_left as f32 + 0.5 * opp.power_left as f32
}

/// The trailing player's absolute best cannot close the gap
fn is_early_end(a: &PlayerRuntimeState, b: &PlayerRuntimeState) -> bool {
    let lead = (a.advantage - b.advantage).abs();
    if a.advantage >= b.advantage {
        max_potential_gain(b, a) < lead
    } else {
        max_potential_gain(a, b) < lead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Stand-in for the session layer's roster: a mutable population and
    /// a switchable readiness flag
    struct StubRoster {
        ids: Mutex<Vec<Uuid>>,
        ready: AtomicBool,
    }

    impl StubRoster {
        fn new(ids: Vec<Uuid>) -> Self {
            Self {
                ids: Mutex::new(ids),
                ready: AtomicBool::new(true),
            }
        }

        fn set_ready(&self, ready: bool) {
            self.ready.store(ready, Ordering::SeqCst);
        }
    }

    impl PopulationProvider for StubRoster {
        fn connected_ids(&self) -> Vec<Uuid> {
            self.ids.lock().unwrap().clone()
        }
    }

    impl ReadinessProvider for StubRoster {
        fn match_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    fn sorted_pair() -> (Uuid, Uuid) {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn duel_match(ids: Vec<Uuid>) -> (GameMatch, MatchHandle, Arc<StubRoster>) {
        let roster = Arc::new(StubRoster::new(ids));
        let rules = MatchRules::default().clamped();
        let (game, handle) = GameMatch::new(Uuid::new_v4(), rules, roster.clone(), roster.clone());
        (game, handle, roster)
    }

    fn started_duel() -> (GameMatch, MatchHandle, Uuid, Uuid) {
        let (a, b) = sorted_pair();
        let (mut game, handle, _roster) = duel_match(vec![a, b]);
        game.run_tick();
        assert_eq!(game.state.phase, MatchPhase::Attack);
        (game, handle, a, b)
    }

    fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Tick the countdown until the current phase expires
    fn expire_phase(game: &mut GameMatch) {
        let phase = game.state.phase;
        let mut guard = 0;
        while game.state.phase == phase {
            game.run_tick();
            guard += 1;
            assert!(guard < 100_000, "phase never advanced");
        }
    }

    #[test]
    fn starts_once_ready_and_initializes_players() {
        let (a, b) = sorted_pair();
        let (mut game, _handle, roster) = duel_match(vec![a, b]);

        roster.set_ready(false);
        game.run_tick();
        assert_eq!(game.state.phase, MatchPhase::Waiting);

        roster.set_ready(true);
        game.run_tick();
        assert_eq!(game.state.phase, MatchPhase::Attack);
        assert_eq!(game.state.players.len(), 2);
        assert_eq!(game.state.players[&a].power_left, 100);
        assert_eq!(game.state.players[&a].slaps_left, 3);
        assert_eq!(game.state.players[&a].set_wins, 0);

        // Idempotent: a second ready signal changes nothing
        game.start_match();
        assert_eq!(game.state.phase, MatchPhase::Attack);
    }

    #[test]
    fn phase_watch_seeds_waiting_and_tracks_writes() {
        let (a, b) = sorted_pair();
        let (mut game, handle, _roster) = duel_match(vec![a, b]);

        // Late subscribers read the cached seed value
        assert_eq!(
            *handle.phase_rx.borrow(),
            (MatchPhase::Waiting, MatchPhase::Waiting)
        );

        game.run_tick();
        assert_eq!(
            *handle.phase_rx.borrow(),
            (MatchPhase::Waiting, MatchPhase::Attack)
        );
    }

    #[test]
    fn all_attacks_submitted_advances_early_with_assignments_first() {
        let (mut game, handle, a, b) = started_duel();
        let mut events = handle.events_tx.subscribe();

        game.handle_attack_submit(a, SlapDirection::Left, 50, Some(b));
        assert_eq!(game.state.phase, MatchPhase::Attack);

        game.handle_attack_submit(b, SlapDirection::Up, 30, Some(a));
        assert_eq!(game.state.phase, MatchPhase::Defend);

        let msgs = drain(&mut events);
        let assignment_pos = msgs
            .iter()
            .position(|m| matches!(m, ServerMsg::AttackAssignments { .. }))
            .expect("assignments broadcast");
        let phase_pos = msgs
            .iter()
            .position(|m| {
                matches!(
                    m,
                    ServerMsg::PhaseChanged {
                        current: MatchPhase::Defend,
                        ..
                    }
                )
            })
            .expect("phase change broadcast");
        assert!(assignment_pos < phase_pos, "assignments precede Defend");

        if let ServerMsg::AttackAssignments { assignments } = &msgs[assignment_pos] {
            assert_eq!(assignments.len(), 2);
            assert!(assignments
                .iter()
                .any(|e| e.defender == b && e.attackers == vec![a]));
        }
    }

    #[test]
    fn attack_timer_expiry_advances_without_assignments() {
        let (mut game, handle, _a, _b) = started_duel();
        let mut events = handle.events_tx.subscribe();

        expire_phase(&mut game);
        assert_eq!(game.state.phase, MatchPhase::Defend);

        let msgs = drain(&mut events);
        assert!(
            !msgs
                .iter()
                .any(|m| matches!(m, ServerMsg::AttackAssignments { .. })),
            "timer path does not broadcast assignments"
        );
    }

    #[test]
    fn full_round_resolves_both_exchanges() {
        let (mut game, handle, a, b) = started_duel();
        let mut events = handle.events_tx.subscribe();

        game.handle_attack_submit(a, SlapDirection::Left, 50, None);
        game.handle_attack_submit(b, SlapDirection::Up, 30, None);
        assert_eq!(game.state.phase, MatchPhase::Defend);

        // b blocks a's Left; a defends Left and misses b's Up
        game.handle_defense_submit(b, SlapDirection::Left);
        game.handle_defense_submit(a, SlapDirection::Left);
        assert_eq!(game.state.phase, MatchPhase::Resolve);

        // a: spent 50, blocked -> no delta. b: spent 30, hit -> +30, plus
        // +25 counter-reward for the block.
        assert_eq!(game.state.players[&a].power_left, 50);
        assert_eq!(game.state.players[&a].slaps_left, 2);
        assert_eq!(game.state.players[&a].advantage, 0.0);
        assert_eq!(game.state.players[&b].power_left, 70);
        assert_eq!(game.state.players[&b].advantage, 55.0);

        let msgs = drain(&mut events);
        let summary = msgs
            .iter()
            .find_map(|m| match m {
                ServerMsg::RoundSummary { events } => Some(events.clone()),
                _ => None,
            })
            .expect("round summary broadcast");
        assert_eq!(summary.len(), 2);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMsg::HudSnapshot { .. })));
    }

    #[test]
    fn duplicate_and_late_submissions_are_no_ops() {
        let (mut game, _handle, a, b) = started_duel();

        game.handle_attack_submit(a, SlapDirection::Left, 50, None);
        // Duplicate from the same sender before the window clears
        game.handle_attack_submit(a, SlapDirection::Right, 999, None);
        game.handle_attack_submit(b, SlapDirection::Up, 30, None);

        // A defense submitted during Defend by each player; an extra
        // attack now must not land anywhere
        game.handle_attack_submit(a, SlapDirection::Right, 999, None);
        game.handle_defense_submit(b, SlapDirection::Left);
        game.handle_defense_submit(a, SlapDirection::Left);

        assert_eq!(game.state.phase, MatchPhase::Resolve);
        // First commit stood: a spent 50, not 999
        assert_eq!(game.state.players[&a].power_left, 50);
    }

    #[test]
    fn early_end_triggers_when_comeback_impossible() {
        let (mut game, handle, a, b) = started_duel();
        let mut events = handle.events_tx.subscribe();

        // A leads 10-0; A has no power left, B has 5:
        // max_potential_gain(B) = 5 + 0 = 5 < lead 10
        {
            let ps = game.state.players.get_mut(&a).unwrap();
            ps.advantage = 10.0;
            ps.power_left = 0;
        }
        {
            let ps = game.state.players.get_mut(&b).unwrap();
            ps.advantage = 0.0;
            ps.power_left = 5;
        }

        game.evaluate_set_end();

        assert!(game.state.end_set_pending);
        assert_eq!(game.state.players[&a].set_wins, 1);
        assert_eq!(game.state.players[&b].set_wins, 0);

        let msgs = drain(&mut events);
        let summary = msgs
            .iter()
            .find_map(|m| match m {
                ServerMsg::SetEnded { summary } => Some(summary.clone()),
                _ => None,
            })
            .expect("set summary broadcast");
        assert!(!summary.is_tie);
        assert_eq!(summary.winner, Some(a));
        assert!(!summary.match_over);
    }

    #[test]
    fn no_early_end_while_comeback_possible() {
        let (mut game, _handle, a, b) = started_duel();

        // A leads 10-0 but B could still gain 20 + 10 = 30
        {
            let ps = game.state.players.get_mut(&a).unwrap();
            ps.advantage = 10.0;
            ps.power_left = 20;
        }
        {
            let ps = game.state.players.get_mut(&b).unwrap();
            ps.advantage = 0.0;
            ps.power_left = 20;
        }

        game.evaluate_set_end();

        assert!(!game.state.end_set_pending);
        assert_eq!(game.state.players[&a].set_wins, 0);
    }

    #[test]
    fn set_resources_reset_between_sets_but_wins_persist() {
        let (mut game, _handle, a, b) = started_duel();

        // Burn all slaps with B ahead
        {
            let ps = game.state.players.get_mut(&a).unwrap();
            ps.slaps_left = 0;
            ps.advantage = 5.0;
            ps.power_left = 10;
        }
        {
            let ps = game.state.players.get_mut(&b).unwrap();
            ps.slaps_left = 0;
            ps.advantage = 30.0;
            ps.power_left = 0;
        }

        game.evaluate_set_end();
        assert!(game.state.end_set_pending);
        assert_eq!(game.state.players[&b].set_wins, 1);
        assert_eq!(game.state.set_index, 1);

        // Resolve -> Transition -> Attack runs the set reset
        game.state.phase = MatchPhase::Resolve;
        game.state.timer = 0.5;
        expire_phase(&mut game);
        assert_eq!(game.state.phase, MatchPhase::Transition);
        expire_phase(&mut game);
        assert_eq!(game.state.phase, MatchPhase::Attack);

        assert_eq!(game.state.set_index, 2);
        assert_eq!(game.state.players[&a].power_left, 100);
        assert_eq!(game.state.players[&a].slaps_left, 3);
        assert_eq!(game.state.players[&a].advantage, 0.0);
        assert_eq!(game.state.players[&b].set_wins, 1);
    }

    #[test]
    fn second_set_win_clinches_best_of_three() {
        let (mut game, handle, a, b) = started_duel();
        let mut events = handle.events_tx.subscribe();

        {
            let ps = game.state.players.get_mut(&a).unwrap();
            ps.set_wins = 1;
            ps.slaps_left = 0;
            ps.advantage = 40.0;
        }
        {
            let ps = game.state.players.get_mut(&b).unwrap();
            ps.slaps_left = 0;
            ps.advantage = 10.0;
        }

        game.evaluate_set_end();

        assert!(game.state.match_over);
        assert_eq!(game.state.match_winner, Some(a));

        let msgs = drain(&mut events);
        let summary = msgs
            .iter()
            .find_map(|m| match m {
                ServerMsg::SetEnded { summary } => Some(summary.clone()),
                _ => None,
            })
            .unwrap();
        assert!(summary.match_over);
        assert_eq!(summary.match_winner, Some(a));

        // Transition drains into the terminal phase
        game.state.phase = MatchPhase::Transition;
        game.state.timer = 0.5;
        expire_phase(&mut game);
        assert_eq!(game.state.phase, MatchPhase::MatchOver);
        assert_eq!(game.state.timer, 0.0);
    }

    #[test]
    fn tie_holds_transition_until_external_tiebreak() {
        let (mut game, handle, a, b) = started_duel();

        {
            let ps = game.state.players.get_mut(&a).unwrap();
            ps.slaps_left = 0;
            ps.advantage = 20.0;
        }
        {
            let ps = game.state.players.get_mut(&b).unwrap();
            ps.slaps_left = 0;
            ps.advantage = 20.0;
        }

        game.evaluate_set_end();
        assert!(game.state.awaiting_tiebreak);
        assert_eq!(game.state.players[&a].set_wins, 0);
        assert_eq!(game.state.players[&b].set_wins, 0);

        // Transition keeps re-arming while the tie is unresolved
        game.state.phase = MatchPhase::Transition;
        game.state.timer = 0.5;
        for _ in 0..200 {
            game.run_tick();
        }
        assert_eq!(game.state.phase, MatchPhase::Transition);

        let mut events = handle.events_tx.subscribe();
        game.apply_tiebreak(a);
        assert!(!game.state.awaiting_tiebreak);
        assert_eq!(game.state.players[&a].set_wins, 1);

        let msgs = drain(&mut events);
        let summary = msgs
            .iter()
            .find_map(|m| match m {
                ServerMsg::SetEnded { summary } => Some(summary.clone()),
                _ => None,
            })
            .expect("tiebreak set summary");
        assert!(!summary.is_tie);
        assert_eq!(summary.winner, Some(a));

        // Now the transition completes into the next set
        expire_phase(&mut game);
        assert_eq!(game.state.phase, MatchPhase::Attack);
        assert_eq!(game.state.set_index, 2);
    }

    #[test]
    fn tiebreak_without_pending_tie_is_ignored() {
        let (mut game, _handle, a, _b) = started_duel();
        game.apply_tiebreak(a);
        assert_eq!(game.state.players[&a].set_wins, 0);
    }

    #[test]
    fn resolve_with_unsupported_population_is_a_logged_noop() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let roster = Arc::new(StubRoster::new(ids));
        let mut rules = MatchRules::default();
        rules.max_players = 4;
        rules.min_players = 3;
        let (mut game, _handle) = GameMatch::new(
            Uuid::new_v4(),
            rules.clamped(),
            roster.clone(),
            roster,
        );

        game.run_tick();
        assert_eq!(game.state.phase, MatchPhase::Attack);

        game.state.phase = MatchPhase::Defend;
        game.enter_resolve();

        assert_eq!(game.state.phase, MatchPhase::Resolve);
        assert!(game.round_events.is_empty());
        assert!(!game.state.end_set_pending);
    }

    #[test]
    fn population_shrink_mid_window_lowers_completion_threshold() {
        let (a, b) = sorted_pair();
        let c = Uuid::new_v4();
        let roster = Arc::new(StubRoster::new(vec![a, b, c]));
        let mut rules = MatchRules::default();
        rules.min_players = 2;
        rules.max_players = 4;
        let (mut game, _handle) =
            GameMatch::new(Uuid::new_v4(), rules.clamped(), roster.clone(), roster.clone());

        game.run_tick();
        assert_eq!(game.state.phase, MatchPhase::Attack);

        game.handle_attack_submit(a, SlapDirection::Left, 10, Some(c));
        assert_eq!(game.state.phase, MatchPhase::Attack);

        // c disconnects; the next submission re-checks the fresh count
        roster.ids.lock().unwrap().retain(|id| *id != c);
        game.handle_attack_submit(b, SlapDirection::Up, 10, Some(a));
        assert_eq!(game.state.phase, MatchPhase::Defend);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_driven_flow_over_the_match_task() {
        let (a, b) = sorted_pair();
        let roster = Arc::new(StubRoster::new(vec![a, b]));
        let mut rules = MatchRules::default();
        rules.attack_seconds = 1.0;
        rules.defend_seconds = 1.0;
        rules.resolve_seconds = 0.2;
        rules.transition_seconds = 0.2;
        let (game, handle) = GameMatch::new(
            Uuid::new_v4(),
            rules.clamped(),
            roster.clone(),
            roster.clone(),
        );

        let mut events = handle.events_tx.subscribe();
        let task = tokio::spawn(game.run());

        async fn next_phase(rx: &mut broadcast::Receiver<ServerMsg>) -> (MatchPhase, MatchPhase) {
            loop {
                match rx.recv().await.expect("match task alive") {
                    ServerMsg::PhaseChanged { previous, current } => return (previous, current),
                    _ => {}
                }
            }
        }

        assert_eq!(
            next_phase(&mut events).await,
            (MatchPhase::Waiting, MatchPhase::Attack)
        );
        // No submissions: every transition rides the timers
        assert_eq!(
            next_phase(&mut events).await,
            (MatchPhase::Attack, MatchPhase::Defend)
        );
        assert_eq!(
            next_phase(&mut events).await,
            (MatchPhase::Defend, MatchPhase::Resolve)
        );
        assert_eq!(
            next_phase(&mut events).await,
            (MatchPhase::Resolve, MatchPhase::Transition)
        );
        assert_eq!(
            next_phase(&mut events).await,
            (MatchPhase::Transition, MatchPhase::Attack)
        );

        task.abort();
    }
}
