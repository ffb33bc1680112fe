//! Per-phase commit collection - one sealed submission per participant per window

use std::collections::HashMap;
use uuid::Uuid;

use crate::ws::protocol::{MatchPhase, SlapDirection};

/// Upper bound on a single committed power value
pub const MAX_COMMIT_POWER: i32 = 999;

/// A stored attack commit for the current Attack window
#[derive(Debug, Clone, Copy)]
pub struct AttackCommit {
    pub attacker: Uuid,
    pub direction: SlapDirection,
    pub power: i32,
    /// Declared defender; None in 1v1 duel mode
    pub target: Option<Uuid>,
}

/// A stored defense commit for the current Defend window
#[derive(Debug, Clone, Copy)]
pub struct DefenseCommit {
    pub defender: Uuid,
    pub direction: SlapDirection,
}

/// Result of a submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored; more submissions still expected
    Stored,
    /// Stored, and this submission completed the window (fires once)
    AllSubmitted,
    /// Out of window or duplicate sender; state unchanged
    Ignored,
}

/// Collects exactly one submission per participant per relevant phase and
/// detects when all expected submissions are in. Owned by the match task;
/// commit sets are cleared on the relevant phase entries so no stale
/// commit can leak into a later window.
#[derive(Debug, Default)]
pub struct CommitBuffer {
    attacks: HashMap<Uuid, AttackCommit>,
    defenses: HashMap<Uuid, DefenseCommit>,
    accepting_attacks: bool,
    accepting_defenses: bool,
    // one-shot latches, reset with the window's clear
    attacks_complete_fired: bool,
    defenses_complete_fired: bool,
}

impl CommitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open/close submission windows as the coordinator moves phases.
    pub fn on_phase_entered(&mut self, phase: MatchPhase) {
        match phase {
            MatchPhase::Attack => {
                self.attacks.clear();
                self.defenses.clear();
                self.accepting_attacks = true;
                self.accepting_defenses = false;
                self.attacks_complete_fired = false;
                self.defenses_complete_fired = false;
            }
            MatchPhase::Defend => {
                self.accepting_attacks = false;
                self.accepting_defenses = true;
                self.defenses.clear();
                self.defenses_complete_fired = false;
            }
            _ => {
                self.accepting_attacks = false;
                self.accepting_defenses = false;
            }
        }
    }

    /// Store an attack commit. `expected` is the count of currently
    /// connected participants, queried fresh by the caller at every check.
    pub fn submit_attack(
        &mut self,
        sender: Uuid,
        direction: SlapDirection,
        power: i32,
        target: Option<Uuid>,
        expected: usize,
    ) -> SubmitOutcome {
        if !self.accepting_attacks || self.attacks.contains_key(&sender) {
            return SubmitOutcome::Ignored;
        }

        let power = power.clamp(0, MAX_COMMIT_POWER);
        self.attacks.insert(
            sender,
            AttackCommit {
                attacker: sender,
                direction,
                power,
                target,
            },
        );

        if self.attacks.len() >= expected && expected > 0 && !self.attacks_complete_fired {
            self.attacks_complete_fired = true;
            return SubmitOutcome::AllSubmitted;
        }
        SubmitOutcome::Stored
    }

    /// Store a defense commit, same acceptance/idempotency rules.
    pub fn submit_defense(
        &mut self,
        sender: Uuid,
        direction: SlapDirection,
        expected: usize,
    ) -> SubmitOutcome {
        if !self.accepting_defenses || self.defenses.contains_key(&sender) {
            return SubmitOutcome::Ignored;
        }

        self.defenses.insert(
            sender,
            DefenseCommit {
                defender: sender,
                direction,
            },
        );

        if self.defenses.len() >= expected && expected > 0 && !self.defenses_complete_fired {
            self.defenses_complete_fired = true;
            return SubmitOutcome::AllSubmitted;
        }
        SubmitOutcome::Stored
    }

    /// Snapshot of this window's attacks in duel flavor (no targets).
    pub fn duel_attacks(&self) -> HashMap<Uuid, (SlapDirection, i32)> {
        self.attacks
            .values()
            .map(|c| (c.attacker, (c.direction, c.power)))
            .collect()
    }

    /// Snapshot of this window's attacks with declared targets.
    pub fn targeted_attacks(&self) -> HashMap<Uuid, AttackCommit> {
        self.attacks.clone()
    }

    /// Snapshot of this window's defenses.
    pub fn defenses(&self) -> HashMap<Uuid, SlapDirection> {
        self.defenses
            .values()
            .map(|c| (c.defender, c.direction))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_in_attack() -> CommitBuffer {
        let mut buffer = CommitBuffer::new();
        buffer.on_phase_entered(MatchPhase::Attack);
        buffer
    }

    #[test]
    fn rejects_attacks_outside_attack_phase() {
        let mut buffer = CommitBuffer::new();
        let outcome = buffer.submit_attack(Uuid::new_v4(), SlapDirection::Left, 10, None, 2);
        assert_eq!(outcome, SubmitOutcome::Ignored);
        assert!(buffer.duel_attacks().is_empty());

        buffer.on_phase_entered(MatchPhase::Resolve);
        let outcome = buffer.submit_attack(Uuid::new_v4(), SlapDirection::Left, 10, None, 2);
        assert_eq!(outcome, SubmitOutcome::Ignored);
    }

    #[test]
    fn second_submission_from_same_sender_is_a_no_op() {
        let mut buffer = buffer_in_attack();
        let sender = Uuid::new_v4();

        assert_eq!(
            buffer.submit_attack(sender, SlapDirection::Left, 10, None, 2),
            SubmitOutcome::Stored
        );
        assert_eq!(
            buffer.submit_attack(sender, SlapDirection::Right, 500, None, 2),
            SubmitOutcome::Ignored
        );

        // First commit untouched
        let attacks = buffer.duel_attacks();
        assert_eq!(attacks[&sender], (SlapDirection::Left, 10));
    }

    #[test]
    fn power_is_clamped_to_valid_range() {
        let mut buffer = buffer_in_attack();
        let high = Uuid::new_v4();
        let low = Uuid::new_v4();

        buffer.submit_attack(high, SlapDirection::Up, 5000, None, 3);
        buffer.submit_attack(low, SlapDirection::Up, -7, None, 3);

        let attacks = buffer.duel_attacks();
        assert_eq!(attacks[&high].1, MAX_COMMIT_POWER);
        assert_eq!(attacks[&low].1, 0);
    }

    #[test]
    fn completion_fires_exactly_once_per_window() {
        let mut buffer = buffer_in_attack();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(
            buffer.submit_attack(a, SlapDirection::Left, 10, None, 2),
            SubmitOutcome::Stored
        );
        assert_eq!(
            buffer.submit_attack(b, SlapDirection::Up, 10, None, 2),
            SubmitOutcome::AllSubmitted
        );

        // A new sender arriving after the threshold must not re-raise
        assert_eq!(
            buffer.submit_attack(Uuid::new_v4(), SlapDirection::Right, 10, None, 2),
            SubmitOutcome::Stored
        );
        // Nor a duplicate
        assert_eq!(
            buffer.submit_attack(a, SlapDirection::Right, 10, None, 2),
            SubmitOutcome::Ignored
        );
    }

    #[test]
    fn zero_population_never_completes() {
        let mut buffer = buffer_in_attack();
        assert_eq!(
            buffer.submit_attack(Uuid::new_v4(), SlapDirection::Left, 10, None, 0),
            SubmitOutcome::Stored
        );
    }

    #[test]
    fn completion_latch_resets_on_next_window() {
        let mut buffer = buffer_in_attack();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        buffer.submit_attack(a, SlapDirection::Left, 10, None, 1);
        buffer.on_phase_entered(MatchPhase::Attack);

        assert!(buffer.duel_attacks().is_empty());
        assert_eq!(
            buffer.submit_attack(b, SlapDirection::Left, 10, None, 1),
            SubmitOutcome::AllSubmitted
        );
    }

    #[test]
    fn entering_attack_clears_both_commit_sets() {
        let mut buffer = buffer_in_attack();
        let a = Uuid::new_v4();

        buffer.submit_attack(a, SlapDirection::Left, 10, None, 2);
        buffer.on_phase_entered(MatchPhase::Defend);
        buffer.submit_defense(a, SlapDirection::Up, 2);

        buffer.on_phase_entered(MatchPhase::Attack);
        assert!(buffer.duel_attacks().is_empty());
        assert!(buffer.defenses().is_empty());
    }

    #[test]
    fn entering_defend_keeps_attack_commits() {
        let mut buffer = buffer_in_attack();
        let a = Uuid::new_v4();

        buffer.submit_attack(a, SlapDirection::Left, 10, None, 2);
        buffer.on_phase_entered(MatchPhase::Defend);

        // Attack snapshot still readable for resolution
        assert_eq!(buffer.duel_attacks().len(), 1);
        // But the attack window is closed
        assert_eq!(
            buffer.submit_attack(Uuid::new_v4(), SlapDirection::Left, 10, None, 2),
            SubmitOutcome::Ignored
        );
    }

    #[test]
    fn defense_completion_is_one_shot_too() {
        let mut buffer = buffer_in_attack();
        buffer.on_phase_entered(MatchPhase::Defend);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(
            buffer.submit_defense(a, SlapDirection::Left, 2),
            SubmitOutcome::Stored
        );
        assert_eq!(
            buffer.submit_defense(b, SlapDirection::Up, 2),
            SubmitOutcome::AllSubmitted
        );
        assert_eq!(
            buffer.submit_defense(Uuid::new_v4(), SlapDirection::Up, 2),
            SubmitOutcome::Stored
        );
    }

    #[test]
    fn targeted_attacks_round_trip_targets() {
        let mut buffer = buffer_in_attack();
        let attacker = Uuid::new_v4();
        let target = Uuid::new_v4();

        buffer.submit_attack(attacker, SlapDirection::Right, 42, Some(target), 4);

        let commits = buffer.targeted_attacks();
        assert_eq!(commits[&attacker].target, Some(target));
        assert_eq!(commits[&attacker].power, 42);
    }
}
