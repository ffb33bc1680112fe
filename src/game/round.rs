//! Exchange resolution - reveals one attack against one defense and scores it

use std::collections::HashMap;
use uuid::Uuid;

use crate::ws::protocol::{RoundEvent, SlapDirection, SlapOutcome};

use super::r#match::PlayerRuntimeState;

/// Resolve a single exchange: one committed attack against one committed
/// defense direction. Spends the attacker's power and slap, applies the
/// advantage delta to exactly one side, and returns the immutable event.
///
/// Knows nothing about phases, timers or the match as a whole; the
/// coordinator calls it once per attacker/defender pairing. Returns None
/// only when a referenced participant is missing from the state map.
pub fn resolve_exchange(
    attacker_id: Uuid,
    defender_id: Uuid,
    attack_dir: SlapDirection,
    defense_dir: SlapDirection,
    committed_power: i32,
    players: &mut HashMap<Uuid, PlayerRuntimeState>,
) -> Option<RoundEvent> {
    // Both participants must be tracked before anything is spent
    if !players.contains_key(&attacker_id) || !players.contains_key(&defender_id) {
        return None;
    }

    // Spend attacker power & slap (attacker pays power even if blocked)
    let spend = {
        let attacker = players.get_mut(&attacker_id)?;
        let spend = committed_power.max(0).min(attacker.power_left);
        attacker.power_left -= spend;
        attacker.slaps_left = (attacker.slaps_left - 1).max(0);
        spend
    };

    let blocked = attack_dir == defense_dir;
    let attacker_delta = if blocked { 0.0 } else { spend as f32 };
    let defender_delta = if blocked { spend as f32 * 0.5 } else { 0.0 };

    players.get_mut(&attacker_id)?.advantage += attacker_delta;
    players.get_mut(&defender_id)?.advantage += defender_delta;

    Some(RoundEvent {
        attacker: attacker_id,
        defender: defender_id,
        attack_dir,
        defense_dir,
        power_spent: spend,
        outcome: if blocked {
            SlapOutcome::Blocked
        } else {
            SlapOutcome::Hit
        },
        attacker_delta,
        defender_delta,
    })
}
