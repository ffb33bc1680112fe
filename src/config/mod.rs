//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;

/// Floor applied to phase durations so a zero/negative configured value
/// still lets the countdown make progress
pub const PHASE_TIMER_FLOOR: f32 = 0.1;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origin for CORS
    pub client_origin: String,
    /// Match rules applied to every created match
    pub rules: MatchRules,
}

/// Rules for one match: phase durations, per-set resources, set count
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchRules {
    pub attack_seconds: f32,
    pub defend_seconds: f32,
    pub resolve_seconds: f32,
    pub transition_seconds: f32,
    /// Power available to each player at the start of a set
    pub power_per_set: i32,
    /// Attacks each player gets per set
    pub slaps_per_set: i32,
    /// Best-of-N sets
    pub best_of_sets: u32,
    pub min_players: usize,
    pub max_players: usize,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            attack_seconds: 20.0,
            defend_seconds: 20.0,
            resolve_seconds: 2.0,
            transition_seconds: 2.0,
            power_per_set: 100,
            slaps_per_set: 3,
            best_of_sets: 3,
            min_players: 2,
            max_players: 2,
        }
    }
}

impl MatchRules {
    /// Majority threshold of sets needed to take the match
    pub fn sets_to_win(&self) -> u32 {
        (self.best_of_sets / 2 + 1).max(1)
    }

    /// Clamp every value to a usable minimum. Invalid configuration is
    /// not an error path; out-of-range values are silently raised.
    pub fn clamped(self) -> Self {
        Self {
            attack_seconds: self.attack_seconds.max(PHASE_TIMER_FLOOR),
            defend_seconds: self.defend_seconds.max(PHASE_TIMER_FLOOR),
            resolve_seconds: self.resolve_seconds.max(PHASE_TIMER_FLOOR),
            transition_seconds: self.transition_seconds.max(PHASE_TIMER_FLOOR),
            power_per_set: self.power_per_set.max(1),
            slaps_per_set: self.slaps_per_set.max(1),
            best_of_sets: self.best_of_sets.max(1),
            min_players: self.min_players.max(2),
            max_players: self.max_players.max(self.min_players.max(2)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting providers inject PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = MatchRules::default();
        let rules = MatchRules {
            attack_seconds: env_parse("ATTACK_SECONDS", defaults.attack_seconds),
            defend_seconds: env_parse("DEFEND_SECONDS", defaults.defend_seconds),
            resolve_seconds: env_parse("RESOLVE_SECONDS", defaults.resolve_seconds),
            transition_seconds: env_parse("TRANSITION_SECONDS", defaults.transition_seconds),
            power_per_set: env_parse("POWER_PER_SET", defaults.power_per_set),
            slaps_per_set: env_parse("SLAPS_PER_SET", defaults.slaps_per_set),
            best_of_sets: env_parse("BEST_OF_SETS", defaults.best_of_sets),
            min_players: env_parse("MIN_PLAYERS", defaults.min_players),
            max_players: env_parse("MAX_PLAYERS", defaults.max_players),
        }
        .clamped();

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            client_origin: env::var("CLIENT_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            rules,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,
}
