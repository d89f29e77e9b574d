//! Per-tick device commands

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::math::{clamp01, round_to};
use crate::protocol::Request;
use crate::types::BrainState;

/// Pattern variable carrying the smoothed color mood.
pub const VAR_COLOR_MOOD: &str = "colorMoodBias";
/// Pattern variable for base hue.
pub const VAR_HUE: &str = "hue";
/// Pattern variable for brightness.
pub const VAR_BRIGHTNESS: &str = "brightness";
/// Pattern variable for animation speed.
pub const VAR_SPEED: &str = "speed";
/// Pattern variable for manual intensity overrides.
pub const VAR_INTENSITY: &str = "intensity";

/// Decimal places kept in transmitted mood values.
const MOOD_DECIMALS: i32 = 3;

// ============================================================================
// State Profiles
// ============================================================================

/// Lighting profile attached to a brain state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateProfile {
    /// Substring matched against device catalogs
    pub pattern: &'static str,
    /// Base hue in `[0, 1]`
    pub hue: f64,
    /// Brightness in `[0, 1]`
    pub brightness: f64,
    /// Animation speed in `[0, 1]`
    pub speed: f64,
}

impl StateProfile {
    /// Fixed profile for each state.
    #[must_use]
    pub const fn for_state(state: BrainState) -> Self {
        match state {
            BrainState::Engaged => Self {
                pattern: "sparkfire",
                hue: 0.0,
                brightness: 0.9,
                speed: 0.8,
            },
            BrainState::Relaxed => Self {
                pattern: "slow waves",
                hue: 0.67,
                brightness: 0.5,
                speed: 0.3,
            },
            BrainState::Neutral => Self {
                pattern: "rainbow",
                hue: 0.33,
                brightness: 0.7,
                speed: 0.5,
            },
        }
    }
}

// ============================================================================
// Command
// ============================================================================

/// Immutable command broadcast to every connected device for one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Pattern name to switch to, present only on a state transition
    pub target_pattern: Option<String>,
    /// Variables to set
    pub variables: BTreeMap<String, f64>,
}

impl Command {
    /// Build the tick command for a state and mood.
    ///
    /// Variables always carry the state's hue, brightness and speed plus the
    /// rounded mood. The pattern name is included only when `state_changed`.
    #[must_use]
    pub fn for_tick(state: BrainState, mood: f64, state_changed: bool) -> Self {
        let profile = StateProfile::for_state(state);
        let mut variables = BTreeMap::new();
        variables.insert(VAR_HUE.to_string(), profile.hue);
        variables.insert(VAR_BRIGHTNESS.to_string(), profile.brightness);
        variables.insert(VAR_SPEED.to_string(), profile.speed);
        variables.insert(VAR_COLOR_MOOD.to_string(), quantize_mood(mood));

        Self {
            target_pattern: state_changed.then(|| profile.pattern.to_string()),
            variables,
        }
    }

    /// Manual override: mood and intensity, no pattern switch.
    #[must_use]
    pub fn manual_mood(mood: f64, intensity: f64) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(VAR_COLOR_MOOD.to_string(), quantize_mood(mood));
        variables.insert(VAR_INTENSITY.to_string(), clamp01(intensity));
        Self {
            target_pattern: None,
            variables,
        }
    }

    /// Manual override of intensity alone.
    #[must_use]
    pub fn intensity_only(intensity: f64) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(VAR_INTENSITY.to_string(), clamp01(intensity));
        Self {
            target_pattern: None,
            variables,
        }
    }

    /// Whether this command asks for a pattern switch.
    #[must_use]
    pub fn switches_pattern(&self) -> bool {
        self.target_pattern.is_some()
    }

    /// Variable-set request for this command.
    #[must_use]
    pub fn set_vars_request(&self) -> Request {
        Request::SetVars(self.variables.clone())
    }
}

fn quantize_mood(mood: f64) -> f64 {
    round_to(clamp01(mood), MOOD_DECIMALS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_command_without_transition() {
        let cmd = Command::for_tick(BrainState::Neutral, 0.123_456, false);
        assert!(!cmd.switches_pattern());
        assert_eq!(cmd.variables[VAR_COLOR_MOOD], 0.123);
        assert_eq!(cmd.variables[VAR_HUE], 0.33);
        assert_eq!(cmd.variables.len(), 4);
    }

    #[test]
    fn test_tick_command_on_transition() {
        let cmd = Command::for_tick(BrainState::Engaged, 0.2, true);
        assert_eq!(cmd.target_pattern.as_deref(), Some("sparkfire"));
        assert_eq!(cmd.variables[VAR_BRIGHTNESS], 0.9);
        assert_eq!(cmd.variables[VAR_SPEED], 0.8);

        let cmd = Command::for_tick(BrainState::Relaxed, 0.8, true);
        assert_eq!(cmd.target_pattern.as_deref(), Some("slow waves"));
    }

    #[test]
    fn test_manual_commands_clamped() {
        let cmd = Command::manual_mood(1.4, -0.5);
        assert_eq!(cmd.variables[VAR_COLOR_MOOD], 1.0);
        assert_eq!(cmd.variables[VAR_INTENSITY], 0.0);
        assert!(!cmd.switches_pattern());

        let cmd = Command::intensity_only(0.4);
        assert_eq!(cmd.variables.len(), 1);
    }

    #[test]
    fn test_set_vars_request() {
        let cmd = Command::intensity_only(0.5);
        assert_eq!(cmd.set_vars_request().to_frame(), r#"{"setVars":{"intensity":0.5}}"#);
    }
}
