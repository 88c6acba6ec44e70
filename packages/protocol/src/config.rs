use serde::{Deserialize, Serialize};
use std::fmt;

/// How a status line toward the DTE is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinePolicy {
    FollowsCarrier,
    PinnedHigh,
}

impl LinePolicy {
    pub fn from_flag(flag: u8) -> Self {
        if flag == 0 {
            LinePolicy::PinnedHigh
        } else {
            LinePolicy::FollowsCarrier
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            LinePolicy::PinnedHigh => 0,
            LinePolicy::FollowsCarrier => 1,
        }
    }

    /// Level of the line given the logical carrier.
    pub fn level(self, carrier: bool) -> bool {
        match self {
            LinePolicy::PinnedHigh => true,
            LinePolicy::FollowsCarrier => carrier,
        }
    }
}

impl fmt::Display for LinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinePolicy::FollowsCarrier => write!(f, "follows-carrier"),
            LinePolicy::PinnedHigh => write!(f, "pinned-high"),
        }
    }
}

/// What a DTR drop does (`AT&D`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtrAction {
    /// `&D0`: ignore DTR.
    Ignore,
    /// `&D1`: drop to online command mode.
    CommandMode,
    /// `&D2`: hang up.
    Hangup,
    /// `&D3`: hang up and soft reset.
    Reset,
}

impl DtrAction {
    pub fn from_flag(flag: u8) -> Option<Self> {
        Some(match flag {
            0 => DtrAction::Ignore,
            1 => DtrAction::CommandMode,
            2 => DtrAction::Hangup,
            3 => DtrAction::Reset,
            _ => return None,
        })
    }

    pub fn flag(self) -> u8 {
        match self {
            DtrAction::Ignore => 0,
            DtrAction::CommandMode => 1,
            DtrAction::Hangup => 2,
            DtrAction::Reset => 3,
        }
    }
}

/// Mode flags set by the single-letter and `&` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub echo_in_cmd_mode: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub speaker_volume: u8,
    pub speaker_mode: u8,
    pub busy_detect: bool,
    pub extended_result_codes: bool,
    pub connect_msg_speed: bool,
    pub dcd_policy: LinePolicy,
    pub dsr_policy: LinePolicy,
    pub dtr_action: DtrAction,
    /// Last `ATX` level, kept for `&V`.
    pub result_level: u8,
    /// `ATW`: negotiation progress reporting.
    pub negotiation_report: u8,
    /// `ATY`
    pub long_space_disconnect: bool,
    /// `ATC`
    pub carrier_enabled: bool,
    /// `ATN`
    pub auto_mode: u8,
    /// `ATB`
    pub protocol_mode: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            echo_in_cmd_mode: true,
            quiet: false,
            verbose: true,
            speaker_volume: 2,
            speaker_mode: 1,
            busy_detect: true,
            extended_result_codes: true,
            connect_msg_speed: true,
            dcd_policy: LinePolicy::FollowsCarrier,
            dsr_policy: LinePolicy::PinnedHigh,
            dtr_action: DtrAction::Ignore,
            result_level: 4,
            negotiation_report: 0,
            long_space_disconnect: false,
            carrier_enabled: true,
            auto_mode: 1,
            protocol_mode: 0,
        }
    }
}

impl Config {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Apply an `ATXn` result-code level.
    ///
    /// X0 reports basic codes only, X1 adds the connect speed, X2 adds
    /// NO DIALTONE / NO ANSWER, X3 adds BUSY (without the extended codes) and
    /// X4 and above enable everything.
    pub fn set_result_level(&mut self, level: u8) {
        self.result_level = level;
        self.connect_msg_speed = level >= 1;
        self.extended_result_codes = level == 2 || level >= 4;
        self.busy_detect = level >= 3;
    }

    /// Whether the speaker should sound while dialling.
    pub fn speaker_on_while_dialing(&self) -> bool {
        self.speaker_mode > 0 && self.speaker_volume > 0
    }

    /// `AT&V` style listing.
    pub fn summary(&self) -> String {
        format!(
            "E{} Q{} V{} L{} M{} X{} W{} Y{} C{} N{} B{} &C{} &S{} &D{}",
            u8::from(self.echo_in_cmd_mode),
            u8::from(self.quiet),
            u8::from(self.verbose),
            self.speaker_volume,
            self.speaker_mode,
            self.result_level,
            self.negotiation_report,
            u8::from(self.long_space_disconnect),
            u8::from(self.carrier_enabled),
            self.auto_mode,
            self.protocol_mode,
            self.dcd_policy.flag(),
            self.dsr_policy.flag(),
            self.dtr_action.flag(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert!(cfg.echo_in_cmd_mode);
        assert!(!cfg.quiet);
        assert!(cfg.verbose);
        assert_eq!(cfg.speaker_volume, 2);
        assert_eq!(cfg.speaker_mode, 1);
        assert!(cfg.busy_detect);
        assert!(cfg.extended_result_codes);
        assert!(cfg.connect_msg_speed);
    }

    #[test]
    fn result_levels() {
        let mut cfg = Config::default();
        cfg.set_result_level(0);
        assert!(!cfg.connect_msg_speed && !cfg.busy_detect && !cfg.extended_result_codes);
        cfg.set_result_level(1);
        assert!(cfg.connect_msg_speed && !cfg.busy_detect && !cfg.extended_result_codes);
        cfg.set_result_level(2);
        assert!(!cfg.busy_detect && cfg.extended_result_codes);
        cfg.set_result_level(3);
        assert!(cfg.busy_detect && !cfg.extended_result_codes);
        cfg.set_result_level(7);
        assert!(cfg.busy_detect && cfg.extended_result_codes && cfg.connect_msg_speed);
    }

    #[test]
    fn policies() {
        assert!(LinePolicy::PinnedHigh.level(false));
        assert!(!LinePolicy::FollowsCarrier.level(false));
        assert_eq!(LinePolicy::from_flag(1), LinePolicy::FollowsCarrier);
        assert_eq!(DtrAction::from_flag(3), Some(DtrAction::Reset));
        assert_eq!(DtrAction::from_flag(4), None);
    }
}
