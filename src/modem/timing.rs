use std::time::Duration;

/// Rings before an unanswered inbound call is dropped.
pub const MAX_RINGS: u32 = 10;

/// Wall-clock constants of the modem and the units its timing registers
/// count in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub ring_on: Duration,
    pub ring_off: Duration,
    /// Granularity of the ring loop's hook and hangup checks.
    pub slice: Duration,
    pub ring_decay: Duration,
    pub pin_watch: Duration,
    pub dtr_poll: Duration,
    pub dial_timeout: Duration,
    /// S12
    pub guard_unit: Duration,
    /// S9, S10
    pub carrier_unit: Duration,
    /// S25
    pub dtr_unit: Duration,
    /// S7
    pub carrier_wait_unit: Duration,
    /// S30
    pub inactivity_unit: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ring_on: Duration::from_secs(2),
            ring_off: Duration::from_secs(4),
            slice: Duration::from_millis(20),
            ring_decay: Duration::from_secs(8),
            pin_watch: Duration::from_millis(100),
            dtr_poll: Duration::from_millis(5),
            dial_timeout: Duration::from_secs(6) * MAX_RINGS,
            guard_unit: Duration::from_millis(20),
            carrier_unit: Duration::from_millis(100),
            dtr_unit: Duration::from_millis(10),
            carrier_wait_unit: Duration::from_secs(1),
            inactivity_unit: Duration::from_secs(10),
        }
    }
}

impl Timing {
    /// Same shape, run fast. Register units shrink too except the guard
    /// time, which is set through S12 directly.
    pub fn compressed() -> Self {
        Self {
            ring_on: Duration::from_millis(150),
            ring_off: Duration::from_millis(250),
            slice: Duration::from_millis(5),
            ring_decay: Duration::from_millis(600),
            pin_watch: Duration::from_millis(10),
            dtr_poll: Duration::from_millis(2),
            dial_timeout: Duration::from_secs(3),
            guard_unit: Duration::from_millis(20),
            carrier_unit: Duration::from_millis(5),
            dtr_unit: Duration::from_millis(2),
            carrier_wait_unit: Duration::from_millis(100),
            inactivity_unit: Duration::from_millis(100),
        }
    }

    /// `units` register steps, `None` when the register is zero.
    pub fn scaled(unit: Duration, units: u8) -> Option<Duration> {
        (units > 0).then(|| unit * u32::from(units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_hardware() {
        let t = Timing::default();
        assert_eq!(t.dial_timeout, Duration::from_secs(60));
        assert_eq!(Timing::scaled(t.guard_unit, 50), Some(Duration::from_secs(1)));
        assert_eq!(Timing::scaled(t.inactivity_unit, 6), Some(Duration::from_secs(60)));
        assert_eq!(Timing::scaled(t.inactivity_unit, 0), None);
    }
}
