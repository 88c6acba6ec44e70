/// Guard-time detector for the `+++` escape.
///
/// Driven by two events: every data-mode byte from the terminal, and a tick
/// every guard interval. The sequence counts only when the tick before saw
/// no bytes, the tick itself saw exactly three escape characters, and the
/// tick after is silent again.
#[derive(Debug, Default)]
pub struct EscapeDetector {
    window: [u8; 3],
    this_tick: usize,
    last_tick: usize,
    armed: bool,
}

impl EscapeDetector {
    pub fn on_byte(&mut self, byte: u8) {
        self.window = [self.window[1], self.window[2], byte];
        self.this_tick += 1;
        self.armed = false;
    }

    /// Returns `true` when the escape is complete.
    pub fn on_tick(&mut self, escape_char: u8) -> bool {
        let fired = if self.armed {
            self.armed = false;
            self.this_tick == 0
        } else {
            self.armed = self.last_tick == 0
                && self.this_tick == 3
                && self.window.iter().all(|b| *b == escape_char);
            false
        };
        self.last_tick = self.this_tick;
        self.this_tick = 0;
        fired
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(d: &mut EscapeDetector, bytes: &[u8]) {
        bytes.iter().for_each(|b| d.on_byte(*b));
    }

    #[test]
    fn silence_plus_silence() {
        let mut d = EscapeDetector::default();
        feed(&mut d, b"hello");
        assert!(!d.on_tick(b'+'));
        assert!(!d.on_tick(b'+'));
        feed(&mut d, b"+++");
        assert!(!d.on_tick(b'+'));
        assert!(d.on_tick(b'+'));
        // One shot.
        assert!(!d.on_tick(b'+'));
    }

    #[test]
    fn no_silence_before() {
        let mut d = EscapeDetector::default();
        feed(&mut d, b"x");
        assert!(!d.on_tick(b'+'));
        feed(&mut d, b"+++");
        assert!(!d.on_tick(b'+'));
        assert!(!d.on_tick(b'+'));
    }

    #[test]
    fn no_silence_after() {
        let mut d = EscapeDetector::default();
        assert!(!d.on_tick(b'+'));
        feed(&mut d, b"+++");
        assert!(!d.on_tick(b'+'));
        feed(&mut d, b"a");
        assert!(!d.on_tick(b'+'));
        assert!(!d.on_tick(b'+'));
    }

    #[test]
    fn pluses_inside_data() {
        let mut d = EscapeDetector::default();
        assert!(!d.on_tick(b'+'));
        feed(&mut d, b"a+++");
        assert!(!d.on_tick(b'+'));
        assert!(!d.on_tick(b'+'));

        // The escape character comes from S2.
        feed(&mut d, b"---");
        assert!(!d.on_tick(b'-'));
        assert!(d.on_tick(b'-'));
    }
}
