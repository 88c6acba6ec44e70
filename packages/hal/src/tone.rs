use parking_lot::Mutex;
use std::time::Duration;

/// Call-progress sounds the speaker can play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tone {
    DialTone,
    Dtmf { digit: char, duration: Duration },
    RingBack,
    Busy,
    Carrier,
    Silence,
}

/// Tone engine. Calls queue a sound and return; the engine serializes
/// playback behind its own lock.
pub trait ToneGenerator: Send + Sync {
    fn play(&self, tone: Tone);

    fn dtmf(&self, digits: &str, per_digit: Duration) {
        for digit in digits.chars().filter(|c| is_dtmf_digit(*c)) {
            self.play(Tone::Dtmf {
                digit,
                duration: per_digit,
            });
        }
    }
}

/// Keys present on a DTMF keypad.
pub fn is_dtmf_digit(c: char) -> bool {
    c.is_ascii_digit() || matches!(c.to_ascii_uppercase(), 'A'..='D' | '*' | '#')
}

/// Headless backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTone;

impl ToneGenerator for NullTone {
    fn play(&self, tone: Tone) {
        log::trace!("tone {tone:?} (muted)");
    }
}

/// Keeps every queued tone, for inspection.
#[derive(Debug, Default)]
pub struct RecordingTone {
    played: Mutex<Vec<Tone>>,
}

impl RecordingTone {
    pub fn played(&self) -> Vec<Tone> {
        self.played.lock().clone()
    }
}

impl ToneGenerator for RecordingTone {
    fn play(&self, tone: Tone) {
        self.played.lock().push(tone);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtmf_skips_modifiers() {
        let tone = RecordingTone::default();
        tone.dtmf("9W,5#", Duration::from_millis(95));
        let digits: Vec<char> = tone
            .played()
            .into_iter()
            .filter_map(|t| match t {
                Tone::Dtmf { digit, .. } => Some(digit),
                _ => None,
            })
            .collect();
        assert_eq!(digits, vec!['9', '5', '#']);
    }
}
