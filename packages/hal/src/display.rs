use parking_lot::Mutex;

/// Two-line character display.
pub trait StatusDisplay: Send + Sync {
    fn show(&self, top: &str, bottom: &str);

    fn clear(&self) {
        self.show("", "")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullDisplay;

impl StatusDisplay for NullDisplay {
    fn show(&self, _top: &str, _bottom: &str) {}
}

/// Writes each update to the log and remembers the last one.
#[derive(Debug, Default)]
pub struct LogDisplay {
    lines: Mutex<(String, String)>,
}

impl LogDisplay {
    pub fn lines(&self) -> (String, String) {
        self.lines.lock().clone()
    }
}

impl StatusDisplay for LogDisplay {
    fn show(&self, top: &str, bottom: &str) {
        let mut lines = self.lines.lock();
        if lines.0 == top && lines.1 == bottom {
            return;
        }
        log::info!("LCD | {top:<16} | {bottom:<16} |");
        *lines = (top.to_string(), bottom.to_string());
    }
}
