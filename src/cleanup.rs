use once_cell::sync::Lazy;
use parking_lot::Mutex;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Work that must happen before the process exits: restoring the terminal,
/// dropping the control lines.
static CLEANUPS: Lazy<Mutex<Vec<Cleanup>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn register_cleanup(f: impl FnOnce() + Send + 'static) {
    CLEANUPS.lock().push(Box::new(f));
}

/// Run and forget every registered cleanup, newest first. Safe to call more
/// than once.
pub fn run_cleanups() {
    let items = std::mem::take(&mut *CLEANUPS.lock());
    log::debug!("Running {} cleanup handlers", items.len());
    for f in items.into_iter().rev() {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
            log::warn!("A cleanup handler panicked");
        }
    }
}
