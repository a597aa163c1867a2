use std::sync::atomic::{AtomicBool, Ordering};

/// Set by the Ctrl-C handler; checked by streaming execs so a keyboard
/// interrupt kills the in-container subprocess instead of orphaning it.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install the process-wide Ctrl-C handler. Call once at startup; later
/// calls are ignored (the handler can only be registered once).
pub fn install_interrupt_handler() {
    let _ = ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
    });
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Clear the flag after an interrupt has been handled, so the interactive
/// shell can keep running.
pub fn reset_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}
