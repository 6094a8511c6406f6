//! The user-presence collaborator (§6): whatever physical button or touch
//! sensor gates REGISTER/AUTHENTICATE and CTAP2 credential operations.

/// CTAP1 checks presence instantaneously; CTAP2 blocks until it is asserted.
pub trait UserPresence {
    /// Non-blocking: true if the button is asserted right now.
    fn is_present(&mut self) -> bool;

    /// Blocks the cooperative main loop until the button is tapped.
    fn wait_for_presence(&mut self);
}

/// A button that is always held down. Useful for scripted demos and tests;
/// never wired up to a real transport in production use.
#[derive(Default)]
pub struct AlwaysPresent;

impl UserPresence for AlwaysPresent {
    fn is_present(&mut self) -> bool {
        true
    }

    fn wait_for_presence(&mut self) {}
}

/// A button that reports absent until armed, for testing the
/// `CONDITIONS_NOT_SATISFIED` / blocking paths explicitly.
#[derive(Default)]
pub struct ScriptedPresence {
    pub present: bool,
}

impl UserPresence for ScriptedPresence {
    fn is_present(&mut self) -> bool {
        self.present
    }

    fn wait_for_presence(&mut self) {
        self.present = true;
    }
}

/// The production shape (§6, §10): a hardware button latched through a
/// `std::sync::atomic` flag. `is_present` consumes the edge — a press reads
/// true at most once — matching the button interface's documented semantics.
/// `wait_for_presence` busy-polls it, per the single-threaded cooperative
/// scheduling model of §5 (no channel, no wakeups: just spin and check).
pub struct AtomicPresence {
    pressed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl AtomicPresence {
    pub fn new(flag: std::sync::Arc<std::sync::atomic::AtomicBool>) -> Self {
        Self { pressed: flag }
    }
}

impl UserPresence for AtomicPresence {
    fn is_present(&mut self) -> bool {
        self.pressed.swap(false, std::sync::atomic::Ordering::SeqCst)
    }

    fn wait_for_presence(&mut self) {
        while !self.is_present() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
