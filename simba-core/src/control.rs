//! Client → device control messages.
//!
//! The payload is opaque to the gateway — frames are forwarded to the
//! device control socket byte-for-byte. Only the first byte (message
//! type) and, for touch events, the action byte are inspected, to
//! support validation, logging, and the overflow drop policy.

// ── Message types ────────────────────────────────────────────────

/// Control message types the gateway recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Type 2: inject touch event.
    Touch,
    /// Type 3: inject scroll event.
    Scroll,
    /// Type 4: back key, or wake the screen when it is off.
    BackOrScreenOn,
    /// Type 5: expand the notification panel.
    ExpandNotifications,
    /// Type 6: expand the quick-settings panel.
    ExpandSettings,
    /// Type 10: set screen power mode.
    ScreenPowerMode,
    /// Any other type — forwarded untouched.
    Other(u8),
}

impl ControlKind {
    pub fn type_byte(&self) -> u8 {
        match self {
            ControlKind::Touch => 2,
            ControlKind::Scroll => 3,
            ControlKind::BackOrScreenOn => 4,
            ControlKind::ExpandNotifications => 5,
            ControlKind::ExpandSettings => 6,
            ControlKind::ScreenPowerMode => 10,
            ControlKind::Other(t) => *t,
        }
    }
}

/// Touch action byte for a finger-move update.
const TOUCH_ACTION_MOVE: u8 = 2;

/// Message type byte for screen power mode.
pub const TYPE_SCREEN_POWER_MODE: u8 = 10;

/// Classify a control frame by its leading type byte.
///
/// Returns `None` for an empty frame, which callers drop with a
/// warning (never fatal).
pub fn classify(frame: &[u8]) -> Option<ControlKind> {
    let &type_byte = frame.first()?;
    Some(match type_byte {
        2 => ControlKind::Touch,
        3 => ControlKind::Scroll,
        4 => ControlKind::BackOrScreenOn,
        5 => ControlKind::ExpandNotifications,
        6 => ControlKind::ExpandSettings,
        10 => ControlKind::ScreenPowerMode,
        other => ControlKind::Other(other),
    })
}

/// Whether this frame may be evicted when the control queue overflows.
///
/// Only touch MOVE updates are expendable; touch UP/DOWN and power
/// events must never be displaced, otherwise the device is left with a
/// stuck finger or a dark screen.
pub fn is_droppable(frame: &[u8]) -> bool {
    frame.first() == Some(&2) && frame.get(1) == Some(&TOUCH_ACTION_MOVE)
}

/// Build a set-screen-power-mode frame (mode 0 = off, 2 = normal).
pub fn screen_power_mode_frame(mode: u8) -> Vec<u8> {
    vec![TYPE_SCREEN_POWER_MODE, mode]
}

// ── Tests ────────────────────────────────────────────────────────
