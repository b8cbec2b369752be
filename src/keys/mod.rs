//! Key codec: key identities, modifier masks, and synthetic key events.
//!
//! Translates between abstract keys ("C-b", "Left") and the server's
//! keycode/keysym/modifier-mask representation, and builds the synthetic
//! key event records the dispatcher sends back to the focused window.

pub mod codec;
pub mod expression;
pub mod keysym;

use std::fmt;

use x11rb::protocol::xproto::{Keycode, Keysym, ModMask, Window};

pub use codec::KeyCodec;

/// Key codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The keysym has no keycode on the current keyboard layout.
    #[error("keysym {0} has no keycode in the current keyboard mapping")]
    Unknown(String),
    #[error("invalid key expression: {0}")]
    InvalidExpression(String),
}

/// A modifier bitmask in X11 `ModMask` bit layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Modifiers(u16);

impl Modifiers {
    pub const NONE: Self = Self(0);
    pub const SHIFT: Self = Self(1 << 0);
    pub const CONTROL: Self = Self(1 << 2);
    /// Mod1, conventionally Alt/Meta.
    pub const ALT: Self = Self(1 << 3);
    /// Mod4, conventionally Super/Windows.
    pub const SUPER: Self = Self(1 << 6);
    /// AnyModifier: grab the key under every modifier combination.
    pub const ANY: Self = Self(1 << 15);

    /// CapsLock bit, always LockMask.
    pub const LOCK_BIT: u16 = 1 << 1;

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_any(self) -> bool {
        self.0 & Self::ANY.0 != 0
    }

    /// Strip lock and pointer button bits from an event state.
    ///
    /// `numlock_mask` is the dynamically detected NumLock modifier bit.
    pub fn from_event_state(state: u16, numlock_mask: u16) -> Self {
        let lock_mask = Self::LOCK_BIT | numlock_mask;
        // Bits 8-12 are pointer buttons; only the low byte holds modifiers.
        Self(state & !lock_mask & 0x00ff)
    }
}

impl std::ops::BitOr for Modifiers {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Modifiers {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<Modifiers> for ModMask {
    fn from(m: Modifiers) -> Self {
        ModMask::from(m.0)
    }
}

impl fmt::Display for Modifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return f.write_str("Any-");
        }
        for (bit, prefix) in [
            (Self::CONTROL, "C-"),
            (Self::ALT, "M-"),
            (Self::SUPER, "Super-"),
            (Self::SHIFT, "Shift-"),
        ] {
            if self.contains(bit) {
                f.write_str(prefix)?;
            }
        }
        Ok(())
    }
}

/// Press or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Press,
    Release,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Press => f.write_str("press"),
            Direction::Release => f.write_str("release"),
        }
    }
}

/// A semantic key: layout-independent keysym plus modifier set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyIdentity {
    pub keysym: Keysym,
    pub modifiers: Modifiers,
}

impl KeyIdentity {
    pub const fn new(keysym: Keysym, modifiers: Modifiers) -> Self {
        Self { keysym, modifiers }
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.modifiers)?;
        match keysym::name_of(self.keysym) {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:04x}", self.keysym),
        }
    }
}

/// A synthetic key event record, ready to be sent to `window`.
///
/// Position fields carry a fixed sentinel since they are meaningless for
/// key events; the timestamp is always CurrentTime so the server assigns
/// ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub direction: Direction,
    pub window: Window,
    pub root: Window,
    pub keycode: Keycode,
    pub state: u16,
}

impl KeyEvent {
    /// Sentinel used for `event_x`, `event_y`, `root_x` and `root_y`.
    pub const POSITION: i16 = 1;

    /// Convert into the x11rb wire event.
    pub fn to_x11(&self) -> x11rb::protocol::xproto::KeyPressEvent {
        use x11rb::protocol::xproto::{KEY_PRESS_EVENT, KEY_RELEASE_EVENT, KeyButMask};

        x11rb::protocol::xproto::KeyPressEvent {
            response_type: match self.direction {
                Direction::Press => KEY_PRESS_EVENT,
                Direction::Release => KEY_RELEASE_EVENT,
            },
            detail: self.keycode,
            sequence: 0,
            time: x11rb::CURRENT_TIME,
            root: self.root,
            event: self.window,
            child: x11rb::NONE,
            root_x: Self::POSITION,
            root_y: Self::POSITION,
            event_x: Self::POSITION,
            event_y: Self::POSITION,
            state: KeyButMask::from(self.state),
            same_screen: true,
        }
    }
}
