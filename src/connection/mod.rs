//! Display connection: lifecycle, server capability trait, event types.
//!
//! The rest of the crate talks to the X server only through the
//! [`DisplayServer`] trait. [`X11Connection`] is the production
//! implementation on top of `x11rb`; tests substitute an in-memory fake.

mod shutdown;
mod x11;

use std::fmt;

use x11rb::protocol::xproto::{Keycode, Keysym, Window};

use crate::keys::{Direction, KeyEvent};

pub use shutdown::ShutdownSignal;
pub use x11::X11Connection;

/// Display connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The display server cannot be reached.
    #[error("cannot open display: {0}")]
    Connect(String),
    /// Transport or request failure on an open connection.
    #[error("X11: {0}")]
    X11(String),
    /// The server answered a checked request with an error.
    #[error("X11 request failed: {0}")]
    Protocol(ProtocolError),
    #[error("signal handling: {0}")]
    Signal(nix::Error),
}

/// An X11 protocol error, reported either for a checked request or out of
/// band through the error hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// Error kind as named by the protocol (`Window`, `Access`, ...).
    pub kind: String,
    pub error_code: u8,
    pub major_opcode: u8,
    pub minor_opcode: u16,
    pub bad_value: u32,
    pub sequence: u16,
    pub request: Option<&'static str>,
}

impl ProtocolError {
    /// `BadAccess`, which a grab returns when another client holds the key.
    pub fn is_access(&self) -> bool {
        self.kind == "Access"
    }
}

impl From<&x11rb::x11_utils::X11Error> for ProtocolError {
    fn from(e: &x11rb::x11_utils::X11Error) -> Self {
        Self {
            kind: format!("{:?}", e.error_kind),
            error_code: e.error_code,
            major_opcode: e.major_opcode,
            minor_opcode: e.minor_opcode,
            bad_value: e.bad_value,
            sequence: e.sequence,
            request: e.request_name,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bad{} (code {}) on {} (major {}, minor {}), value 0x{:x}, sequence {}",
            self.kind,
            self.error_code,
            self.request.unwrap_or("unknown request"),
            self.major_opcode,
            self.minor_opcode,
            self.bad_value,
            self.sequence
        )
    }
}

/// Callback for errors the server delivers asynchronously.
pub type ErrorHook = Box<dyn FnMut(&ProtocolError)>;

/// Default error hook: log and carry on.
pub fn log_protocol_error(error: &ProtocolError) {
    tracing::warn!(error = %error, "X11 protocol error");
}

/// Snapshot of the server's keycode → keysym table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyboardMapping {
    pub min_keycode: Keycode,
    pub keysyms_per_keycode: u8,
    /// `keysyms_per_keycode` entries per keycode, starting at `min_keycode`.
    pub keysyms: Vec<Keysym>,
}

impl KeyboardMapping {
    /// Keysym columns for `keycode`, or an empty slice if out of range.
    pub fn keysyms_for(&self, keycode: Keycode) -> &[Keysym] {
        let per = self.keysyms_per_keycode as usize;
        if per == 0 || keycode < self.min_keycode {
            return &[];
        }
        let start = (keycode - self.min_keycode) as usize * per;
        self.keysyms.get(start..start + per).unwrap_or(&[])
    }

    /// Iterate `(keycode, columns)` in ascending keycode order.
    pub fn iter(&self) -> impl Iterator<Item = (Keycode, &[Keysym])> {
        let per = (self.keysyms_per_keycode as usize).max(1);
        self.keysyms
            .chunks(per)
            .enumerate()
            .filter(|_| self.keysyms_per_keycode > 0)
            .map(move |(i, syms)| (self.min_keycode.wrapping_add(i as u8), syms))
    }
}

/// Snapshot of the server's modifier map: 8 rows (Shift, Lock, Control,
/// Mod1..Mod5) × `keycodes_per_modifier`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifierMapping {
    pub keycodes_per_modifier: u8,
    pub keycodes: Vec<Keycode>,
}

/// Window properties the introspector reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowProperty {
    /// `WM_CLASS`
    Class,
    /// `_NET_WM_NAME`
    Name,
    /// `WM_NAME`, the pre-EWMH title.
    LegacyName,
    /// `_NET_WM_PID`
    Pid,
}

/// Declared type of a fetched property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// `STRING`: Latin-1.
    String,
    /// `UTF8_STRING`
    Utf8,
    /// `COMPOUND_TEXT`
    CompoundText,
    /// `CARDINAL`
    Cardinal,
    Other(u32),
}

/// Raw property value as returned by `GetProperty`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProperty {
    pub type_: PropertyType,
    pub format: u8,
    pub value: Vec<u8>,
}

/// Property changes the dispatcher cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedProperty {
    /// `_NET_ACTIVE_WINDOW` on the root window: focus moved.
    ActiveWindow,
    Class,
    Name,
    Pid,
}

/// Which mapping a `MappingNotify` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Modifier,
    Keyboard,
    Pointer,
}

/// Events delivered to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Key {
        direction: Direction,
        keycode: Keycode,
        state: u16,
        window: Window,
    },
    PropertyNotify {
        window: Window,
        /// `None` for properties nobody here reads.
        property: Option<WatchedProperty>,
    },
    MappingNotify {
        kind: MappingKind,
    },
    /// Anything else, identified by its response type.
    Other {
        code: u8,
    },
}

/// Result of waiting for the next event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextEvent {
    Event(ServerEvent),
    /// A termination signal arrived; the loop should stop.
    Shutdown(i32),
}

/// The X server capabilities the remapper needs.
///
/// Requests that the server answers only on failure (`send_key_event`,
/// `ungrab_all_keys`) are fire-and-forget: their errors are reported
/// through the connection's error hook, not the return value.
pub trait DisplayServer {
    /// Root window of the default screen.
    fn root(&self) -> Window;

    /// Ask for `PropertyNotify` on the root window.
    fn select_root_events(&self) -> Result<(), ServerError>;

    /// Start or stop receiving `PropertyNotify` for a client window.
    ///
    /// Fire-and-forget: the window may already be gone.
    fn watch_window(&self, window: Window, watch: bool) -> Result<(), ServerError>;

    fn keyboard_mapping(&self) -> Result<KeyboardMapping, ServerError>;

    fn modifier_mapping(&self) -> Result<ModifierMapping, ServerError>;

    /// Passive asynchronous grab of `keycode` under exactly `modifiers`
    /// on the root window. Checked: a conflict is an `Err`.
    fn grab_key(&self, keycode: Keycode, modifiers: u16) -> Result<(), ServerError>;

    /// Release one `keycode`/`modifiers` grab on the root window.
    fn ungrab_key(&self, keycode: Keycode, modifiers: u16) -> Result<(), ServerError>;

    /// Release every key grab this client holds on the root window.
    fn ungrab_all_keys(&self) -> Result<(), ServerError>;

    /// The window currently receiving keyboard input (raw id; 0 = None,
    /// 1 = PointerRoot).
    fn input_focus(&self) -> Result<Window, ServerError>;

    /// Parent of `window`, or `None` at the root.
    fn parent(&self, window: Window) -> Result<Option<Window>, ServerError>;

    /// Fetch a property; `Ok(None)` when it is not set.
    fn property(
        &self,
        window: Window,
        property: WindowProperty,
    ) -> Result<Option<RawProperty>, ServerError>;

    fn send_key_event(&self, event: &KeyEvent) -> Result<(), ServerError>;

    fn flush(&self) -> Result<(), ServerError>;

    /// Block until the next event or a shutdown signal.
    fn next_event(&mut self) -> Result<NextEvent, ServerError>;
}
