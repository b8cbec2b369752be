//! Window introspection: focused window, class, title and owning pid.
//!
//! Every lookup is made fresh: focus and properties change without
//! notice, so nothing here is cached across events. A property that is
//! missing, or a window that vanished mid-query, is a normal outcome and
//! yields an empty/absent value, never an error.

mod text;

use x11rb::protocol::xproto::Window;

use crate::connection::{DisplayServer, PropertyType, ServerError, WindowProperty};

pub use text::decode_text_list;

/// `PointerRoot`: focus follows the pointer, no specific window.
const POINTER_ROOT: Window = 1;

/// How far up the tree to look for the window carrying `WM_CLASS`.
const MAX_TREE_DEPTH: usize = 16;

/// Java's focus proxy; the real class lives on an ancestor.
const FOCUS_PROXY_CLASS: &str = "FocusProxy";

/// Snapshot of the focused window at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowInfo {
    /// The window receiving keyboard input; synthetic keys go here.
    pub window: Option<Window>,
    /// The top-level client window the properties were read from.
    pub client: Option<Window>,
    /// `WM_CLASS` class part, e.g. `URxvt`.
    pub class: Option<String>,
    /// `WM_CLASS` instance part, e.g. `urxvt`.
    pub instance: Option<String>,
    pub name: Option<String>,
    pub pid: Option<u32>,
}

impl WindowInfo {
    /// Whether `class` names this window, by class or instance.
    pub fn has_class(&self, class: &str) -> bool {
        self.class.as_deref() == Some(class) || self.instance.as_deref() == Some(class)
    }
}

/// The window the server currently delivers keyboard input to.
///
/// `None` when focus is `None` or `PointerRoot`.
pub fn focused_window(server: &impl DisplayServer) -> Result<Option<Window>, ServerError> {
    let focus = server.input_focus()?;
    Ok((focus > POINTER_ROOT).then_some(focus))
}

/// Fetch a text property as a list; absence and failures give `[]`.
fn text_list(server: &impl DisplayServer, window: Window, property: WindowProperty) -> Vec<String> {
    match server.property(window, property) {
        Ok(Some(raw)) => decode_text_list(&raw),
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::debug!(window, ?property, error = %e, "property fetch failed");
            Vec::new()
        }
    }
}

/// `WM_CLASS` split into (instance, class), in one fetch.
///
/// A single-element list serves as both parts.
fn class_hint(server: &impl DisplayServer, window: Window) -> (String, String) {
    let mut list = text_list(server, window, WindowProperty::Class).into_iter();
    let instance = list.next().unwrap_or_default();
    let class = list.next().unwrap_or_else(|| instance.clone());
    (instance, class)
}

/// `WM_CLASS` class part, or empty.
pub fn window_class(server: &impl DisplayServer, window: Window) -> String {
    class_hint(server, window).1
}

/// `WM_CLASS` instance part, or empty.
pub fn window_instance(server: &impl DisplayServer, window: Window) -> String {
    class_hint(server, window).0
}

/// Window title from `_NET_WM_NAME`; falls back to the legacy `WM_NAME`
/// when the former is empty and `fallback` is set.
pub fn window_name(server: &impl DisplayServer, window: Window, fallback: bool) -> String {
    let first = |property| {
        text_list(server, window, property)
            .into_iter()
            .next()
            .unwrap_or_default()
    };

    let name = first(WindowProperty::Name);
    if name.is_empty() && fallback {
        first(WindowProperty::LegacyName)
    } else {
        name
    }
}

/// `_NET_WM_PID`, if set as a 32-bit cardinal.
pub fn window_pid(server: &impl DisplayServer, window: Window) -> Option<u32> {
    let raw = match server.property(window, WindowProperty::Pid) {
        Ok(raw) => raw?,
        Err(e) => {
            tracing::debug!(window, error = %e, "_NET_WM_PID fetch failed");
            return None;
        }
    };

    if raw.type_ != PropertyType::Cardinal || raw.format != 32 {
        return None;
    }
    let bytes: [u8; 4] = raw.value.get(..4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}

/// Walk up from `focus` to the first window with a usable `WM_CLASS`.
///
/// Toolkits often focus an inner child; the window manager's properties
/// sit on the top-level client. Returns `focus` itself if no ancestor
/// has a class.
pub fn client_window(server: &impl DisplayServer, focus: Window) -> Window {
    find_client(server, focus).0
}

/// [`client_window`], also handing back the class hint it read there.
fn find_client(server: &impl DisplayServer, focus: Window) -> (Window, (String, String)) {
    let root = server.root();
    let mut window = focus;
    let mut focus_hint = None;

    for _ in 0..MAX_TREE_DEPTH {
        let hint = class_hint(server, window);
        if !hint.1.is_empty() && hint.1 != FOCUS_PROXY_CLASS {
            return (window, hint);
        }
        if focus_hint.is_none() {
            focus_hint = Some(hint);
        }

        match server.parent(window) {
            Ok(Some(parent)) if parent != root => window = parent,
            Ok(_) => break,
            Err(e) => {
                tracing::debug!(window, error = %e, "query_tree failed");
                break;
            }
        }
    }

    (focus, focus_hint.unwrap_or_default())
}

/// Snapshot class, instance, title and pid for `focus`.
pub fn window_info(
    server: &impl DisplayServer,
    focus: Option<Window>,
    name_fallback: bool,
) -> WindowInfo {
    let Some(focus) = focus else {
        return WindowInfo::default();
    };
    let (client, (instance, class)) = find_client(server, focus);

    let non_empty = |s: String| (!s.is_empty()).then_some(s);

    WindowInfo {
        window: Some(focus),
        client: Some(client),
        class: non_empty(class),
        instance: non_empty(instance),
        name: non_empty(window_name(server, client, name_fallback)),
        pid: window_pid(server, client),
    }
}

/// Resolve the focused window and snapshot it.
///
/// A failed focus query degrades to an empty snapshot.
pub fn current(server: &impl DisplayServer, name_fallback: bool) -> WindowInfo {
    match focused_window(server) {
        Ok(focus) => window_info(server, focus, name_fallback),
        Err(e) => {
            tracing::warn!(error = %e, "focus query failed");
            WindowInfo::default()
        }
    }
}
