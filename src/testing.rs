//! In-memory display server for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use x11rb::protocol::xproto::{Keycode, Window};

use crate::connection::{
    DisplayServer, KeyboardMapping, ModifierMapping, NextEvent, PropertyType, RawProperty,
    ServerError, ServerEvent, WatchedProperty, WindowProperty,
};
use crate::keys::KeyEvent;

pub const ROOT: Window = 0x1e3;

/// Keycodes in the default fake layout.
pub const KC_B: Keycode = 9;
pub const KC_LEFT: Keycode = 10;
/// `1` unshifted, `!` with Shift.
pub const KC_ONE: Keycode = 13;

pub fn default_mapping() -> KeyboardMapping {
    KeyboardMapping {
        min_keycode: 8,
        keysyms_per_keycode: 2,
        keysyms: vec![
            0x61, 0x41, // a A
            0x62, 0x42, // b B
            0xff51, 0, // Left
            0x78, 0x58, // x X
            0xff57, 0, // End
            0x31, 0x21, // 1 !
        ],
    }
}

#[derive(Default)]
pub struct FakeServer {
    pub mapping: RefCell<KeyboardMapping>,
    pub modifiers: RefCell<ModifierMapping>,
    pub focus: Cell<Window>,
    pub parents: RefCell<HashMap<Window, Window>>,
    pub properties: RefCell<HashMap<(Window, WindowProperty), RawProperty>>,
    /// Currently registered (keycode, modifiers) grabs.
    pub grabs: RefCell<HashSet<(Keycode, u16)>>,
    /// Grabs another client holds; grabbing them fails with BadAccess.
    pub foreign_grabs: RefCell<HashSet<(Keycode, u16)>>,
    pub ungrab_requests: Cell<usize>,
    /// Make `ungrab_all_keys` fail as if the connection dropped.
    pub fail_ungrab: Cell<bool>,
    /// Client windows with `PropertyChange` selected.
    pub watched: RefCell<HashSet<Window>>,
    /// Every property fetch, in order.
    pub property_reads: RefCell<Vec<(Window, WindowProperty)>>,
    pub sent: RefCell<Vec<KeyEvent>>,
    pub events: RefCell<VecDeque<ServerEvent>>,
    pub root_selected: Cell<bool>,
    /// Signal number reported once the event queue runs dry.
    pub shutdown_signal: Cell<i32>,
}

impl FakeServer {
    pub fn new() -> Self {
        let server = Self::default();
        *server.mapping.borrow_mut() = default_mapping();
        server.shutdown_signal.set(15);
        server
    }

    pub fn set_text(&self, window: Window, property: WindowProperty, text: &[u8]) {
        self.properties.borrow_mut().insert(
            (window, property),
            RawProperty {
                type_: PropertyType::String,
                format: 8,
                value: text.to_vec(),
            },
        );
    }

    pub fn set_utf8(&self, window: Window, property: WindowProperty, text: &str) {
        self.properties.borrow_mut().insert(
            (window, property),
            RawProperty {
                type_: PropertyType::Utf8,
                format: 8,
                value: text.as_bytes().to_vec(),
            },
        );
    }

    pub fn set_class(&self, window: Window, instance: &str, class: &str) {
        self.set_text(
            window,
            WindowProperty::Class,
            format!("{instance}\0{class}\0").as_bytes(),
        );
    }

    pub fn set_pid(&self, window: Window, pid: u32) {
        self.properties.borrow_mut().insert(
            (window, WindowProperty::Pid),
            RawProperty {
                type_: PropertyType::Cardinal,
                format: 32,
                value: pid.to_ne_bytes().to_vec(),
            },
        );
    }

    pub fn push_event(&self, event: ServerEvent) {
        self.events.borrow_mut().push_back(event);
    }

    /// Queue a `PropertyNotify`, delivered only if someone selected it.
    pub fn notify_property(&self, window: Window, property: WatchedProperty) {
        if window == ROOT || self.watched.borrow().contains(&window) {
            self.push_event(ServerEvent::PropertyNotify {
                window,
                property: Some(property),
            });
        }
    }

    /// How often `property` was fetched from `window`.
    pub fn reads_of(&self, window: Window, property: WindowProperty) -> usize {
        self.property_reads
            .borrow()
            .iter()
            .filter(|&&read| read == (window, property))
            .count()
    }

    pub fn sent(&self) -> Vec<KeyEvent> {
        self.sent.borrow().clone()
    }

    pub fn is_grabbed(&self, keycode: Keycode, modifiers: u16) -> bool {
        self.grabs.borrow().contains(&(keycode, modifiers))
    }

    fn pop_event(&self) -> NextEvent {
        match self.events.borrow_mut().pop_front() {
            Some(event) => NextEvent::Event(event),
            None => NextEvent::Shutdown(self.shutdown_signal.get()),
        }
    }
}

impl DisplayServer for FakeServer {
    fn root(&self) -> Window {
        ROOT
    }

    fn select_root_events(&self) -> Result<(), ServerError> {
        self.root_selected.set(true);
        Ok(())
    }

    fn keyboard_mapping(&self) -> Result<KeyboardMapping, ServerError> {
        Ok(self.mapping.borrow().clone())
    }

    fn modifier_mapping(&self) -> Result<ModifierMapping, ServerError> {
        Ok(self.modifiers.borrow().clone())
    }

    fn grab_key(&self, keycode: Keycode, modifiers: u16) -> Result<(), ServerError> {
        if self.foreign_grabs.borrow().contains(&(keycode, modifiers)) {
            return Err(ServerError::Protocol(crate::connection::ProtocolError {
                kind: "Access".into(),
                error_code: 10,
                major_opcode: 33,
                minor_opcode: 0,
                bad_value: 0,
                sequence: 0,
                request: Some("GrabKey"),
            }));
        }
        self.grabs.borrow_mut().insert((keycode, modifiers));
        Ok(())
    }

    fn watch_window(&self, window: Window, watch: bool) -> Result<(), ServerError> {
        if watch {
            self.watched.borrow_mut().insert(window);
        } else {
            self.watched.borrow_mut().remove(&window);
        }
        Ok(())
    }

    fn ungrab_key(&self, keycode: Keycode, modifiers: u16) -> Result<(), ServerError> {
        self.grabs.borrow_mut().remove(&(keycode, modifiers));
        Ok(())
    }

    fn ungrab_all_keys(&self) -> Result<(), ServerError> {
        if self.fail_ungrab.get() {
            return Err(ServerError::X11("ungrab_key: connection closed".into()));
        }
        self.ungrab_requests.set(self.ungrab_requests.get() + 1);
        self.grabs.borrow_mut().clear();
        Ok(())
    }

    fn input_focus(&self) -> Result<Window, ServerError> {
        Ok(self.focus.get())
    }

    fn parent(&self, window: Window) -> Result<Option<Window>, ServerError> {
        Ok(self.parents.borrow().get(&window).copied())
    }

    fn property(
        &self,
        window: Window,
        property: WindowProperty,
    ) -> Result<Option<RawProperty>, ServerError> {
        self.property_reads.borrow_mut().push((window, property));
        Ok(self.properties.borrow().get(&(window, property)).cloned())
    }

    fn send_key_event(&self, event: &KeyEvent) -> Result<(), ServerError> {
        self.sent.borrow_mut().push(event.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), ServerError> {
        Ok(())
    }

    fn next_event(&mut self) -> Result<NextEvent, ServerError> {
        Ok(self.pop_event())
    }
}

/// Shared handle, so a test can inspect the fake after handing it over.
impl DisplayServer for Rc<FakeServer> {
    fn root(&self) -> Window {
        (**self).root()
    }

    fn select_root_events(&self) -> Result<(), ServerError> {
        (**self).select_root_events()
    }

    fn keyboard_mapping(&self) -> Result<KeyboardMapping, ServerError> {
        (**self).keyboard_mapping()
    }

    fn modifier_mapping(&self) -> Result<ModifierMapping, ServerError> {
        (**self).modifier_mapping()
    }

    fn grab_key(&self, keycode: Keycode, modifiers: u16) -> Result<(), ServerError> {
        (**self).grab_key(keycode, modifiers)
    }

    fn watch_window(&self, window: Window, watch: bool) -> Result<(), ServerError> {
        (**self).watch_window(window, watch)
    }

    fn ungrab_key(&self, keycode: Keycode, modifiers: u16) -> Result<(), ServerError> {
        (**self).ungrab_key(keycode, modifiers)
    }

    fn ungrab_all_keys(&self) -> Result<(), ServerError> {
        (**self).ungrab_all_keys()
    }

    fn input_focus(&self) -> Result<Window, ServerError> {
        (**self).input_focus()
    }

    fn parent(&self, window: Window) -> Result<Option<Window>, ServerError> {
        (**self).parent(window)
    }

    fn property(
        &self,
        window: Window,
        property: WindowProperty,
    ) -> Result<Option<RawProperty>, ServerError> {
        (**self).property(window, property)
    }

    fn send_key_event(&self, event: &KeyEvent) -> Result<(), ServerError> {
        (**self).send_key_event(event)
    }

    fn flush(&self) -> Result<(), ServerError> {
        (**self).flush()
    }

    fn next_event(&mut self) -> Result<NextEvent, ServerError> {
        Ok(self.pop_event())
    }
}
