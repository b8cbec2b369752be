//! X11 connection: `x11rb` implementation of [`DisplayServer`].
//!
//! Owns the `RustConnection`, the interned atoms and the asynchronous
//! error hook. Requests whose cookies are dropped unchecked report their
//! errors as events; `next_event` hands those to the hook and keeps
//! waiting instead of surfacing them to the dispatcher.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{
    self, Atom, AtomEnum, ChangeWindowAttributesAux, EventMask, GrabMode, Keycode, Mapping,
    ModMask, Window,
};
use x11rb::rust_connection::RustConnection;

use super::{
    DisplayServer, ErrorHook, KeyboardMapping, MappingKind, ModifierMapping, NextEvent,
    PropertyType, ProtocolError, RawProperty, ServerError, ServerEvent, ShutdownSignal,
    WatchedProperty, WindowProperty, log_protocol_error,
};
use crate::keys::{Direction, KeyEvent};

/// Pre-interned atoms for property queries and event classification.
#[derive(Debug, Clone, Copy)]
struct Atoms {
    net_active_window: Atom,
    net_wm_name: Atom,
    net_wm_pid: Atom,
    utf8_string: Atom,
    compound_text: Atom,
}

impl Atoms {
    fn intern(conn: &RustConnection) -> Result<Self, ServerError> {
        let intern = |name: &[u8]| -> Result<Atom, ServerError> {
            Ok(xproto::intern_atom(conn, false, name)
                .map_err(|e| ServerError::X11(format!("intern_atom: {e}")))?
                .reply()
                .map_err(|e| ServerError::X11(format!("intern_atom reply: {e}")))?
                .atom)
        };

        Ok(Self {
            net_active_window: intern(b"_NET_ACTIVE_WINDOW")?,
            net_wm_name: intern(b"_NET_WM_NAME")?,
            net_wm_pid: intern(b"_NET_WM_PID")?,
            utf8_string: intern(b"UTF8_STRING")?,
            compound_text: intern(b"COMPOUND_TEXT")?,
        })
    }

    fn property_atom(&self, property: WindowProperty) -> Atom {
        match property {
            WindowProperty::Class => AtomEnum::WM_CLASS.into(),
            WindowProperty::Name => self.net_wm_name,
            WindowProperty::LegacyName => AtomEnum::WM_NAME.into(),
            WindowProperty::Pid => self.net_wm_pid,
        }
    }

    fn property_type(&self, atom: Atom) -> PropertyType {
        if atom == u32::from(AtomEnum::STRING) {
            PropertyType::String
        } else if atom == u32::from(AtomEnum::CARDINAL) {
            PropertyType::Cardinal
        } else if atom == self.utf8_string {
            PropertyType::Utf8
        } else if atom == self.compound_text {
            PropertyType::CompoundText
        } else {
            PropertyType::Other(atom)
        }
    }

    fn watched(&self, atom: Atom) -> Option<WatchedProperty> {
        if atom == self.net_active_window {
            Some(WatchedProperty::ActiveWindow)
        } else if atom == u32::from(AtomEnum::WM_CLASS) {
            Some(WatchedProperty::Class)
        } else if atom == self.net_wm_name || atom == u32::from(AtomEnum::WM_NAME) {
            Some(WatchedProperty::Name)
        } else if atom == self.net_wm_pid {
            Some(WatchedProperty::Pid)
        } else {
            None
        }
    }

    /// Translate an x11rb event. Protocol errors are handled before this.
    fn convert(&self, event: &Event) -> ServerEvent {
        match event {
            Event::KeyPress(e) => ServerEvent::Key {
                direction: Direction::Press,
                keycode: e.detail,
                state: u16::from(e.state),
                window: e.event,
            },
            Event::KeyRelease(e) => ServerEvent::Key {
                direction: Direction::Release,
                keycode: e.detail,
                state: u16::from(e.state),
                window: e.event,
            },
            Event::PropertyNotify(e) => ServerEvent::PropertyNotify {
                window: e.window,
                property: self.watched(e.atom),
            },
            Event::MappingNotify(e) => ServerEvent::MappingNotify {
                kind: match e.request {
                    Mapping::MODIFIER => MappingKind::Modifier,
                    Mapping::KEYBOARD => MappingKind::Keyboard,
                    _ => MappingKind::Pointer,
                },
            },
            other => ServerEvent::Other {
                code: other.raw_response_type() & 0x7f,
            },
        }
    }
}

/// The single display connection of the process.
///
/// Closing happens exactly once: either through [`X11Connection::close`],
/// which consumes the handle, or when it is dropped on an error path.
pub struct X11Connection {
    conn: RustConnection,
    screen_num: usize,
    root: Window,
    atoms: Atoms,
    on_error: ErrorHook,
    shutdown: Option<ShutdownSignal>,
}

impl X11Connection {
    /// Connect to the display (`None` → `$DISPLAY`) and intern atoms.
    ///
    /// Installs the default error hook, which logs protocol errors and
    /// keeps the connection usable.
    pub fn open(display: Option<&str>) -> Result<Self, ServerError> {
        let (conn, screen_num) =
            RustConnection::connect(display).map_err(|e| ServerError::Connect(e.to_string()))?;

        let root = conn.setup().roots[screen_num].root;
        let atoms = Atoms::intern(&conn)?;

        Ok(Self {
            conn,
            screen_num,
            root,
            atoms,
            on_error: Box::new(log_protocol_error),
            shutdown: None,
        })
    }

    /// Replace the asynchronous error hook.
    pub fn set_error_hook(&mut self, hook: ErrorHook) {
        self.on_error = hook;
    }

    /// Make `next_event` return [`NextEvent::Shutdown`] on SIGINT,
    /// SIGTERM or SIGHUP.
    pub fn watch_shutdown(&mut self, signal: ShutdownSignal) {
        self.shutdown = Some(signal);
    }

    pub fn screen_num(&self) -> usize {
        self.screen_num
    }

    /// Flush and release the connection.
    pub fn close(self) {
        drop(self);
    }

    /// Block until the X socket is readable or a shutdown signal arrives.
    ///
    /// No timeout: an idle remapper stays parked here.
    fn wait(&mut self) -> Result<Option<i32>, ServerError> {
        let raw_fd = self.conn.stream().as_raw_fd();

        loop {
            // SAFETY: raw_fd is the X11 connection fd, valid while conn is alive.
            let x_fd = unsafe { BorrowedFd::borrow_raw(raw_fd) };
            let mut fds = vec![PollFd::new(x_fd, PollFlags::POLLIN)];
            if let Some(signal) = &self.shutdown {
                fds.push(PollFd::new(signal.as_fd(), PollFlags::POLLIN));
            }

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {
                    let signalled = fds
                        .get(1)
                        .and_then(PollFd::revents)
                        .is_some_and(|r| r.contains(PollFlags::POLLIN));
                    drop(fds);
                    if signalled
                        && let Some(signal) = self.shutdown.as_mut()
                        && let Some(signo) = signal.pending()?
                    {
                        return Ok(Some(signo));
                    }
                    return Ok(None);
                }
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(ServerError::X11(format!("poll on X11 fd: {e}"))),
            }
        }
    }
}

impl Drop for X11Connection {
    fn drop(&mut self) {
        if let Err(e) = self.conn.flush() {
            tracing::debug!(error = %e, "flush on close failed");
        }
        tracing::debug!("display connection closed");
    }
}

/// Map a checked-request failure, keeping protocol errors inspectable.
fn reply_error(context: &str, e: ReplyError) -> ServerError {
    match e {
        ReplyError::X11Error(x) => ServerError::Protocol(ProtocolError::from(&x)),
        ReplyError::ConnectionError(c) => ServerError::X11(format!("{context}: {c}")),
    }
}

impl DisplayServer for X11Connection {
    fn root(&self) -> Window {
        self.root
    }

    fn select_root_events(&self) -> Result<(), ServerError> {
        let aux = ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE);
        xproto::change_window_attributes(&self.conn, self.root, &aux)
            .map_err(|e| ServerError::X11(format!("change_window_attributes: {e}")))?
            .check()
            .map_err(|e| reply_error("change_window_attributes", e))
    }

    fn watch_window(&self, window: Window, watch: bool) -> Result<(), ServerError> {
        let mask = if watch {
            EventMask::PROPERTY_CHANGE
        } else {
            EventMask::NO_EVENT
        };
        let aux = ChangeWindowAttributesAux::new().event_mask(mask);
        xproto::change_window_attributes(&self.conn, window, &aux)
            .map_err(|e| ServerError::X11(format!("change_window_attributes: {e}")))?;
        Ok(())
    }

    fn keyboard_mapping(&self) -> Result<KeyboardMapping, ServerError> {
        let setup = self.conn.setup();
        let min_keycode = setup.min_keycode;
        let count = setup.max_keycode - min_keycode + 1;

        let reply = xproto::get_keyboard_mapping(&self.conn, min_keycode, count)
            .map_err(|e| ServerError::X11(format!("get_keyboard_mapping: {e}")))?
            .reply()
            .map_err(|e| reply_error("get_keyboard_mapping", e))?;

        Ok(KeyboardMapping {
            min_keycode,
            keysyms_per_keycode: reply.keysyms_per_keycode,
            keysyms: reply.keysyms,
        })
    }

    fn modifier_mapping(&self) -> Result<ModifierMapping, ServerError> {
        let reply = xproto::get_modifier_mapping(&self.conn)
            .map_err(|e| ServerError::X11(format!("get_modifier_mapping: {e}")))?
            .reply()
            .map_err(|e| reply_error("get_modifier_mapping", e))?;

        Ok(ModifierMapping {
            keycodes_per_modifier: reply.keycodes_per_modifier(),
            keycodes: reply.keycodes,
        })
    }

    fn grab_key(&self, keycode: Keycode, modifiers: u16) -> Result<(), ServerError> {
        xproto::grab_key(
            &self.conn,
            true, // owner_events
            self.root,
            ModMask::from(modifiers),
            keycode,
            GrabMode::ASYNC,
            GrabMode::ASYNC,
        )
        .map_err(|e| ServerError::X11(format!("grab_key send: {e}")))?
        .check()
        .map_err(|e| reply_error("grab_key", e))
    }

    fn ungrab_key(&self, keycode: Keycode, modifiers: u16) -> Result<(), ServerError> {
        xproto::ungrab_key(&self.conn, keycode, self.root, ModMask::from(modifiers))
            .map_err(|e| ServerError::X11(format!("ungrab_key: {e}")))?;
        Ok(())
    }

    fn ungrab_all_keys(&self) -> Result<(), ServerError> {
        xproto::ungrab_key(&self.conn, xproto::Grab::ANY, self.root, ModMask::ANY)
            .map_err(|e| ServerError::X11(format!("ungrab_key: {e}")))?;
        Ok(())
    }

    fn input_focus(&self) -> Result<Window, ServerError> {
        Ok(xproto::get_input_focus(&self.conn)
            .map_err(|e| ServerError::X11(format!("get_input_focus: {e}")))?
            .reply()
            .map_err(|e| reply_error("get_input_focus", e))?
            .focus)
    }

    fn parent(&self, window: Window) -> Result<Option<Window>, ServerError> {
        let reply = xproto::query_tree(&self.conn, window)
            .map_err(|e| ServerError::X11(format!("query_tree: {e}")))?
            .reply()
            .map_err(|e| reply_error("query_tree", e))?;

        Ok((reply.parent != x11rb::NONE).then_some(reply.parent))
    }

    fn property(
        &self,
        window: Window,
        property: WindowProperty,
    ) -> Result<Option<RawProperty>, ServerError> {
        let reply = xproto::get_property(
            &self.conn,
            false,
            window,
            self.atoms.property_atom(property),
            AtomEnum::ANY,
            0,
            u32::MAX,
        )
        .map_err(|e| ServerError::X11(format!("get_property {property:?}: {e}")))?
        .reply()
        .map_err(|e| reply_error("get_property", e))?;

        // type None: the property does not exist on this window.
        if reply.type_ == x11rb::NONE {
            return Ok(None);
        }

        Ok(Some(RawProperty {
            type_: self.atoms.property_type(reply.type_),
            format: reply.format,
            value: reply.value,
        }))
    }

    fn send_key_event(&self, event: &KeyEvent) -> Result<(), ServerError> {
        let mask = match event.direction {
            Direction::Press => EventMask::KEY_PRESS,
            Direction::Release => EventMask::KEY_RELEASE,
        };
        // Unchecked: a stale target window surfaces through the error hook.
        xproto::send_event(&self.conn, true, event.window, mask, event.to_x11())
            .map_err(|e| ServerError::X11(format!("send_event: {e}")))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), ServerError> {
        self.conn
            .flush()
            .map_err(|e| ServerError::X11(format!("flush: {e}")))
    }

    fn next_event(&mut self) -> Result<NextEvent, ServerError> {
        loop {
            if let Some(signal) = self.shutdown.as_mut()
                && let Some(signo) = signal.pending()?
            {
                return Ok(NextEvent::Shutdown(signo));
            }

            let event = self
                .conn
                .poll_for_event()
                .map_err(|e| ServerError::X11(format!("X11 connection error: {e}")))?;

            match event {
                Some(Event::Error(e)) => (self.on_error)(&ProtocolError::from(&e)),
                Some(event) => return Ok(NextEvent::Event(self.atoms.convert(&event))),
                None => {
                    self.flush()?;
                    if let Some(signo) = self.wait()? {
                        return Ok(NextEvent::Shutdown(signo));
                    }
                }
            }
        }
    }
}
