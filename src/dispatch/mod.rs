//! Event dispatcher: the single-threaded loop that owns the connection.
//!
//! Each event is handled to completion before the next read. The keymap
//! cache and grab set live here and are rebuilt in place when the server
//! reports a mapping change, so nothing is ever decoded against a stale
//! layout.

use x11rb::protocol::xproto::Window;

use crate::connection::{DisplayServer, MappingKind, NextEvent, ServerError, ServerEvent};
use crate::grab::GrabSet;
use crate::keys::{Direction, KeyCodec};
use crate::remap::{self, Config, ReleasePolicy, RemapDecision, RemapHandler};
use crate::window::{self, WindowInfo};

/// Per-run dispatch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub release: ReleasePolicy,
    /// Fall back to `WM_NAME` for window titles.
    pub name_fallback: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            release: ReleasePolicy::Ignore,
            name_fallback: true,
        }
    }
}

impl From<&Config> for DispatchPolicy {
    fn from(config: &Config) -> Self {
        Self {
            release: config.key_release,
            name_fallback: config.window_name_fallback,
        }
    }
}

pub struct Dispatcher<S: DisplayServer, H: RemapHandler> {
    server: S,
    handler: H,
    codec: KeyCodec,
    grabs: GrabSet,
    policy: DispatchPolicy,
    /// Client window whose property changes are selected.
    watched: Option<Window>,
}

impl<S: DisplayServer, H: RemapHandler> Dispatcher<S, H> {
    /// Take ownership of the connection and load the keymap.
    pub fn new(server: S, handler: H, policy: DispatchPolicy) -> Result<Self, ServerError> {
        let codec = KeyCodec::load(&server)?;
        Ok(Self {
            server,
            handler,
            codec,
            grabs: GrabSet::new(),
            policy,
            watched: None,
        })
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn grabs(&self) -> &GrabSet {
        &self.grabs
    }

    /// Subscribe to root and focused client property changes, and grab
    /// the keys the handler wants for the currently focused window.
    pub fn start(&mut self) -> Result<(), ServerError> {
        self.server.select_root_events()?;
        let info = window::current(&self.server, self.policy.name_fallback);
        self.follow_client(info.client);
        self.reconcile_grabs(&info);
        self.server.flush()?;
        tracing::info!(grabs = self.grabs.len(), "remapper started");
        Ok(())
    }

    /// Process events until a termination signal arrives.
    ///
    /// Returns the signal number. A connection failure ends the loop
    /// with an error; cleanup runs either way when `self` is dropped.
    pub fn run(&mut self) -> Result<i32, ServerError> {
        loop {
            match self.server.next_event()? {
                NextEvent::Event(event) => self.dispatch(event),
                NextEvent::Shutdown(signal) => {
                    tracing::info!(signal, "shutting down");
                    return Ok(signal);
                }
            }
        }
    }

    /// Handle one event to completion.
    pub fn dispatch(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Key {
                direction,
                keycode,
                state,
                ..
            } => self.on_key(direction, keycode, state),
            ServerEvent::PropertyNotify {
                window,
                property: Some(property),
            } => {
                tracing::debug!(window, ?property, "watched property changed");
                self.on_window_change();
            }
            ServerEvent::PropertyNotify {
                property: None, ..
            } => {}
            ServerEvent::MappingNotify {
                kind: MappingKind::Pointer,
            } => tracing::debug!("pointer mapping changed, ignored"),
            ServerEvent::MappingNotify { kind } => self.on_mapping_change(kind),
            ServerEvent::Other { code } => tracing::debug!(code, "unhandled event"),
        }
    }

    fn on_key(&mut self, direction: Direction, keycode: u8, state: u16) {
        if direction == Direction::Release && self.policy.release == ReleasePolicy::Ignore {
            tracing::trace!(keycode, "key release ignored");
            return;
        }

        let Some(key) = self.codec.decode(keycode, state) else {
            tracing::debug!(keycode, "keycode has no keysym");
            return;
        };
        // A grab on a shifted keysym (`C-exclam`) arrives as C-Shift-1.
        let key = match self.codec.decode_shifted(keycode, state) {
            Some(shifted) if self.grabs.contains(&shifted) && !self.grabs.contains(&key) => {
                shifted
            }
            _ => key,
        };

        let info = window::current(&self.server, self.policy.name_fallback);
        tracing::debug!(
            %key,
            %direction,
            class = info.class.as_deref().unwrap_or(""),
            "key event"
        );

        let handler = &mut self.handler;
        let decision = match remap::contain(|| handler.handle_key(&key, direction, &info)) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(%key, error = %e, "key handling failed");
                return;
            }
        };

        self.inject(info.window, decision);
    }

    fn inject(&self, target: Option<Window>, decision: RemapDecision) {
        if decision.is_empty() {
            return;
        }
        let Some(target) = target else {
            tracing::warn!("no focused window, dropping remapped keys");
            return;
        };

        for action in &decision.actions {
            if let Err(e) = self
                .codec
                .synthesize(&self.server, target, &action.key, action.direction)
            {
                tracing::warn!(key = %action.key, error = %e, "key synthesis failed");
            }
        }
        if let Err(e) = self.server.flush() {
            tracing::warn!(error = %e, "flush failed");
        }
    }

    fn on_window_change(&mut self) {
        let info = window::current(&self.server, self.policy.name_fallback);
        self.follow_client(info.client);

        let handler = &mut self.handler;
        if let Err(e) = remap::contain(|| handler.handle_property_change(&info)) {
            tracing::warn!(error = %e, "window change handling failed");
        }
        self.reconcile_grabs(&info);
    }

    fn on_mapping_change(&mut self, kind: MappingKind) {
        tracing::info!(?kind, "keyboard mapping changed");

        if let Err(e) = self.codec.refresh(&self.server) {
            tracing::warn!(error = %e, "keymap refresh failed, keeping previous keymap");
        }
        let failed = self.grabs.regrab_all(&self.server, &self.codec);
        if failed > 0 {
            tracing::warn!(failed, "some keys could not be re-grabbed");
        }

        let handler = &mut self.handler;
        if let Err(e) = remap::contain(|| handler.handle_mapping_change()) {
            tracing::warn!(error = %e, "mapping change handling failed");
        }
    }

    /// Move the `PropertyChange` selection to `client`, so its class and
    /// title changes arrive as events.
    fn follow_client(&mut self, client: Option<Window>) {
        if client == self.watched {
            return;
        }
        if let Some(old) = self.watched.take()
            && let Err(e) = self.server.watch_window(old, false)
        {
            tracing::debug!(window = old, error = %e, "unwatch failed");
        }
        if let Some(new) = client {
            match self.server.watch_window(new, true) {
                Ok(()) => self.watched = Some(new),
                Err(e) => tracing::warn!(window = new, error = %e, "watch failed"),
            }
        }
    }

    /// Make the grab set match what the handler wants for `info`.
    fn reconcile_grabs(&mut self, info: &WindowInfo) {
        let handler = &self.handler;
        let wanted = match remap::contain(|| Ok(handler.grabs_for(info))) {
            Ok(wanted) => wanted,
            Err(e) => {
                tracing::warn!(error = %e, "grab set query failed");
                return;
            }
        };

        let failed = self.grabs.replace(&self.server, &self.codec, wanted);
        if failed > 0 {
            tracing::warn!(failed, "some keys could not be grabbed");
        }
    }
}

impl<S: DisplayServer, H: RemapHandler> Drop for Dispatcher<S, H> {
    fn drop(&mut self) {
        if let Err(e) = self.grabs.ungrab_all(&self.server) {
            tracing::warn!(error = %e, "ungrab on shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::rc::Rc;

    use super::*;
    use crate::connection::{WatchedProperty, WindowProperty};
    use crate::keys::{KeyIdentity, Modifiers, expression};
    use crate::remap::{KeyAction, RemapError, RuleHandler};
    use crate::testing::{FakeServer, KC_B, KC_LEFT, KC_ONE, ROOT};

    const APP: Window = 0x0140_0001;
    const OTHER: Window = 0x0160_0001;
    const CONTROL: u16 = Modifiers::CONTROL.bits();

    fn rules(toml: &str) -> (RuleHandler, DispatchPolicy) {
        let config = Config::parse(toml).unwrap();
        (
            RuleHandler::from_config(&config).unwrap(),
            DispatchPolicy::from(&config),
        )
    }

    fn terminal_server() -> Rc<FakeServer> {
        let server = Rc::new(FakeServer::new());
        server.focus.set(APP);
        server.set_class(APP, "terminal", "Terminal");
        server
    }

    fn press(keycode: u8, state: u16) -> ServerEvent {
        ServerEvent::Key {
            direction: Direction::Press,
            keycode,
            state,
            window: ROOT,
        }
    }

    fn release(keycode: u8, state: u16) -> ServerEvent {
        ServerEvent::Key {
            direction: Direction::Release,
            keycode,
            state,
            window: ROOT,
        }
    }

    const C_B_TO_LEFT: &str = "[[remap]]\nfrom = \"C-b\"\nto = \"Left\"\n";

    #[derive(Default)]
    struct Recorder {
        wanted: BTreeSet<KeyIdentity>,
        keys: Vec<(KeyIdentity, Direction)>,
        windows: Vec<WindowInfo>,
        mapping_changes: usize,
        fail: bool,
        panic: bool,
        reply: RemapDecision,
    }

    impl RemapHandler for Recorder {
        fn grabs_for(&self, _: &WindowInfo) -> BTreeSet<KeyIdentity> {
            self.wanted.clone()
        }

        fn handle_key(
            &mut self,
            key: &KeyIdentity,
            direction: Direction,
            _: &WindowInfo,
        ) -> Result<RemapDecision, RemapError> {
            self.keys.push((*key, direction));
            if self.panic {
                panic!("handler blew up");
            }
            if self.fail {
                return Err(RemapError::Handler("rule failed".into()));
            }
            Ok(self.reply.clone())
        }

        fn handle_property_change(&mut self, window: &WindowInfo) -> Result<(), RemapError> {
            self.windows.push(window.clone());
            Ok(())
        }

        fn handle_mapping_change(&mut self) -> Result<(), RemapError> {
            self.mapping_changes += 1;
            Ok(())
        }
    }

    #[test]
    fn start_selects_root_and_grabs() {
        let server = terminal_server();
        let (handler, policy) = rules(C_B_TO_LEFT);
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
        dispatcher.start().unwrap();

        assert!(server.root_selected.get());
        assert!(server.is_grabbed(KC_B, CONTROL));
        assert!(dispatcher.grabs().contains(&expression::parse("C-b").unwrap()));
    }

    #[test]
    fn ctrl_b_in_terminal_sends_left() {
        let server = terminal_server();
        let (handler, policy) = rules(
            "[[window]]\nclass_only = \"Terminal\"\n[[window.remap]]\nfrom = \"C-b\"\nto = \"Left\"\n",
        );
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
        dispatcher.start().unwrap();

        server.push_event(press(KC_B, CONTROL));
        assert_eq!(dispatcher.run().unwrap(), 15);

        let sent = server.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].direction, Direction::Press);
        assert_eq!(sent[1].direction, Direction::Release);
        for event in &sent {
            assert_eq!(event.keycode, KC_LEFT);
            assert_eq!(event.state, 0);
            assert_eq!(event.window, APP);
            assert_eq!(event.root, ROOT);
        }
    }

    #[test]
    fn grabs_survive_mapping_change() {
        let server = terminal_server();
        let (handler, policy) = rules(C_B_TO_LEFT);
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
        dispatcher.start().unwrap();

        // "b" moves from keycode 9 to 12.
        {
            let mut mapping = server.mapping.borrow_mut();
            mapping.keysyms[2] = 0x79;
            mapping.keysyms[3] = 0x59;
            mapping.keysyms[8] = 0x62;
        }
        server.push_event(ServerEvent::MappingNotify {
            kind: MappingKind::Keyboard,
        });
        server.push_event(press(12, CONTROL));
        dispatcher.run().unwrap();

        assert!(server.is_grabbed(12, CONTROL));
        assert!(!server.is_grabbed(KC_B, CONTROL));
        let sent = server.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.keycode == KC_LEFT));
    }

    #[test]
    fn any_modifier_rule_fires_under_every_state() {
        let server = terminal_server();
        let (handler, policy) = rules("[[remap]]\nfrom = \"Any-b\"\nto = \"Left\"\n");
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
        dispatcher.start().unwrap();
        assert!(server.is_grabbed(KC_B, Modifiers::ANY.bits()));

        server.push_event(press(KC_B, CONTROL));
        server.push_event(press(KC_B, 0));
        dispatcher.run().unwrap();

        let sent: Vec<_> = server
            .sent()
            .iter()
            .map(|e| (e.keycode, e.state, e.direction))
            .collect();
        assert_eq!(
            sent,
            vec![
                (KC_LEFT, 0, Direction::Press),
                (KC_LEFT, 0, Direction::Release),
                (KC_LEFT, 0, Direction::Press),
                (KC_LEFT, 0, Direction::Release),
            ]
        );
    }

    #[test]
    fn shifted_keysym_rule_fires() {
        let server = terminal_server();
        let (handler, policy) = rules("[[remap]]\nfrom = \"C-exclam\"\nto = \"Left\"\n");
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
        dispatcher.start().unwrap();

        let shift = Modifiers::SHIFT.bits();
        assert!(server.is_grabbed(KC_ONE, CONTROL | shift));

        dispatcher.dispatch(press(KC_ONE, CONTROL | shift));
        let sent = server.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.keycode == KC_LEFT && e.state == 0));
    }

    #[test]
    fn title_change_on_client_regrabs() {
        let server = terminal_server();
        server.set_utf8(APP, WindowProperty::Name, "Inbox");
        let (handler, policy) = rules(
            "[[window]]\nname = \"^Gmail\"\n[[window.remap]]\nfrom = \"C-b\"\nto = \"Left\"\n",
        );
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
        dispatcher.start().unwrap();
        assert!(server.watched.borrow().contains(&APP));
        assert!(dispatcher.grabs().is_empty());

        // Tab switch: same window, new title.
        server.set_utf8(APP, WindowProperty::Name, "Gmail - Inbox");
        server.notify_property(APP, WatchedProperty::Name);
        server.push_event(press(KC_B, CONTROL));
        dispatcher.run().unwrap();

        assert!(server.is_grabbed(KC_B, CONTROL));
        let sent = server.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.keycode == KC_LEFT));
    }

    #[test]
    fn focus_change_moves_the_watch() {
        let server = terminal_server();
        let mut dispatcher =
            Dispatcher::new(Rc::clone(&server), Recorder::default(), DispatchPolicy::default())
                .unwrap();
        dispatcher.start().unwrap();

        server.set_class(OTHER, "firefox", "Firefox");
        server.focus.set(OTHER);
        server.notify_property(ROOT, WatchedProperty::ActiveWindow);
        dispatcher.run().unwrap();

        let watched = server.watched.borrow();
        assert!(watched.contains(&OTHER));
        assert!(!watched.contains(&APP));
    }

    #[test]
    fn pointer_mapping_change_is_ignored() {
        let server = terminal_server();
        let mut dispatcher =
            Dispatcher::new(Rc::clone(&server), Recorder::default(), DispatchPolicy::default())
                .unwrap();
        dispatcher.dispatch(ServerEvent::MappingNotify {
            kind: MappingKind::Pointer,
        });
        assert_eq!(dispatcher.handler().mapping_changes, 0);

        dispatcher.dispatch(ServerEvent::MappingNotify {
            kind: MappingKind::Modifier,
        });
        assert_eq!(dispatcher.handler().mapping_changes, 1);
    }

    #[test]
    fn property_change_sees_fresh_window() {
        let server = terminal_server();
        let c_b = expression::parse("C-b").unwrap();
        let handler = Recorder {
            wanted: [c_b].into(),
            ..Recorder::default()
        };
        let mut dispatcher =
            Dispatcher::new(Rc::clone(&server), handler, DispatchPolicy::default()).unwrap();
        dispatcher.start().unwrap();

        server.set_class(APP, "browser", "Browser");
        server.set_utf8(APP, WindowProperty::Name, "News");
        server.push_event(ServerEvent::PropertyNotify {
            window: ROOT,
            property: Some(WatchedProperty::ActiveWindow),
        });
        server.push_event(ServerEvent::PropertyNotify {
            window: ROOT,
            property: None,
        });
        dispatcher.run().unwrap();

        let windows = &dispatcher.handler().windows;
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].class.as_deref(), Some("Browser"));
        assert_eq!(windows[0].name.as_deref(), Some("News"));
        assert!(server.sent().is_empty());
    }

    #[test]
    fn window_change_reconciles_grabs() {
        let server = terminal_server();
        let (handler, policy) = rules(
            "[[window]]\nclass_only = \"Terminal\"\n[[window.remap]]\nfrom = \"C-b\"\nto = \"Left\"\n",
        );
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
        dispatcher.start().unwrap();
        assert!(server.is_grabbed(KC_B, CONTROL));

        server.set_class(APP, "browser", "Browser");
        dispatcher.dispatch(ServerEvent::PropertyNotify {
            window: ROOT,
            property: Some(WatchedProperty::ActiveWindow),
        });
        assert!(!server.is_grabbed(KC_B, CONTROL));
        assert!(dispatcher.grabs().is_empty());
    }

    #[test]
    fn releases_ignored_by_default() {
        let server = terminal_server();
        let mut dispatcher =
            Dispatcher::new(Rc::clone(&server), Recorder::default(), DispatchPolicy::default())
                .unwrap();
        dispatcher.dispatch(release(KC_B, CONTROL));
        assert!(dispatcher.handler().keys.is_empty());
        assert!(server.sent().is_empty());
    }

    #[test]
    fn press_release_round_trip_when_forwarding() {
        let server = terminal_server();
        let (handler, policy) = rules("key_release = \"forward\"");
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();

        dispatcher.dispatch(press(KC_B, CONTROL));
        dispatcher.dispatch(release(KC_B, CONTROL));

        let sent = server.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            (sent[0].direction, sent[0].keycode, sent[0].state),
            (Direction::Press, KC_B, CONTROL)
        );
        assert_eq!(
            (sent[1].direction, sent[1].keycode, sent[1].state),
            (Direction::Release, KC_B, CONTROL)
        );
    }

    #[test]
    fn handler_failures_are_contained() {
        let server = terminal_server();
        let left = KeyIdentity::new(0xff51, Modifiers::NONE);
        let handler = Recorder {
            fail: true,
            reply: RemapDecision::tap(left),
            ..Recorder::default()
        };
        let mut dispatcher =
            Dispatcher::new(Rc::clone(&server), handler, DispatchPolicy::default()).unwrap();

        server.push_event(press(KC_B, CONTROL));
        server.push_event(press(KC_B, CONTROL));
        assert_eq!(dispatcher.run().unwrap(), 15);
        assert_eq!(dispatcher.handler().keys.len(), 2);
        assert!(server.sent().is_empty());
    }

    #[test]
    fn handler_panics_are_contained() {
        let server = terminal_server();
        let handler = Recorder {
            panic: true,
            ..Recorder::default()
        };
        let mut dispatcher =
            Dispatcher::new(Rc::clone(&server), handler, DispatchPolicy::default()).unwrap();

        server.push_event(press(KC_B, CONTROL));
        server.push_event(ServerEvent::Other { code: 12 });
        assert_eq!(dispatcher.run().unwrap(), 15);
        assert!(server.sent().is_empty());
    }

    #[test]
    fn no_focus_drops_output() {
        let server = Rc::new(FakeServer::new());
        let (handler, policy) = rules(C_B_TO_LEFT);
        let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
        dispatcher.dispatch(press(KC_B, CONTROL));
        assert!(server.sent().is_empty());
    }

    #[test]
    fn unknown_output_key_is_skipped() {
        let server = terminal_server();
        let f5 = expression::parse("F5").unwrap();
        let left = KeyIdentity::new(0xff51, Modifiers::NONE);
        let handler = Recorder {
            reply: RemapDecision {
                actions: vec![KeyAction::press(f5), KeyAction::press(left)],
            },
            ..Recorder::default()
        };
        let mut dispatcher =
            Dispatcher::new(Rc::clone(&server), handler, DispatchPolicy::default()).unwrap();
        dispatcher.dispatch(press(KC_B, CONTROL));

        let sent = server.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].keycode, KC_LEFT);
    }

    #[test]
    fn drop_releases_grabs() {
        let server = terminal_server();
        let (handler, policy) = rules(C_B_TO_LEFT);
        {
            let mut dispatcher = Dispatcher::new(Rc::clone(&server), handler, policy).unwrap();
            dispatcher.start().unwrap();
            assert!(!server.grabs.borrow().is_empty());
        }
        assert!(server.grabs.borrow().is_empty());
        assert_eq!(server.ungrab_requests.get(), 1);
    }
}
