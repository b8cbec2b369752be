//! Global key grabs on the root window.
//!
//! Once a key is grabbed, matching keystrokes are delivered to this
//! process instead of the focused application, which is why the
//! dispatcher has to re-inject (or deliberately swallow) every one.
//!
//! The set tracks both the keys asked for and the keys actually
//! registered: a key whose keysym is missing from the current layout
//! stays requested, so a later `MappingNotify` can pick it up.

use std::collections::BTreeSet;

use x11rb::protocol::xproto::Keycode;

use crate::connection::{DisplayServer, ServerError};
use crate::keys::{KeyCodec, KeyError, KeyIdentity, Modifiers};

/// Grab registration errors.
#[derive(Debug, thiserror::Error)]
pub enum GrabError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("{0} is already grabbed by another client")]
    Conflict(String),
    #[error(transparent)]
    Server(#[from] ServerError),
}

#[derive(Debug, Default)]
pub struct GrabSet {
    /// Keys currently registered with the server.
    registered: BTreeSet<KeyIdentity>,
    /// Keys asked for since the last `ungrab_all`.
    requested: BTreeSet<KeyIdentity>,
}

impl GrabSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &KeyIdentity) -> bool {
        self.registered.contains(key)
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyIdentity> {
        self.registered.iter()
    }

    /// Grab `key` on the root window.
    ///
    /// Registers one grab per CapsLock/NumLock combination so the key
    /// fires regardless of lock state, or a single AnyModifier grab for
    /// `Modifiers::ANY`. On a conflict none of the variants stay grabbed.
    pub fn grab(
        &mut self,
        server: &impl DisplayServer,
        codec: &KeyCodec,
        key: KeyIdentity,
    ) -> Result<(), GrabError> {
        self.requested.insert(key);
        let keycode = register(server, codec, &key)?;
        self.registered.insert(key);
        tracing::debug!(%key, keycode, "key grabbed");
        Ok(())
    }

    /// Release every grab this process holds on the root window.
    ///
    /// A no-op, without server traffic, when nothing is grabbed.
    pub fn ungrab_all(&mut self, server: &impl DisplayServer) -> Result<(), GrabError> {
        if self.registered.is_empty() && self.requested.is_empty() {
            return Ok(());
        }
        server.ungrab_all_keys()?;
        server.flush()?;
        self.registered.clear();
        self.requested.clear();
        tracing::debug!("all keys ungrabbed");
        Ok(())
    }

    /// Re-register every requested key, e.g. after the keyboard mapping
    /// changed and old keycodes stopped matching.
    ///
    /// Failures are logged and leave the key requested but unregistered.
    /// Returns the number of keys that could not be grabbed.
    pub fn regrab_all(&mut self, server: &impl DisplayServer, codec: &KeyCodec) -> usize {
        let keys = std::mem::take(&mut self.requested);
        self.registered.clear();
        if let Err(e) = server.ungrab_all_keys() {
            tracing::warn!(error = %e, "ungrab before regrab failed");
        }
        self.grab_each(server, codec, keys)
    }

    /// Make the grabbed set equal `wanted`.
    ///
    /// Does nothing when `wanted` is what was last requested. Returns the
    /// number of keys that could not be grabbed.
    pub fn replace(
        &mut self,
        server: &impl DisplayServer,
        codec: &KeyCodec,
        wanted: BTreeSet<KeyIdentity>,
    ) -> usize {
        if wanted == self.requested {
            return 0;
        }
        if let Err(e) = self.ungrab_all(server) {
            tracing::warn!(error = %e, "ungrab before regrab failed");
        }
        self.grab_each(server, codec, wanted)
    }

    fn grab_each(
        &mut self,
        server: &impl DisplayServer,
        codec: &KeyCodec,
        keys: BTreeSet<KeyIdentity>,
    ) -> usize {
        let mut failed = 0;
        for key in keys {
            if let Err(e) = self.grab(server, codec, key) {
                tracing::warn!(%key, error = %e, "grab failed");
                failed += 1;
            }
        }
        if let Err(e) = server.flush() {
            tracing::warn!(error = %e, "flush after grab failed");
        }
        failed
    }
}

/// Lock-mask combinations: [none, CapsLock, NumLock, both].
fn lock_masks(numlock_mask: u16) -> [u16; 4] {
    [
        0,
        Modifiers::LOCK_BIT,
        numlock_mask,
        Modifiers::LOCK_BIT | numlock_mask,
    ]
}

/// Grab every variant of `key`; returns the keycode it landed on.
fn register(
    server: &impl DisplayServer,
    codec: &KeyCodec,
    key: &KeyIdentity,
) -> Result<Keycode, GrabError> {
    let (keycode, level) = codec.resolve(key)?;
    let masks: Vec<u16> = if key.modifiers.is_any() {
        vec![Modifiers::ANY.bits()]
    } else {
        let base = (key.modifiers | level).bits();
        lock_masks(codec.numlock_mask())
            .iter()
            .map(|lock| base | lock)
            .collect()
    };

    let mut granted = Vec::with_capacity(masks.len());
    let mut conflict = false;
    for mods in masks {
        match server.grab_key(keycode, mods) {
            Ok(()) => granted.push(mods),
            Err(ServerError::Protocol(e)) if e.is_access() => {
                tracing::warn!(
                    %key,
                    modifiers = format_args!("0x{mods:04x}"),
                    "XGrabKey failed, key may be grabbed by another application"
                );
                conflict = true;
            }
            Err(e) => {
                release(server, keycode, &granted);
                return Err(e.into());
            }
        }
    }

    if conflict {
        release(server, keycode, &granted);
        return Err(GrabError::Conflict(key.to_string()));
    }
    Ok(keycode)
}

/// Undo the variants of a key that did get grabbed.
fn release(server: &impl DisplayServer, keycode: Keycode, granted: &[u16]) {
    for &mods in granted {
        if let Err(e) = server.ungrab_key(keycode, mods) {
            tracing::warn!(keycode, error = %e, "ungrab of partial grab failed");
        }
    }
}
