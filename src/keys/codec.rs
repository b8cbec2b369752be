//! Keymap cache: keysym ↔ keycode resolution and key event synthesis.
//!
//! The cache is a snapshot of the server's keyboard and modifier maps.
//! It stays valid until a `MappingNotify`, at which point the dispatcher
//! calls [`KeyCodec::refresh`] before decoding anything else.

use std::collections::HashMap;

use x11rb::protocol::xproto::{Keycode, Keysym, Window};

use super::keysym::XK_NUM_LOCK;
use super::{Direction, KeyError, KeyEvent, KeyIdentity, Modifiers};
use crate::connection::{DisplayServer, KeyboardMapping, ModifierMapping, ServerError};

/// Mod2, the usual NumLock bit; used when detection fails.
const NUMLOCK_FALLBACK: u16 = 0x0010;

#[derive(Debug, Clone, Default)]
pub struct KeyCodec {
    mapping: KeyboardMapping,
    /// keysym → lowest keycode producing it, and the column it sits in.
    keycodes: HashMap<Keysym, (Keycode, usize)>,
    numlock_mask: u16,
}

impl KeyCodec {
    /// Build the cache from the server's current maps.
    pub fn load(server: &impl DisplayServer) -> Result<Self, ServerError> {
        let mut codec = Self::default();
        codec.refresh(server)?;
        Ok(codec)
    }

    /// Build the cache from explicit maps.
    pub fn from_mappings(mapping: KeyboardMapping, modifiers: &ModifierMapping) -> Self {
        let mut keycodes = HashMap::new();
        for (keycode, syms) in mapping.iter() {
            for (column, &sym) in syms.iter().enumerate() {
                if sym != 0 {
                    keycodes.entry(sym).or_insert((keycode, column));
                }
            }
        }
        let numlock_mask = detect_numlock_mask(&mapping, modifiers);

        Self {
            mapping,
            keycodes,
            numlock_mask,
        }
    }

    /// Re-fetch the keyboard and modifier maps.
    ///
    /// A modifier map failure only loses NumLock detection; a keyboard
    /// map failure leaves the previous cache in place and is returned.
    pub fn refresh(&mut self, server: &impl DisplayServer) -> Result<(), ServerError> {
        let mapping = server.keyboard_mapping()?;
        let modifiers = server.modifier_mapping().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "modifier mapping unavailable, assuming NumLock on Mod2");
            ModifierMapping::default()
        });
        *self = Self::from_mappings(mapping, &modifiers);
        tracing::debug!(
            keysyms = self.keycodes.len(),
            numlock_mask = format_args!("0x{:04x}", self.numlock_mask),
            "keymap loaded"
        );
        Ok(())
    }

    /// Dynamically detected NumLock modifier bit.
    pub fn numlock_mask(&self) -> u16 {
        self.numlock_mask
    }

    /// Keycode for `key`'s keysym on the current layout.
    pub fn resolve_keycode(&self, key: &KeyIdentity) -> Result<Keycode, KeyError> {
        self.resolve(key).map(|(keycode, _)| keycode)
    }

    /// Keycode for `key` plus the modifiers its keysym needs on top of
    /// `key.modifiers`: Shift when it is only reachable in the shifted
    /// column (`exclam` on the `1` key).
    pub fn resolve(&self, key: &KeyIdentity) -> Result<(Keycode, Modifiers), KeyError> {
        let &(keycode, column) = self
            .keycodes
            .get(&key.keysym)
            .ok_or_else(|| KeyError::Unknown(key.to_string()))?;
        let level = if column == 1 {
            Modifiers::SHIFT
        } else {
            Modifiers::NONE
        };
        Ok((keycode, level))
    }

    /// Decode a hardware key event into a key identity.
    ///
    /// Uses the first non-empty keysym column (the unshifted symbol) and
    /// drops lock and pointer-button bits from the state. `None` if the
    /// keycode carries no symbol.
    pub fn decode(&self, keycode: Keycode, state: u16) -> Option<KeyIdentity> {
        let keysym = self
            .mapping
            .keysyms_for(keycode)
            .iter()
            .copied()
            .find(|&sym| sym != 0)?;
        Some(KeyIdentity::new(
            keysym,
            Modifiers::from_event_state(state, self.numlock_mask),
        ))
    }

    /// Decode with the shifted column, for events with Shift held.
    ///
    /// Returns the shifted keysym with Shift removed from the modifiers,
    /// e.g. `C-exclam` for Control+Shift+1. `None` without Shift or when
    /// the keycode has no distinct shifted symbol.
    pub fn decode_shifted(&self, keycode: Keycode, state: u16) -> Option<KeyIdentity> {
        let modifiers = Modifiers::from_event_state(state, self.numlock_mask);
        if !modifiers.contains(Modifiers::SHIFT) {
            return None;
        }

        let syms = self.mapping.keysyms_for(keycode);
        let base = syms.iter().copied().find(|&sym| sym != 0)?;
        let shifted = syms.get(1).copied().filter(|&sym| sym != 0 && sym != base)?;
        Some(KeyIdentity::new(
            shifted,
            Modifiers::from_bits(modifiers.bits() & !Modifiers::SHIFT.bits()),
        ))
    }

    /// Build the synthetic event record for `key` aimed at `window`.
    pub fn key_event(
        &self,
        root: Window,
        window: Window,
        key: &KeyIdentity,
        direction: Direction,
    ) -> Result<KeyEvent, KeyError> {
        let (keycode, level) = self.resolve(key)?;
        Ok(KeyEvent {
            direction,
            window,
            root,
            keycode,
            state: (key.modifiers | level).bits() & !Modifiers::ANY.bits(),
        })
    }

    /// Send one synthetic key event to `window`.
    ///
    /// Fire-and-forget: a window destroyed in the meantime is reported by
    /// the server asynchronously, through the connection's error hook.
    pub fn synthesize(
        &self,
        server: &impl DisplayServer,
        window: Window,
        key: &KeyIdentity,
        direction: Direction,
    ) -> Result<(), SynthesizeError> {
        let event = self.key_event(server.root(), window, key, direction)?;
        server.send_key_event(&event)?;
        tracing::trace!(%key, %direction, window, keycode = event.keycode, "key sent");
        Ok(())
    }
}

/// Failure to send a synthetic key.
#[derive(Debug, thiserror::Error)]
pub enum SynthesizeError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Find which modifier bit NumLock sits on, by scanning the modifier map
/// for keycodes that produce `XK_Num_Lock`.
///
/// Falls back to Mod2, the xmodmap default.
fn detect_numlock_mask(mapping: &KeyboardMapping, modifiers: &ModifierMapping) -> u16 {
    let per_mod = modifiers.keycodes_per_modifier as usize;
    if per_mod == 0 {
        return NUMLOCK_FALLBACK;
    }

    let numlock_keycodes: Vec<Keycode> = mapping
        .iter()
        .filter(|(_, syms)| syms.contains(&XK_NUM_LOCK))
        .map(|(keycode, _)| keycode)
        .collect();

    // Row 0 = Shift, 1 = Lock, 2 = Control, 3 = Mod1, ..., 7 = Mod5.
    for (row, keycodes) in modifiers.keycodes.chunks(per_mod).take(8).enumerate() {
        if keycodes
            .iter()
            .any(|&kc| kc != 0 && numlock_keycodes.contains(&kc))
        {
            return 1u16 << row;
        }
    }

    NUMLOCK_FALLBACK
}
