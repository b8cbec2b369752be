//! Key expression parser: "C-b", "Ctrl-Shift-Left", "M-x" → KeyIdentity.
//!
//! Format: `[Modifier-]...Key`. Modifiers: `C`/`Ctrl`/`Control`,
//! `M`/`Alt`, `Super`/`Win`, `Shift`, and `Any` (AnyModifier, only
//! meaningful for grabs). Single letters are normalised to lower case,
//! since that is what the keyboard mapping reports in column 0; use
//! `Shift-a` for a capital.

use super::{KeyError, KeyIdentity, Modifiers, keysym};

/// Parse a key expression.
pub fn parse(exp: &str) -> Result<KeyIdentity, KeyError> {
    let exp = exp.trim();
    if exp.is_empty() {
        return Err(KeyError::InvalidExpression("empty key expression".into()));
    }

    let mut modifiers = Modifiers::NONE;
    let mut rest = exp;
    while let Some((prefix, tail)) = rest.split_once('-') {
        // "C--" style is not supported; use "C-minus".
        if tail.is_empty() {
            break;
        }
        let Some(mask) = parse_modifier(prefix) else {
            break;
        };
        modifiers |= mask;
        rest = tail;
    }

    let name = if rest.len() == 1 && rest.is_ascii() {
        rest.to_ascii_lowercase()
    } else {
        rest.to_string()
    };

    let keysym = keysym::lookup(&name)
        .ok_or_else(|| KeyError::InvalidExpression(format!("unknown key {rest:?} in {exp:?}")))?;

    Ok(KeyIdentity::new(keysym, modifiers))
}

/// Map a modifier prefix to its mask.
fn parse_modifier(name: &str) -> Option<Modifiers> {
    match name {
        "C" | "Ctrl" | "Control" => Some(Modifiers::CONTROL),
        "M" | "Alt" => Some(Modifiers::ALT),
        "Super" | "Win" => Some(Modifiers::SUPER),
        "Shift" => Some(Modifiers::SHIFT),
        "Any" => Some(Modifiers::ANY),
        _ => None,
    }
}
