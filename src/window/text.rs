//! Text property decoding: `STRING`, `UTF8_STRING`, `COMPOUND_TEXT`.
//!
//! Text properties hold NUL-separated lists. Each element is decoded
//! according to the property's declared type; anything undecodable is
//! replaced rather than treated as an error.

use crate::connection::{PropertyType, RawProperty};

const ESC: u8 = 0x1b;

/// Decode a text property into its list of strings.
///
/// A trailing NUL does not produce an empty final element. Empty input
/// or a non-8-bit format yields an empty list.
pub fn decode_text_list(property: &RawProperty) -> Vec<String> {
    if property.format != 8 || property.value.is_empty() {
        return Vec::new();
    }

    let value = property
        .value
        .strip_suffix(&[0])
        .unwrap_or(&property.value[..]);

    value
        .split(|&b| b == 0)
        .map(|item| decode_item(property.type_, item))
        .collect()
}

fn decode_item(type_: PropertyType, bytes: &[u8]) -> String {
    match type_ {
        PropertyType::String => decode_latin1(bytes),
        PropertyType::CompoundText => decode_compound_text(bytes),
        PropertyType::Utf8 | PropertyType::Cardinal | PropertyType::Other(_) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Decode compound text: Latin-1 by default, with UTF-8 segments between
/// `ESC % G` and `ESC % @`. Other charset designations are skipped and
/// their bytes read as Latin-1.
fn decode_compound_text(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut utf8 = Vec::new();
    let mut in_utf8 = false;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != ESC {
            if in_utf8 {
                utf8.push(bytes[i]);
            } else {
                out.push(char::from(bytes[i]));
            }
            i += 1;
            continue;
        }

        // ESC, intermediate bytes 0x20..=0x2f, final byte.
        let mut end = i + 1;
        while end < bytes.len() && (0x20..=0x2f).contains(&bytes[end]) {
            end += 1;
        }
        let intermediates = &bytes[i + 1..end];
        match (intermediates, bytes.get(end)) {
            (b"%", Some(b'G')) => in_utf8 = true,
            (b"%", Some(b'@')) => {
                out.push_str(&String::from_utf8_lossy(&utf8));
                utf8.clear();
                in_utf8 = false;
            }
            _ => {}
        }
        i = end + 1;
    }

    out.push_str(&String::from_utf8_lossy(&utf8));
    out
}
