//! Keysym names: the subset of `keysymdef.h`/`XF86keysym.h` accepted in
//! key expressions.
//!
//! Single ASCII letters and digits map to their Latin-1 code points and
//! are handled without the table.

use x11rb::protocol::xproto::Keysym;

/// XK_Num_Lock, used for dynamic modifier detection.
pub const XK_NUM_LOCK: Keysym = 0xff7f;

/// Named keysyms, in `keysymdef.h` spelling.
const NAMED: &[(&str, Keysym)] = &[
    // TTY function keys
    ("BackSpace", 0xff08),
    ("Tab", 0xff09),
    ("Linefeed", 0xff0a),
    ("Clear", 0xff0b),
    ("Return", 0xff0d),
    ("Pause", 0xff13),
    ("Scroll_Lock", 0xff14),
    ("Sys_Req", 0xff15),
    ("Escape", 0xff1b),
    ("Delete", 0xffff),
    // Cursor control
    ("Home", 0xff50),
    ("Left", 0xff51),
    ("Up", 0xff52),
    ("Right", 0xff53),
    ("Down", 0xff54),
    ("Prior", 0xff55),
    ("Page_Up", 0xff55),
    ("Next", 0xff56),
    ("Page_Down", 0xff56),
    ("End", 0xff57),
    ("Begin", 0xff58),
    // Misc functions
    ("Select", 0xff60),
    ("Print", 0xff61),
    ("Execute", 0xff62),
    ("Insert", 0xff63),
    ("Undo", 0xff65),
    ("Redo", 0xff66),
    ("Menu", 0xff67),
    ("Find", 0xff68),
    ("Cancel", 0xff69),
    ("Help", 0xff6a),
    ("Break", 0xff6b),
    ("Mode_switch", 0xff7e),
    ("Num_Lock", XK_NUM_LOCK),
    // Keypad
    ("KP_Space", 0xff80),
    ("KP_Tab", 0xff89),
    ("KP_Enter", 0xff8d),
    ("KP_Home", 0xff95),
    ("KP_Left", 0xff96),
    ("KP_Up", 0xff97),
    ("KP_Right", 0xff98),
    ("KP_Down", 0xff99),
    ("KP_Page_Up", 0xff9a),
    ("KP_Page_Down", 0xff9b),
    ("KP_End", 0xff9c),
    ("KP_Insert", 0xff9e),
    ("KP_Delete", 0xff9f),
    ("KP_Equal", 0xffbd),
    ("KP_Multiply", 0xffaa),
    ("KP_Add", 0xffab),
    ("KP_Separator", 0xffac),
    ("KP_Subtract", 0xffad),
    ("KP_Decimal", 0xffae),
    ("KP_Divide", 0xffaf),
    ("KP_0", 0xffb0),
    ("KP_1", 0xffb1),
    ("KP_2", 0xffb2),
    ("KP_3", 0xffb3),
    ("KP_4", 0xffb4),
    ("KP_5", 0xffb5),
    ("KP_6", 0xffb6),
    ("KP_7", 0xffb7),
    ("KP_8", 0xffb8),
    ("KP_9", 0xffb9),
    // Modifiers
    ("Shift_L", 0xffe1),
    ("Shift_R", 0xffe2),
    ("Control_L", 0xffe3),
    ("Control_R", 0xffe4),
    ("Caps_Lock", 0xffe5),
    ("Shift_Lock", 0xffe6),
    ("Meta_L", 0xffe7),
    ("Meta_R", 0xffe8),
    ("Alt_L", 0xffe9),
    ("Alt_R", 0xffea),
    ("Super_L", 0xffeb),
    ("Super_R", 0xffec),
    ("Hyper_L", 0xffed),
    ("Hyper_R", 0xffee),
    ("ISO_Level3_Shift", 0xfe03),
    ("ISO_Left_Tab", 0xfe20),
    // Latin-1 punctuation
    ("space", 0x0020),
    ("exclam", 0x0021),
    ("quotedbl", 0x0022),
    ("numbersign", 0x0023),
    ("dollar", 0x0024),
    ("percent", 0x0025),
    ("ampersand", 0x0026),
    ("apostrophe", 0x0027),
    ("parenleft", 0x0028),
    ("parenright", 0x0029),
    ("asterisk", 0x002a),
    ("plus", 0x002b),
    ("comma", 0x002c),
    ("minus", 0x002d),
    ("period", 0x002e),
    ("slash", 0x002f),
    ("colon", 0x003a),
    ("semicolon", 0x003b),
    ("less", 0x003c),
    ("equal", 0x003d),
    ("greater", 0x003e),
    ("question", 0x003f),
    ("at", 0x0040),
    ("bracketleft", 0x005b),
    ("backslash", 0x005c),
    ("bracketright", 0x005d),
    ("asciicircum", 0x005e),
    ("underscore", 0x005f),
    ("grave", 0x0060),
    ("braceleft", 0x007b),
    ("bar", 0x007c),
    ("braceright", 0x007d),
    ("asciitilde", 0x007e),
    // XF86 media and launch keys
    ("XF86AudioLowerVolume", 0x1008ff11),
    ("XF86AudioMute", 0x1008ff12),
    ("XF86AudioRaiseVolume", 0x1008ff13),
    ("XF86AudioPlay", 0x1008ff14),
    ("XF86AudioStop", 0x1008ff15),
    ("XF86AudioPrev", 0x1008ff16),
    ("XF86AudioNext", 0x1008ff17),
    ("XF86HomePage", 0x1008ff18),
    ("XF86Mail", 0x1008ff19),
    ("XF86Search", 0x1008ff1b),
    ("XF86AudioPause", 0x1008ff31),
    ("XF86Calculator", 0x1008ff1d),
    ("XF86Back", 0x1008ff26),
    ("XF86Forward", 0x1008ff27),
    ("XF86Reload", 0x1008ff73),
    ("XF86MonBrightnessUp", 0x1008ff02),
    ("XF86MonBrightnessDown", 0x1008ff03),
    ("XF86AudioMicMute", 0x1008ffb2),
];

/// XK_F1; F2..F35 follow contiguously.
const XK_F1: Keysym = 0xffbe;

/// Look up a keysym by name.
///
/// Single letters and digits map to their code points (case preserved);
/// `F1`..`F35` are computed; everything else must match the table
/// exactly, with a case-insensitive second pass for convenience.
pub fn lookup(name: &str) -> Option<Keysym> {
    let mut chars = name.chars();
    if let (Some(ch), None) = (chars.next(), chars.next())
        && ch.is_ascii_alphanumeric()
    {
        return Some(ch as Keysym);
    }

    if let Some(rest) = name.strip_prefix('F')
        && let Ok(n) = rest.parse::<u32>()
        && (1..=35).contains(&n)
    {
        return Some(XK_F1 + n - 1);
    }

    NAMED
        .iter()
        .find(|(n, _)| *n == name)
        .or_else(|| NAMED.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)))
        .map(|&(_, sym)| sym)
}

/// Reverse lookup for logging. Letters and digits are not in the table.
pub fn name_of(keysym: Keysym) -> Option<&'static str> {
    const LETTERS: &str = "abcdefghijklmnopqrstuvwxyz";
    const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const DIGITS: &str = "0123456789";
    const FKEYS: [&str; 35] = [
        "F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9", "F10", "F11", "F12", "F13", "F14",
        "F15", "F16", "F17", "F18", "F19", "F20", "F21", "F22", "F23", "F24", "F25", "F26", "F27",
        "F28", "F29", "F30", "F31", "F32", "F33", "F34", "F35",
    ];

    let single = |table: &'static str, base: Keysym| {
        let i = (keysym - base) as usize;
        &table[i..i + 1]
    };

    match keysym {
        0x61..=0x7a => Some(single(LETTERS, 0x61)),
        0x41..=0x5a => Some(single(UPPER, 0x41)),
        0x30..=0x39 => Some(single(DIGITS, 0x30)),
        k if (XK_F1..XK_F1 + 35).contains(&k) => Some(FKEYS[(k - XK_F1) as usize]),
        k => NAMED.iter().find(|&&(_, sym)| sym == k).map(|&(n, _)| n),
    }
}
