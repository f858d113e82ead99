use crate::error::ConfigError;

/// Upper bound of the Linux key code space (`KEY_MAX` in input-event-codes.h).
pub const KEY_MAX: u16 = 0x2ff;

/// Linux input key codes that can be named in the config file.
const KEY_NAMES: &[(&str, u16)] = &[
    ("ESC", 1),
    ("1", 2),
    ("2", 3),
    ("3", 4),
    ("4", 5),
    ("5", 6),
    ("6", 7),
    ("7", 8),
    ("8", 9),
    ("9", 10),
    ("0", 11),
    ("MINUS", 12),
    ("EQUAL", 13),
    ("BACKSPACE", 14),
    ("TAB", 15),
    ("Q", 16),
    ("W", 17),
    ("E", 18),
    ("R", 19),
    ("T", 20),
    ("Y", 21),
    ("U", 22),
    ("I", 23),
    ("O", 24),
    ("P", 25),
    ("ENTER", 28),
    ("LEFTCTRL", 29),
    ("A", 30),
    ("S", 31),
    ("D", 32),
    ("F", 33),
    ("G", 34),
    ("H", 35),
    ("J", 36),
    ("K", 37),
    ("L", 38),
    ("LEFTSHIFT", 42),
    ("Z", 44),
    ("X", 45),
    ("C", 46),
    ("V", 47),
    ("B", 48),
    ("N", 49),
    ("M", 50),
    ("RIGHTSHIFT", 54),
    ("LEFTALT", 56),
    ("SPACE", 57),
    ("CAPSLOCK", 58),
    ("F1", 59),
    ("F2", 60),
    ("F3", 61),
    ("F4", 62),
    ("F5", 63),
    ("F6", 64),
    ("F7", 65),
    ("F8", 66),
    ("F9", 67),
    ("F10", 68),
    ("F11", 87),
    ("F12", 88),
    ("RIGHTCTRL", 97),
    ("SYSRQ", 99),
    ("RIGHTALT", 100),
    ("HOME", 102),
    ("UP", 103),
    ("PAGEUP", 104),
    ("LEFT", 105),
    ("RIGHT", 106),
    ("END", 107),
    ("DOWN", 108),
    ("PAGEDOWN", 109),
    ("INSERT", 110),
    ("DELETE", 111),
    ("MUTE", 113),
    ("VOLUMEDOWN", 114),
    ("VOLUMEUP", 115),
    ("POWER", 116),
    ("PAUSE", 119),
    ("LEFTMETA", 125),
    ("RIGHTMETA", 126),
    ("MENU", 139),
    ("SLEEP", 142),
    ("WAKEUP", 143),
    ("BACK", 158),
    ("HOMEPAGE", 172),
    ("CAMERA", 212),
    ("SEARCH", 217),
    ("APPSELECT", 0x244),
];

/// Resolve a config key name to its code.
///
/// Accepts `KEY_POWER`, `power` and plain decimal codes such as `116`.
pub fn parse_key(name: &str) -> Result<u16, ConfigError> {
    let trimmed = name.trim();
    if let Ok(code) = trimmed.parse::<u32>() {
        return check_code(code);
    }

    let upper = trimmed.to_ascii_uppercase();
    let bare = upper.strip_prefix("KEY_").unwrap_or(&upper);
    KEY_NAMES
        .iter()
        .find(|(n, _)| *n == bare)
        .map(|(_, code)| *code)
        .ok_or_else(|| ConfigError::UnknownKey {
            name: name.to_string(),
        })
}

/// Validate a numeric key code against the kernel's key code space.
pub fn check_code(code: u32) -> Result<u16, ConfigError> {
    if code == 0 || code >= u32::from(KEY_MAX) {
        return Err(ConfigError::KeyOutOfRange { code, max: KEY_MAX });
    }
    Ok(code as u16)
}

/// Human-readable name for a key code, for logs and status output.
pub fn key_name(code: u16) -> Option<&'static str> {
    KEY_NAMES.iter().find(|(_, c)| *c == code).map(|(n, _)| *n)
}
