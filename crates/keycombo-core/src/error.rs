use thiserror::Error;

/// Errors that make a combo configuration unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no down keys configured")]
    EmptyDownSet,

    #[error("key {code} is listed in both keys_down and keys_up")]
    Overlap { code: u16 },

    #[error("unknown key name: {name}")]
    UnknownKey { name: String },

    #[error("key code {code} is outside the valid range 1..{max}")]
    KeyOutOfRange { code: u32, max: u16 },

    #[error("unknown combo profile: {name}")]
    UnknownProfile { name: String },
}
