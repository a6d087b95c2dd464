use thiserror::Error;

/// Errors raised by guard configuration and maintenance.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidSetting { key: String, value: String },

    /// A thread panicked while holding the state lock, so the maps may be
    /// half-updated. Sweeps refuse to run over them.
    #[error("anti-spam state lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, GuardError>;
