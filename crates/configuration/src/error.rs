use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// The settings file or a `HYDROSTORE__` variable could not be read or
    /// did not match the expected shape.
    #[error("Failed to read settings: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Invalid setting: {0}")]
    ValidationError(String),
}
