use std::fmt;

/// Errors from settings persistence and token sealing.
#[derive(Debug)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    NoConfigDir,
    Io(std::io::Error),
    Format(toml::ser::Error),
    /// Sealing or opening the stored token failed.
    Sealing(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoConfigDir => write!(f, "could not determine config directory"),
            ConfigError::Io(e) => write!(f, "settings file error: {}", e),
            ConfigError::Format(e) => write!(f, "settings serialization error: {}", e),
            ConfigError::Sealing(msg) => write!(f, "token sealing error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Format(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Format(e)
    }
}
