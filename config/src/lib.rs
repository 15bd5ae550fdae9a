pub mod error;
pub mod paths;
pub mod secret;
pub mod settings;

pub use error::ConfigError;
pub use paths::PathManager;
pub use secret::SealedSecret;
pub use settings::Settings;
