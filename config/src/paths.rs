use std::path::PathBuf;

pub struct PathManager;

impl PathManager {
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mneme"))
    }

    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("settings.toml"))
    }
}
