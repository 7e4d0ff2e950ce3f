//! Configuration file resolution.
//!
//! An explicitly named file must exist and parse. Without one, the default
//! system path is used when present and built-in defaults otherwise.

use crate::{Settings, SettingsError};
use std::path::{Path, PathBuf};

/// Default system-wide config location.
const DEFAULT_CONFIG_PATH: &str = "/etc/divert.toml";

/// Resolves and loads [`Settings`].
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load settings from `explicit`, or from the default path.
    ///
    /// A missing default file yields `Settings::default()`; a missing or
    /// malformed explicit file is an error, as is a malformed default file.
    pub fn load(explicit: Option<&Path>) -> Result<Settings, SettingsError> {
        match explicit {
            Some(path) => Settings::load(path),
            None => {
                let path = Self::default_config_path();
                if path.exists() {
                    Settings::load(&path)
                } else {
                    Ok(Settings::default())
                }
            }
        }
    }

    /// Path consulted when no config flag is given.
    pub fn default_config_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}
