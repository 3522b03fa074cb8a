//! INI file configuration adapter.

use crate::domain::error::StoreError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config.load(path).map_err(|reason| StoreError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        log::debug!("loaded config from {}", path.display());
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, StoreError> {
        let mut config = Ini::new();
        config
            .read(content.to_string())
            .map_err(|reason| StoreError::ConfigParse {
                file: "<string>".into(),
                reason,
            })?;
        Ok(Self { config })
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.config
            .getint(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }
}
