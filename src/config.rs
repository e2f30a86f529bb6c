use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::UploadError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mlstverse/fast5upload.json";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub cloud: CloudConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CloudConfig {
    pub user: String,
    pub password: String,
    pub website_server: String,
    pub upload_server: String,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LocalConfig {
    #[serde(default = "default_data_root")]
    pub data: Utf8PathBuf,
    #[serde(default = "default_runid_db")]
    pub runid_db: Utf8PathBuf,
    #[serde(default)]
    pub max_data: Option<u64>,
    #[serde(default)]
    pub sequencer: Option<String>,
    #[serde(default)]
    pub default_kit: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            data: default_data_root(),
            runid_db: default_runid_db(),
            max_data: None,
            sequencer: None,
            default_kit: None,
        }
    }
}

impl LocalConfig {
    pub fn max_data_cap(&self) -> Option<u64> {
        self.max_data.filter(|max| *max > 0)
    }

    pub fn sequencer_allow_list(&self) -> Option<Vec<String>> {
        let raw = self.sequencer.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        Some(
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        )
    }
}

fn default_attempt() -> u32 {
    3
}

fn default_data_root() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/lib/minknow/data")
}

fn default_runid_db() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/lib/mlstverse/run.db")
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<Config, UploadError> {
        let config_path = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        Self::read(&config_path)
    }

    pub fn read(config_path: &Path) -> Result<Config, UploadError> {
        if !config_path.exists() {
            return Err(UploadError::MissingConfig(config_path.to_path_buf()));
        }
        let content = fs::read_to_string(config_path)
            .map_err(|_| UploadError::ConfigRead(config_path.to_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| UploadError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<Config, UploadError> {
        if config.cloud.user.trim().is_empty() {
            return Err(UploadError::ConfigInvalid(
                "cloud.user is not set".to_string(),
            ));
        }
        if config.cloud.password.is_empty() {
            return Err(UploadError::ConfigInvalid(
                "cloud.password is not set".to_string(),
            ));
        }
        if config.cloud.attempt == 0 {
            return Err(UploadError::ConfigInvalid(
                "cloud.attempt must be at least 1".to_string(),
            ));
        }
        for (key, url) in [
            ("cloud.website_server", &config.cloud.website_server),
            ("cloud.upload_server", &config.cloud.upload_server),
        ] {
            if url.trim().is_empty() {
                return Err(UploadError::ConfigInvalid(format!("{key} is not set")));
            }
        }
        Ok(config)
    }
}

pub struct ConfigContext {
    source: Option<PathBuf>,
    state: Mutex<ContextState>,
    subscribers: Mutex<Vec<Sender<Arc<Config>>>>,
}

struct ContextState {
    config: Arc<Config>,
    modified: Option<SystemTime>,
}

impl ConfigContext {
    pub fn load(path: &Path) -> Result<Self, UploadError> {
        let config = ConfigLoader::read(path)?;
        let modified = modified_time(path)?;
        Ok(Self {
            source: Some(path.to_path_buf()),
            state: Mutex::new(ContextState {
                config: Arc::new(config),
                modified: Some(modified),
            }),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn from_config(config: Config) -> Result<Self, UploadError> {
        let config = ConfigLoader::resolve_config(config)?;
        Ok(Self {
            source: None,
            state: Mutex::new(ContextState {
                config: Arc::new(config),
                modified: None,
            }),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.lock_state().config)
    }

    pub fn subscribe(&self) -> Receiver<Arc<Config>> {
        let (tx, rx) = mpsc::channel();
        self.lock_subscribers().push(tx);
        rx
    }

    pub fn reload(&self) -> Result<bool, UploadError> {
        let Some(path) = self.source.as_deref() else {
            return Ok(false);
        };
        let modified = modified_time(path)?;
        {
            let state = self.lock_state();
            if state.modified.is_some_and(|seen| modified <= seen) {
                return Ok(false);
            }
        }
        let config = ConfigLoader::read(path)?;
        {
            let mut state = self.lock_state();
            state.modified = Some(modified);
        }
        info!(path = %path.display(), "config file refreshed");
        self.publish(config);
        Ok(true)
    }

    pub fn replace(&self, config: Config) -> Result<(), UploadError> {
        let config = ConfigLoader::resolve_config(config)?;
        self.publish(config);
        Ok(())
    }

    fn publish(&self, config: Config) {
        let config = Arc::new(config);
        self.lock_state().config = Arc::clone(&config);
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|tx| tx.send(Arc::clone(&config)).is_ok());
        debug!(subscribers = subscribers.len(), "config change published");
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Sender<Arc<Config>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn modified_time(path: &Path) -> Result<SystemTime, UploadError> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|_| UploadError::ConfigRead(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            cloud: CloudConfig {
                user: "alice".to_string(),
                password: "secret".to_string(),
                website_server: "https://web.example.org/".to_string(),
                upload_server: "https://files.example.org/".to_string(),
                attempt: 3,
            },
            local: LocalConfig::default(),
        }
    }

    #[test]
    fn zero_max_data_disables_cap() {
        let mut local = LocalConfig::default();
        assert_eq!(local.max_data_cap(), None);
        local.max_data = Some(0);
        assert_eq!(local.max_data_cap(), None);
        local.max_data = Some(5);
        assert_eq!(local.max_data_cap(), Some(5));
    }

    #[test]
    fn sequencer_list_splits_on_commas() {
        let mut local = LocalConfig::default();
        local.sequencer = Some(" MN1234, ,MN5678 ".to_string());
        assert_eq!(
            local.sequencer_allow_list(),
            Some(vec!["MN1234".to_string(), "MN5678".to_string()])
        );
        local.sequencer = Some(String::new());
        assert_eq!(local.sequencer_allow_list(), None);
    }

    #[test]
    fn subscribers_receive_replacement() {
        let context = ConfigContext::from_config(sample()).unwrap();
        let rx = context.subscribe();
        let mut next = sample();
        next.local.max_data = Some(10);
        context.replace(next.clone()).unwrap();
        assert_eq!(*rx.try_recv().unwrap(), next);
        assert_eq!(context.current().local.max_data, Some(10));
    }
}
