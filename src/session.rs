//! Persistent session store collaborator.
//!
//! The host application owns the real store. Two namespaces exist: `config` holds
//! user preferences (robot IP, sample counts) and `state` holds the navigation
//! session (tracker, fiducials, markers, ICP).

use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait SessionStore: Send + Sync {
    fn get_state(&self, key: &str) -> Option<Value>;
    fn set_state(&self, key: &str, value: Value) -> Result<()>;
    fn get_config(&self, key: &str) -> Option<Value>;
    fn set_config(&self, key: &str, value: Value) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySession {
    state: Mutex<HashMap<String, Value>>,
    config: Mutex<HashMap<String, Value>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }
}

fn get(map: &Mutex<HashMap<String, Value>>, key: &str) -> Option<Value> {
    map.lock().ok()?.get(key).cloned()
}

fn set(map: &Mutex<HashMap<String, Value>>, key: &str, value: Value) -> Result<()> {
    let mut map = map
        .lock()
        .map_err(|_| crate::NavError::State("session lock poisoned".into()))?;
    map.insert(key.to_string(), value);
    Ok(())
}

impl SessionStore for MemorySession {
    fn get_state(&self, key: &str) -> Option<Value> {
        get(&self.state, key)
    }

    fn set_state(&self, key: &str, value: Value) -> Result<()> {
        set(&self.state, key, value)
    }

    fn get_config(&self, key: &str) -> Option<Value> {
        get(&self.config, key)
    }

    fn set_config(&self, key: &str, value: Value) -> Result<()> {
        set(&self.config, key, value)
    }
}

/// Session persisted as `state.json` and `config.json` inside a directory.
/// Every write rewrites the whole file.
#[derive(Debug)]
pub struct JsonFileSession {
    dir: PathBuf,
    inner: MemorySession,
}

const STATE_FILE: &str = "state.json";
const CONFIG_FILE: &str = "config.json";

impl JsonFileSession {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let inner = MemorySession::new();
        for (file, map) in [(STATE_FILE, &inner.state), (CONFIG_FILE, &inner.config)] {
            let path = dir.join(file);
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            let loaded: HashMap<String, Value> = serde_json::from_str(&text)?;
            if let Ok(mut map) = map.lock() {
                *map = loaded;
            }
        }
        log::info!("Session opened at {}", dir.display());
        Ok(Self { dir, inner })
    }

    fn flush(&self, file: &str, map: &Mutex<HashMap<String, Value>>) -> Result<()> {
        let text = {
            let map = map
                .lock()
                .map_err(|_| crate::NavError::State("session lock poisoned".into()))?;
            serde_json::to_string_pretty(&*map)?
        };
        std::fs::write(self.dir.join(file), text)?;
        Ok(())
    }
}

impl SessionStore for JsonFileSession {
    fn get_state(&self, key: &str) -> Option<Value> {
        self.inner.get_state(key)
    }

    fn set_state(&self, key: &str, value: Value) -> Result<()> {
        self.inner.set_state(key, value)?;
        self.flush(STATE_FILE, &self.inner.state)
    }

    fn get_config(&self, key: &str) -> Option<Value> {
        self.inner.get_config(key)
    }

    fn set_config(&self, key: &str, value: Value) -> Result<()> {
        self.inner.set_config(key, value)?;
        self.flush(CONFIG_FILE, &self.inner.config)
    }
}

pub(crate) fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn read_env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_session_namespaces_are_separate() {
        let session = MemorySession::new();
        session.set_state("robot", json!({"a": 1})).unwrap();
        assert!(session.get_config("robot").is_none());
        assert_eq!(session.get_state("robot").unwrap()["a"], 1);
    }

    #[test]
    fn test_json_file_session_reloads() {
        let dir = std::env::temp_dir().join(format!("neuronav-session-{}", std::process::id()));
        {
            let session = JsonFileSession::open(&dir).unwrap();
            session.set_state("tracker", json!({"tracker_id": 9})).unwrap();
            session.set_config("robot", json!({"robot_ip": "10.0.0.2"})).unwrap();
        }
        let session = JsonFileSession::open(&dir).unwrap();
        assert_eq!(session.get_state("tracker").unwrap()["tracker_id"], 9);
        assert_eq!(session.get_config("robot").unwrap()["robot_ip"], "10.0.0.2");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_env_overrides_parse_trimmed_integers() {
        std::env::set_var("NEURONAV_TEST_ENV_PERIOD", " 250 ");
        std::env::set_var("NEURONAV_TEST_ENV_SAMPLES", "many");
        assert_eq!(read_env_u64("NEURONAV_TEST_ENV_PERIOD"), Some(250));
        assert_eq!(read_env_usize("NEURONAV_TEST_ENV_SAMPLES"), None);
        assert_eq!(read_env_usize("NEURONAV_TEST_ENV_UNSET"), None);
    }
}
