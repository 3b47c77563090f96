//! Persisted client state: exactly one durable value (the bearer token) plus
//! session-scoped scratch values that never outlive a logout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;

/// File name inside the console home directory.
pub const STATE_FILE: &str = "console_state.json";

/// Fixed key under which the bearer token is stored.
pub const TOKEN_KEY: &str = "token";

/// Session key holding the name the analyst logged in with.
pub const USERNAME_KEY: &str = "username";

/// Durable key/value storage for the token.
pub trait TokenStore: Send + Sync {
  fn load_token(&self) -> Option<String>;
  fn save_token(&self, token: &str) -> Result<(), ConsoleError>;
  fn clear_token(&self) -> Result<(), ConsoleError>;
  /// Session-scoped value, kept in memory only.
  fn set_session_value(&self, key: &str, value: &str);
  fn session_value(&self, key: &str) -> Option<String>;
  /// Drop anything scoped to the current session.
  fn clear_session(&self);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
  #[serde(default)]
  values: HashMap<String, String>,
}

/// JSON file in the console home directory (`console_state.json`).
#[derive(Debug)]
pub struct FileTokenStore {
  path: PathBuf,
  session: Mutex<HashMap<String, String>>,
}

impl FileTokenStore {
  pub fn new(home_dir: &Path) -> Self {
    Self {
      path: home_dir.join(STATE_FILE),
      session: Mutex::new(HashMap::new()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn read(&self) -> StateFile {
    let contents = match fs::read_to_string(&self.path) {
      Ok(c) => c,
      Err(_) => return StateFile::default(),
    };
    match serde_json::from_str(&contents) {
      Ok(state) => state,
      Err(e) => {
        tracing::warn!("ignoring unreadable state file {:?}: {}", self.path, e);
        StateFile::default()
      }
    }
  }

  fn write(&self, state: &StateFile) -> Result<(), ConsoleError> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state)?;
    fs::write(&self.path, json)?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
  }
}

impl TokenStore for FileTokenStore {
  fn load_token(&self) -> Option<String> {
    self.read().values.get(TOKEN_KEY).cloned()
  }

  fn save_token(&self, token: &str) -> Result<(), ConsoleError> {
    let mut state = self.read();
    state.values.insert(TOKEN_KEY.to_string(), token.to_string());
    self.write(&state)
  }

  fn clear_token(&self) -> Result<(), ConsoleError> {
    let mut state = self.read();
    if state.values.remove(TOKEN_KEY).is_none() {
      return Ok(());
    }
    self.write(&state)
  }

  fn set_session_value(&self, key: &str, value: &str) {
    if let Ok(mut session) = self.session.lock() {
      session.insert(key.to_string(), value.to_string());
    }
  }

  fn session_value(&self, key: &str) -> Option<String> {
    self.session.lock().ok()?.get(key).cloned()
  }

  fn clear_session(&self) {
    if let Ok(mut session) = self.session.lock() {
      session.clear();
    }
  }
}

/// In-memory store; backs tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
  token: Mutex<Option<String>>,
  session: Mutex<HashMap<String, String>>,
  session_clears: Mutex<usize>,
}

impl MemoryTokenStore {
  pub fn with_token(token: impl Into<String>) -> Self {
    Self {
      token: Mutex::new(Some(token.into())),
      session: Mutex::new(HashMap::new()),
      session_clears: Mutex::new(0),
    }
  }

  pub fn session_clears(&self) -> usize {
    self.session_clears.lock().map(|n| *n).unwrap_or(0)
  }
}

impl TokenStore for MemoryTokenStore {
  fn load_token(&self) -> Option<String> {
    self.token.lock().ok()?.clone()
  }

  fn save_token(&self, token: &str) -> Result<(), ConsoleError> {
    if let Ok(mut slot) = self.token.lock() {
      *slot = Some(token.to_string());
    }
    Ok(())
  }

  fn clear_token(&self) -> Result<(), ConsoleError> {
    if let Ok(mut slot) = self.token.lock() {
      *slot = None;
    }
    Ok(())
  }

  fn set_session_value(&self, key: &str, value: &str) {
    if let Ok(mut session) = self.session.lock() {
      session.insert(key.to_string(), value.to_string());
    }
  }

  fn session_value(&self, key: &str) -> Option<String> {
    self.session.lock().ok()?.get(key).cloned()
  }

  fn clear_session(&self) {
    if let Ok(mut session) = self.session.lock() {
      session.clear();
    }
    if let Ok(mut n) = self.session_clears.lock() {
      *n += 1;
    }
  }
}
