use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::shell::filesystem::session::SessionFs;
use crate::shell::WinSize;

/// Shared state handed to every command. Everything is a cheap handle so
/// pipeline stages running in their own tasks see the same session.
#[derive(Clone)]
pub struct CommandContext {
    /// This session's copy-on-write filesystem.
    pub fs: Arc<SessionFs>,
    /// Environment variables, shared with the terminal and front-end.
    pub env: Arc<Mutex<HashMap<String, String>>>,
    /// Command history (terminal appends, `history` reads).
    pub history: Arc<Mutex<Vec<String>>>,
    /// Window dimensions, updated by the protocol front-end.
    pub size: Arc<Mutex<WinSize>>,
    /// When set, the input task forwards keystrokes here instead of the
    /// line editor; foreground apps install it for their lifetime.
    pub raw_keys: Arc<Mutex<Option<mpsc::UnboundedSender<char>>>>,
    /// Cleared by exit/logout; the terminal loop checks it after each line.
    pub running: Arc<AtomicBool>,
    /// Last pipeline exit code, exported as `$?`.
    pub last_exit: Arc<AtomicI32>,
    /// Simulated shell PID, exported as `$$`.
    pub pid: i32,
}

impl CommandContext {
    pub fn env_get(&self, key: &str) -> Option<String> {
        self.env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn env_set(&self, key: String, value: String) {
        self.env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    pub fn env_snapshot(&self) -> HashMap<String, String> {
        self.env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn user(&self) -> String {
        self.env_get("USER").unwrap_or_else(|| "root".to_string())
    }

    pub fn win_size(&self) -> WinSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
