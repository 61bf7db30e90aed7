//! Fault injection for writeback executors.
//!
//! Each executor holds a handle to a registry owned by its manager, so
//! tests can arm a failure for one manager without touching any other.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

/// Checked after the backup is taken, before the archive is opened.
pub const BEFORE_REWRITE: &str = "in_place.before_rewrite";
/// Checked after the unrelated members are copied into the temp archive.
pub const MID_REWRITE: &str = "in_place.mid_rewrite";
/// Checked right before the temp file replaces the target.
pub const BEFORE_RENAME: &str = "in_place.before_rename";
pub const OVERLAY_WRITE: &str = "overlay.write";
pub const CREATE_NEW_WRITE: &str = "create_new.write";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailpointAction {
    Off,
    /// Fail the guarded step with an I/O error carrying this message.
    Error(String),
}

#[derive(Clone, Debug, Default)]
pub struct Failpoints {
    registry: Arc<Mutex<HashMap<String, FailpointAction>>>,
}

impl Failpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, action: FailpointAction) {
        self.registry.lock().insert(name.to_string(), action);
    }

    pub fn fail(&self, name: &str, message: impl Into<String>) {
        self.set(name, FailpointAction::Error(message.into()));
    }

    pub fn clear(&self, name: &str) {
        self.registry.lock().remove(name);
    }

    pub fn clear_all(&self) {
        self.registry.lock().clear();
    }

    pub fn check(&self, name: &str) -> io::Result<()> {
        match self.registry.lock().get(name) {
            None | Some(FailpointAction::Off) => Ok(()),
            Some(FailpointAction::Error(msg)) => Err(io::Error::other(format!("failpoint {name}: {msg}"))),
        }
    }
}
