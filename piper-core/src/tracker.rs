//! Per-process registry of objects handed to tasks
//!
//! Objects are identified by a [`TrackToken`] minted by their owner rather
//! than by address. The tracker maps each token to an id of the form
//! `{runtime_id}-{counter}`, remembers which file backs the object and which
//! ids are still waiting to be synchronized or were written by the program.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TrackerError;

/// File name placeholder for collections, which are never stored as a whole
pub const COLLECTION_FILE_NAME: &str = "None";

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackToken(u64);

impl TrackToken {
    /// Mint a token distinct from every other token in this process
    pub fn new() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TrackToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Table sizes at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerSnapshot {
    pub timestamp: DateTime<Utc>,
    pub file_names: usize,
    pub pending_to_synchronize: usize,
    pub written_objects: usize,
    pub tokens: usize,
}

#[derive(Debug)]
pub struct ObjectTracker {
    runtime_id: String,
    base_dir: PathBuf,
    current_id: u64,
    token_to_id: HashMap<TrackToken, String>,
    id_to_token: HashMap<String, TrackToken>,
    file_names: HashMap<String, String>,
    obj_names: HashMap<String, String>,
    pending_to_synchronize: HashSet<String>,
    written_objects: HashSet<String>,
    reporting: bool,
    report: Vec<TrackerSnapshot>,
}

impl ObjectTracker {
    /// New tracker placing object files under `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_id: Uuid::new_v4().to_string(),
            base_dir: base_dir.into(),
            current_id: 1,
            token_to_id: HashMap::new(),
            id_to_token: HashMap::new(),
            file_names: HashMap::new(),
            obj_names: HashMap::new(),
            pending_to_synchronize: HashSet::new(),
            written_objects: HashSet::new(),
            reporting: false,
            report: Vec::new(),
        }
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    fn next_id(&mut self) -> String {
        let id = format!("{}-{}", self.runtime_id, self.current_id);
        self.current_id += 1;
        id
    }

    fn file_name_for(&self, id: &str, is_collection: bool) -> String {
        if is_collection {
            COLLECTION_FILE_NAME.to_string()
        } else {
            self.base_dir.join(id).to_string_lossy().into_owned()
        }
    }

    /// Start tracking an object; re-tracking returns the existing entry
    pub fn track(
        &mut self,
        token: TrackToken,
        name: Option<&str>,
        is_collection: bool,
    ) -> (String, String) {
        if let Some(id) = self.token_to_id.get(&token).cloned() {
            let file_name = self
                .file_names
                .get(&id)
                .cloned()
                .unwrap_or_else(|| COLLECTION_FILE_NAME.to_string());
            return (id, file_name);
        }

        let id = self.next_id();
        self.token_to_id.insert(token, id.clone());
        self.id_to_token.insert(id.clone(), token);

        let file_name = self.file_name_for(&id, is_collection);
        if is_collection {
            debug!("Tracking collection {}", id);
        } else {
            self.file_names.insert(id.clone(), file_name.clone());
            if let Some(name) = name {
                self.obj_names.insert(id.clone(), name.to_string());
            }
            self.pending_to_synchronize.insert(id.clone());
            debug!("Tracking object {} to file {}", id, file_name);
        }
        self.after_change();
        (id, file_name)
    }

    /// Allocate an id and file name without registering anything
    pub fn not_track(&mut self, is_collection: bool) -> (String, String) {
        let id = self.next_id();
        let file_name = self.file_name_for(&id, is_collection);
        (id, file_name)
    }

    pub fn stop_tracking(&mut self, token: TrackToken, is_collection: bool) {
        let Some(id) = self.token_to_id.remove(&token) else {
            debug!("Stop tracking requested for an untracked object");
            return;
        };
        self.id_to_token.remove(&id);
        if is_collection {
            debug!("Stop tracking collection {}", id);
        } else {
            debug!("Stop tracking object {}", id);
            self.file_names.remove(&id);
            self.obj_names.remove(&id);
            self.pending_to_synchronize.remove(&id);
        }
        self.after_change();
    }

    pub fn is_tracked(&self, token: TrackToken) -> Option<&str> {
        self.token_to_id.get(&token).map(String::as_str)
    }

    /// Bind `id` to `token`
    ///
    /// Fails if `id` already belongs to another token and `force_insertion`
    /// is not set. A forced insertion drops the previous binding.
    pub fn bind(
        &mut self,
        id: &str,
        token: TrackToken,
        force_insertion: bool,
    ) -> Result<(), TrackerError> {
        if let Some(existing) = self.id_to_token.get(id).copied() {
            if existing == token {
                return Ok(());
            }
            if !force_insertion {
                return Err(TrackerError::IdConflict { id: id.to_string() });
            }
            self.token_to_id.remove(&existing);
        }
        if let Some(previous) = self.token_to_id.insert(token, id.to_string()) {
            self.id_to_token.remove(&previous);
        }
        self.id_to_token.insert(id.to_string(), token);
        Ok(())
    }

    /// Register `new_token` as the successor of `old_id`
    ///
    /// The new id inherits the old file name with the id swapped and is
    /// marked as written.
    pub fn update_mapping(
        &mut self,
        old_id: &str,
        new_token: TrackToken,
    ) -> Result<String, TrackerError> {
        let old_file_name = self
            .file_names
            .get(old_id)
            .cloned()
            .ok_or_else(|| TrackerError::MissingFileName(old_id.to_string()))?;
        let new_id = self.next_id();
        self.bind(&new_id, new_token, true)?;
        let new_file_name = old_file_name.replace(old_id, &new_id);
        self.set_file_name(&new_id, new_file_name, true);
        self.after_change();
        Ok(new_id)
    }

    pub fn clean_object_tracker(&mut self) {
        self.token_to_id.clear();
        self.id_to_token.clear();
        self.file_names.clear();
        self.obj_names.clear();
        self.pending_to_synchronize.clear();
        self.written_objects.clear();
        self.report.clear();
    }

    pub fn get_file_name(&self, id: &str) -> Option<&str> {
        self.file_names.get(id).map(String::as_str)
    }

    pub fn set_file_name(&mut self, id: &str, file_name: impl Into<String>, written: bool) {
        self.file_names.insert(id.to_string(), file_name.into());
        if written {
            self.written_objects.insert(id.to_string());
        }
    }

    pub fn all_file_names(&self) -> Vec<&str> {
        self.file_names.values().map(String::as_str).collect()
    }

    pub fn get_object_name(&self, id: &str) -> Option<&str> {
        self.obj_names.get(id).map(String::as_str)
    }

    pub fn has_been_written(&self, id: &str) -> bool {
        self.written_objects.contains(id)
    }

    /// Clear the written mark and hand back the file name
    pub fn pop_written_obj(&mut self, id: &str) -> Option<String> {
        if !self.written_objects.remove(id) {
            warn!("Object {} was not marked as written", id);
        }
        self.file_names.get(id).cloned()
    }

    pub fn is_pending_to_synchronize(&self, id: &str) -> bool {
        self.pending_to_synchronize.contains(id)
    }

    pub fn set_pending_to_synchronize(&mut self, id: &str) {
        self.pending_to_synchronize.insert(id.to_string());
    }

    /// Returns whether the id was pending
    pub fn pop_pending_to_synchronize(&mut self, id: &str) -> bool {
        self.pending_to_synchronize.remove(id)
    }

    pub fn enable_report(&mut self) {
        self.reporting = true;
    }

    pub fn is_report_enabled(&self) -> bool {
        self.reporting
    }

    pub fn report(&self) -> &[TrackerSnapshot] {
        &self.report
    }

    /// Write the collected snapshots to `object_tracker.json` in `dir`
    pub fn generate_report(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let target = dir.join("object_tracker.json");
        let json = serde_json::to_vec_pretty(&self.report)?;
        std::fs::write(&target, json)?;
        debug!("Object tracker report stored in {}", target.display());
        Ok(target)
    }

    fn after_change(&mut self) {
        debug!(
            "Object tracker status: file_names={} pending_to_synchronize={} written={} tokens={} current_id={}",
            self.file_names.len(),
            self.pending_to_synchronize.len(),
            self.written_objects.len(),
            self.token_to_id.len(),
            self.current_id
        );
        if self.reporting {
            self.report.push(TrackerSnapshot {
                timestamp: Utc::now(),
                file_names: self.file_names.len(),
                pending_to_synchronize: self.pending_to_synchronize.len(),
                written_objects: self.written_objects.len(),
                tokens: self.token_to_id.len(),
            });
        }
    }
}
