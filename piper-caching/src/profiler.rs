//! Per function access profile of the cache

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PROFILE_FILE_NAME: &str = "cache_profiling.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessCount {
    pub get: u64,
    pub put: u64,
}

/// function -> parameter -> key -> counts
type Records = BTreeMap<String, BTreeMap<String, BTreeMap<String, AccessCount>>>;

#[derive(Debug)]
pub struct Profiler {
    started_at: DateTime<Utc>,
    records: Records,
}

#[derive(Serialize)]
struct ProfileReport<'a> {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    functions: &'a Records,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            records: BTreeMap::new(),
        }
    }

    fn slot(&mut self, function: &str, parameter: &str, key: &str) -> &mut AccessCount {
        self.records
            .entry(function.to_string())
            .or_default()
            .entry(parameter.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
    }

    pub fn record_get(&mut self, function: &str, parameter: &str, key: &str) {
        self.slot(function, parameter, key).get += 1;
    }

    pub fn record_put(&mut self, function: &str, parameter: &str, key: &str) {
        self.slot(function, parameter, key).put += 1;
    }

    pub fn count(&self, function: &str, parameter: &str, key: &str) -> AccessCount {
        self.records
            .get(function)
            .and_then(|params| params.get(parameter))
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or_default()
    }

    /// Write the profile as JSON into `dir`
    pub fn write(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let report = ProfileReport {
            started_at: self.started_at,
            finished_at: Utc::now(),
            functions: &self.records,
        };
        let target = dir.join(PROFILE_FILE_NAME);
        std::fs::write(&target, serde_json::to_vec_pretty(&report)?)?;
        Ok(target)
    }
}
