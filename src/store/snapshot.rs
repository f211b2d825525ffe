//! JSON state file
//!
//! Keeps profile objects (metadata, spec and status) across restarts so a
//! recorded remote profile ID is never forgotten and pending finalizers still
//! run for profiles removed while the controller was down.

use crate::resources::Profile;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    profiles: Vec<Profile>,
}

/// Location of the state file
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load saved profiles; a missing file is an empty state
    pub fn load(&self) -> Result<Vec<Profile>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(crate::OperatorError::Config(format!(
                "Unsupported state file version {} in {}",
                snapshot.version,
                self.path.display()
            )));
        }

        tracing::info!(
            path = %self.path.display(),
            profiles = snapshot.profiles.len(),
            "Loaded state file"
        );
        Ok(snapshot.profiles)
    }

    /// Atomically replace the state file
    pub fn save(&self, profiles: &[Profile]) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            profiles: profiles.to_vec(),
        };

        let mut tmp = NamedTempFile::new_in(&parent)?;
        serde_json::to_writer_pretty(&mut tmp, &snapshot)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ObjectMeta, ProfileSpec, ProfileStatus};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));
        assert!(file.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("nested").join("state.json"));

        let mut profile = Profile::new(ObjectMeta::new("home", "kids"), ProfileSpec::new("Kids", "creds"));
        profile.status = Some(ProfileStatus {
            profile_id: Some("abc123".to_string()),
            ..Default::default()
        });

        file.save(&[profile.clone()]).unwrap();
        let loaded = file.load().unwrap();

        assert_eq!(loaded, vec![profile]);
    }
}
