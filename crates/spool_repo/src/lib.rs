//! On-disk staging for crash recovery of in-flight scheduler work.
//!
//! Actions and commands move through fixed stage directories as the
//! pipeline advances them; after a restart the spool inspector re-drains
//! whatever was left behind. Entries are `<id>.json` files and stage
//! transitions are same-filesystem renames, so a move is atomic.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("no entry '{id}' in stage {stage:?}")]
    NotFound { stage: Stage, id: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpoolError>;

/// The fixed set of spool stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ActionNew,
    ActionInvalid,
    ActionInflight,
    ActionDone,
    CommandReady,
    CommandInflight,
    CommandReturned,
    CommandDone,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::ActionNew,
        Stage::ActionInvalid,
        Stage::ActionInflight,
        Stage::ActionDone,
        Stage::CommandReady,
        Stage::CommandInflight,
        Stage::CommandReturned,
        Stage::CommandDone,
    ];

    pub fn relative_path(&self) -> &'static str {
        match self {
            Stage::ActionNew => "action/new",
            Stage::ActionInvalid => "action/invalid",
            Stage::ActionInflight => "action/inflight",
            Stage::ActionDone => "action/done",
            Stage::CommandReady => "command/ready",
            Stage::CommandInflight => "command/inflight",
            Stage::CommandReturned => "command/returned",
            Stage::CommandDone => "command/done",
        }
    }
}

/// Storage behind the spool stages. The filesystem implementation is the
/// production one; the in-memory one backs tests.
pub trait SpoolRepo: Send + Sync {
    /// Write a new entry into a stage. Overwrites an entry with the same id.
    fn enqueue(&self, stage: Stage, id: &str, blob: &[u8]) -> Result<()>;

    /// Move an entry between stages, atomically for the filesystem case.
    fn move_entry(&self, from: Stage, to: Stage, id: &str) -> Result<()>;

    /// Ids currently present in a stage.
    fn list(&self, stage: Stage) -> Result<Vec<String>>;

    fn read(&self, stage: Stage, id: &str) -> Result<Vec<u8>>;

    fn remove(&self, stage: Stage, id: &str) -> Result<()>;

    /// Attach a human-readable reason next to an entry (used for
    /// `action/invalid` rejections).
    fn write_sidecar(&self, stage: Stage, id: &str, reason: &str) -> Result<()>;
}

/// Spool rooted in a directory tree, one subdirectory per stage.
pub struct FsSpool {
    root: PathBuf,
}

impl FsSpool {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for stage in Stage::ALL {
            fs::create_dir_all(root.join(stage.relative_path()))?;
        }
        Ok(FsSpool { root })
    }

    fn entry_path(&self, stage: Stage, id: &str) -> PathBuf {
        self.root.join(stage.relative_path()).join(format!("{id}.json"))
    }
}

impl SpoolRepo for FsSpool {
    fn enqueue(&self, stage: Stage, id: &str, blob: &[u8]) -> Result<()> {
        let path = self.entry_path(stage, id);
        // temp file + fsync + rename keeps partially written entries out
        // of the stage directories
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(blob)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn move_entry(&self, from: Stage, to: Stage, id: &str) -> Result<()> {
        let src = self.entry_path(from, id);
        if !src.exists() {
            return Err(SpoolError::NotFound { stage: from, id: id.to_string() });
        }
        fs::rename(src, self.entry_path(to, id))?;
        Ok(())
    }

    fn list(&self, stage: Stage) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(stage.relative_path()))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read(&self, stage: Stage, id: &str) -> Result<Vec<u8>> {
        let path = self.entry_path(stage, id);
        if !path.exists() {
            return Err(SpoolError::NotFound { stage, id: id.to_string() });
        }
        Ok(fs::read(path)?)
    }

    fn remove(&self, stage: Stage, id: &str) -> Result<()> {
        let path = self.entry_path(stage, id);
        if !path.exists() {
            return Err(SpoolError::NotFound { stage, id: id.to_string() });
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn write_sidecar(&self, stage: Stage, id: &str, reason: &str) -> Result<()> {
        let path = self
            .root
            .join(stage.relative_path())
            .join(format!("{id}.reason"));
        fs::write(path, reason)?;
        Ok(())
    }
}

type MemStage = BTreeMap<String, Vec<u8>>;

/// Purely in-memory spool for tests.
#[derive(Default)]
pub struct MemSpool {
    stages: Mutex<BTreeMap<Stage, MemStage>>,
    sidecars: Mutex<BTreeMap<(Stage, String), String>>,
}

impl MemSpool {
    pub fn new() -> Self {
        MemSpool::default()
    }

    pub fn sidecar(&self, stage: Stage, id: &str) -> Option<String> {
        self.sidecars
            .lock()
            .unwrap()
            .get(&(stage, id.to_string()))
            .cloned()
    }
}

impl SpoolRepo for MemSpool {
    fn enqueue(&self, stage: Stage, id: &str, blob: &[u8]) -> Result<()> {
        self.stages
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .insert(id.to_string(), blob.to_vec());
        Ok(())
    }

    fn move_entry(&self, from: Stage, to: Stage, id: &str) -> Result<()> {
        let mut stages = self.stages.lock().unwrap();
        let blob = stages
            .entry(from)
            .or_default()
            .remove(id)
            .ok_or_else(|| SpoolError::NotFound { stage: from, id: id.to_string() })?;
        stages.entry(to).or_default().insert(id.to_string(), blob);
        Ok(())
    }

    fn list(&self, stage: Stage) -> Result<Vec<String>> {
        Ok(self
            .stages
            .lock()
            .unwrap()
            .get(&stage)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn read(&self, stage: Stage, id: &str) -> Result<Vec<u8>> {
        self.stages
            .lock()
            .unwrap()
            .get(&stage)
            .and_then(|m| m.get(id).cloned())
            .ok_or_else(|| SpoolError::NotFound { stage, id: id.to_string() })
    }

    fn remove(&self, stage: Stage, id: &str) -> Result<()> {
        self.stages
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SpoolError::NotFound { stage, id: id.to_string() })
    }

    fn write_sidecar(&self, stage: Stage, id: &str, reason: &str) -> Result<()> {
        self.sidecars
            .lock()
            .unwrap()
            .insert((stage, id.to_string()), reason.to_string());
        Ok(())
    }
}
