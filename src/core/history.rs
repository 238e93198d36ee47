use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::organize::{move_file, BEST_FOLDER};

pub const HISTORY_FILE: &str = ".taggy-history.jsonl";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No move history records to restore")]
    NoRecords,

    #[error("Invalid history index {index}; valid range is 0..{len}")]
    InvalidIndex { index: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveEntry {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// All files relocated by one `move` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub timestamp: String,
    pub moves: Vec<MoveEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    /// Entries whose moved file is gone or whose original path is taken.
    pub skipped: usize,
    pub failed: usize,
    /// Records with nothing left to restore, dropped from the journal.
    pub records_removed: usize,
    /// `best/` links that pointed at restored files.
    pub markers_removed: usize,
}

/// Which records a restore should undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSelection {
    Latest,
    Record(usize),
    All,
}

/// Append handle for one `move` run. Each completed move is written and
/// synced as its own line, so an interrupted run still leaves a journal of
/// what was moved. Lines share the run's timestamp and load back as one
/// record.
pub struct MoveJournal {
    path: PathBuf,
    timestamp: String,
    file: File,
    written: usize,
}

impl MoveJournal {
    pub fn open(output_root: &Path) -> Result<Self, HistoryError> {
        fs::create_dir_all(output_root)?;
        let path = output_root.join(HISTORY_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            timestamp: Utc::now().to_rfc3339(),
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn append(&mut self, from: &Path, to: &Path) -> Result<(), HistoryError> {
        let line = MoveRecord {
            timestamp: self.timestamp.clone(),
            moves: vec![MoveEntry {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            }],
        };
        writeln!(self.file, "{}", serde_json::to_string(&line)?)?;
        self.file.sync_data()?;
        self.written += 1;
        Ok(())
    }
}

/// JSON-lines journal of moves kept in the output folder.
pub struct MoveHistory {
    path: PathBuf,
}

enum EntryRestore {
    Restored,
    Vanished,
    Blocked,
    Failed,
}

impl MoveHistory {
    pub fn new(output_root: &Path) -> Self {
        Self {
            path: output_root.join(HISTORY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every parseable record, in file order. Consecutive lines of the same
    /// run are merged. Malformed lines are logged and skipped.
    pub fn load(&self) -> Result<Vec<MoveRecord>, HistoryError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records: Vec<MoveRecord> = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<MoveRecord>(&line) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("Skipping malformed history entry {}: {}", i, err);
                    continue;
                }
            };
            match records.last_mut() {
                Some(last) if last.timestamp == record.timestamp => {
                    last.moves.extend(record.moves)
                }
                _ => records.push(record),
            }
        }
        Ok(records)
    }

    /// Move files back to where they came from, then rewrite the journal.
    ///
    /// A failed entry is logged and the rest carry on. Entries that could
    /// not come back because their original path is taken or the move back
    /// failed stay in the journal; restored or vanished ones are dropped.
    pub fn restore(&self, selection: RestoreSelection) -> Result<RestoreSummary, HistoryError> {
        let mut records = self.load()?;
        if records.is_empty() {
            return Err(HistoryError::NoRecords);
        }

        let indices: Vec<usize> = match selection {
            RestoreSelection::All => (0..records.len()).collect(),
            RestoreSelection::Latest => vec![records.len() - 1],
            RestoreSelection::Record(index) => {
                if index >= records.len() {
                    return Err(HistoryError::InvalidIndex {
                        index,
                        len: records.len(),
                    });
                }
                vec![index]
            }
        };

        let mut summary = RestoreSummary::default();
        for &i in indices.iter().rev() {
            let record = &mut records[i];
            log::info!(
                "Restoring {} file(s) from record {}",
                record.moves.len(),
                record.timestamp
            );

            let mut left = Vec::new();
            for entry in record.moves.drain(..).rev() {
                match restore_one(&entry) {
                    EntryRestore::Restored => {
                        summary.restored += 1;
                        summary.markers_removed += remove_best_markers(&entry.to);
                    }
                    EntryRestore::Vanished => summary.skipped += 1,
                    EntryRestore::Blocked => {
                        summary.skipped += 1;
                        left.push(entry);
                    }
                    EntryRestore::Failed => {
                        summary.failed += 1;
                        left.push(entry);
                    }
                }
            }
            left.reverse();
            record.moves = left;
            if record.moves.is_empty() {
                summary.records_removed += 1;
            }
        }

        let mut content = String::new();
        for record in records.iter().filter(|r| !r.moves.is_empty()) {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }
        fs::write(&self.path, content)?;

        Ok(summary)
    }
}

fn restore_one(entry: &MoveEntry) -> EntryRestore {
    if fs::symlink_metadata(&entry.to).is_err() {
        log::warn!("{} no longer exists; skipping", entry.to.display());
        return EntryRestore::Vanished;
    }
    if fs::symlink_metadata(&entry.from).is_ok() {
        log::warn!("{} exists again; not overwriting", entry.from.display());
        return EntryRestore::Blocked;
    }
    if let Some(parent) = entry.from.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            log::warn!("Could not create {}: {}", parent.display(), e);
            return EntryRestore::Failed;
        }
    }
    match move_file(&entry.to, &entry.from) {
        Ok(()) => {
            log::info!("Restored {} -> {}", entry.to.display(), entry.from.display());
            EntryRestore::Restored
        }
        Err(e) => {
            log::warn!(
                "Failed to restore {} -> {}: {}",
                entry.to.display(),
                entry.from.display(),
                e
            );
            EntryRestore::Failed
        }
    }
}

/// Delete the symlinks in the group's `best/` folder that pointed at
/// `moved_to`, and the folder itself once empty.
fn remove_best_markers(moved_to: &Path) -> usize {
    let (Some(dir), Some(name)) = (moved_to.parent(), moved_to.file_name()) else {
        return 0;
    };
    let best_dir = dir.join(BEST_FOLDER);
    let Ok(entries) = fs::read_dir(&best_dir) else {
        return 0;
    };

    let mut targets = vec![moved_to.to_path_buf()];
    if let Ok(canonical) = fs::canonicalize(dir) {
        targets.push(canonical.join(name));
    }

    let mut removed = 0;
    for entry in entries.flatten() {
        let link = entry.path();
        let Ok(target) = fs::read_link(&link) else {
            continue;
        };
        if !targets.contains(&target) {
            continue;
        }
        match fs::remove_file(&link) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Could not remove marker {}: {}", link.display(), e),
        }
    }

    if removed > 0 && fs::remove_dir(&best_dir).is_ok() {
        log::debug!("Removed empty {}", best_dir.display());
    }
    removed
}
