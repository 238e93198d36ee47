// Materializes an OrganizePlan on disk.
//
// Rules:
// - nothing that already exists is ever overwritten
// - copies land in a temp file first and are renamed into place, so a
//   destination is either complete or absent
// - under `move` each source is relocated at most once per run
// - a failure on one file is recorded and the run carries on

use chrono::Utc;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::history::MoveJournal;
use crate::core::plan::OrganizePlan;

/// Upper bound on `_<n>` suffixes tried for one file name.
const MAX_SUFFIX: usize = 10_000;

pub(crate) const BEST_FOLDER: &str = "best";

#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("Could not create output folder {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not write report {path:?}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Report serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    /// Copy files, originals stay in place
    Copy,
    /// Link to the originals
    #[default]
    Symlink,
    /// Relocate the originals
    Move,
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOperation::Copy => write!(f, "copy"),
            FileOperation::Symlink => write!(f, "symlink"),
            FileOperation::Move => write!(f, "move"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Planned,
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    Member,
    /// Extra placement of a group's best image under `best/`.
    BestMarker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub group: usize,
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub role: EntryRole,
    pub best: bool,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub succeeded: usize,
    pub planned: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed",
            self.succeeded, self.skipped, self.failed
        )?;
        if self.planned > 0 {
            write!(f, ", {} planned", self.planned)?;
        }
        Ok(())
    }
}

/// Per-file record of one organize run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizeReport {
    pub operation: FileOperation,
    pub dry_run: bool,
    pub started_at: String,
    pub output_root: PathBuf,
    pub entries: Vec<FileOutcome>,
    /// Completed moves that could not be written to the move journal.
    #[serde(default)]
    pub unjournaled: usize,
}

impl OrganizeReport {
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for entry in &self.entries {
            match entry.outcome {
                Outcome::Succeeded => summary.succeeded += 1,
                Outcome::Planned => summary.planned += 1,
                Outcome::Skipped { .. } => summary.skipped += 1,
                Outcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Failed { .. }))
    }

    /// Completed `(from, to)` relocations, in execution order.
    pub fn moves(&self) -> Vec<(PathBuf, PathBuf)> {
        if self.operation != FileOperation::Move || self.dry_run {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|e| e.role == EntryRole::Member && e.outcome == Outcome::Succeeded)
            .filter_map(|e| Some((e.source.clone(), e.destination.clone()?)))
            .collect()
    }

    pub fn save_json(&self, path: &Path) -> Result<(), OrganizeError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| OrganizeError::Report {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Where a file should go and whether it is already there.
enum Placement {
    Free(PathBuf),
    Present(PathBuf),
}

pub struct OutputOrganizer {
    operation: FileOperation,
    dry_run: bool,
    progress: Option<ProgressBar>,
    /// source -> destination of every completed move this run
    moved: HashMap<PathBuf, PathBuf>,
    /// destinations claimed this run, with the source that claimed them
    claimed: HashMap<PathBuf, PathBuf>,
    created_dirs: HashSet<PathBuf>,
    journal: Option<MoveJournal>,
    unjournaled: usize,
}

impl OutputOrganizer {
    pub fn new(operation: FileOperation) -> Self {
        Self {
            operation,
            dry_run: false,
            progress: None,
            moved: HashMap::new(),
            claimed: HashMap::new(),
            created_dirs: HashSet::new(),
            journal: None,
            unjournaled: 0,
        }
    }

    /// Resolve destinations and report them without touching the filesystem.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Append every completed move to `journal` as soon as it happens.
    pub fn with_journal(mut self, journal: MoveJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn operation(&self) -> FileOperation {
        self.operation
    }

    /// Execute `plan`. Only a failure to create the output root is fatal;
    /// everything else is recorded per file.
    pub fn apply(mut self, plan: &OrganizePlan) -> Result<OrganizeReport, OrganizeError> {
        let root = plan.output_root();
        if !self.dry_run {
            fs::create_dir_all(root).map_err(|source| OrganizeError::OutputDir {
                path: root.to_path_buf(),
                source,
            })?;
        }

        let mut report = OrganizeReport {
            operation: self.operation,
            dry_run: self.dry_run,
            started_at: Utc::now().to_rfc3339(),
            output_root: root.to_path_buf(),
            entries: Vec::with_capacity(plan.file_count()),
            unjournaled: 0,
        };

        for group in &plan.groups {
            let dir = root.join(&group.folder);

            for member in &group.members {
                let is_best = group.best.as_deref() == Some(member.as_path());
                let (destination, outcome) = self.place(member, &dir, self.operation);
                log_outcome(member, destination.as_deref(), &outcome);
                report.entries.push(FileOutcome {
                    group: group.index,
                    source: member.clone(),
                    destination,
                    role: EntryRole::Member,
                    best: is_best,
                    outcome,
                });
                if let Some(progress) = &self.progress {
                    progress.inc(1);
                }
            }

            if let Some(best) = &group.best {
                let entry = self.mark_best(group.index, best, &dir.join(BEST_FOLDER));
                log_outcome(best, entry.destination.as_deref(), &entry.outcome);
                report.entries.push(entry);
            }
        }

        if let Some(progress) = &self.progress {
            progress.finish_and_clear();
        }
        report.unjournaled = self.unjournaled;
        Ok(report)
    }

    fn mark_best(&mut self, group: usize, best: &Path, best_dir: &Path) -> FileOutcome {
        let (destination, outcome) = match self.operation {
            FileOperation::Copy | FileOperation::Symlink => {
                self.place(best, best_dir, self.operation)
            }
            FileOperation::Move if self.dry_run => {
                self.place(best, best_dir, FileOperation::Symlink)
            }
            FileOperation::Move => match self.moved.get(best).cloned() {
                Some(moved_to) => self.place(&moved_to, best_dir, FileOperation::Symlink),
                None => (
                    None,
                    Outcome::Skipped {
                        reason: "best image was not moved".to_string(),
                    },
                ),
            },
        };

        FileOutcome {
            group,
            source: best.to_path_buf(),
            destination,
            role: EntryRole::BestMarker,
            best: true,
            outcome,
        }
    }

    fn place(
        &mut self,
        source: &Path,
        dir: &Path,
        operation: FileOperation,
    ) -> (Option<PathBuf>, Outcome) {
        if operation == FileOperation::Move {
            if let Some(previous) = self.moved.get(source) {
                return (
                    Some(previous.clone()),
                    Outcome::Skipped {
                        reason: "already moved in this run".to_string(),
                    },
                );
            }
        }

        if fs::symlink_metadata(source).is_err() {
            return (
                None,
                Outcome::Failed {
                    reason: "source file does not exist".to_string(),
                },
            );
        }

        let Some(file_name) = source.file_name() else {
            return (
                None,
                Outcome::Failed {
                    reason: "source has no file name".to_string(),
                },
            );
        };

        let placement = match self.resolve(source, dir, Path::new(file_name), operation) {
            Ok(placement) => placement,
            Err(e) => return (None, Outcome::Failed { reason: e.to_string() }),
        };

        let destination = match placement {
            Placement::Present(existing) => {
                return (
                    Some(existing),
                    Outcome::Skipped {
                        reason: "already present".to_string(),
                    },
                );
            }
            Placement::Free(destination) => destination,
        };

        self.claimed
            .insert(destination.clone(), source.to_path_buf());

        if self.dry_run {
            if operation == FileOperation::Move {
                self.moved
                    .insert(source.to_path_buf(), destination.clone());
            }
            return (Some(destination), Outcome::Planned);
        }

        if let Err(e) = self.ensure_dir(dir) {
            return (
                Some(destination),
                Outcome::Failed {
                    reason: format!("could not create {}: {}", dir.display(), e),
                },
            );
        }

        let result = match operation {
            FileOperation::Copy => copy_atomic(source, &destination),
            FileOperation::Symlink => symlink_to(source, &destination),
            FileOperation::Move => move_file(source, &destination),
        };

        match result {
            Ok(()) => {
                if operation == FileOperation::Move {
                    self.moved
                        .insert(source.to_path_buf(), destination.clone());
                    self.journal_move(source, &destination);
                }
                (Some(destination), Outcome::Succeeded)
            }
            Err(e) => (
                Some(destination),
                Outcome::Failed {
                    reason: e.to_string(),
                },
            ),
        }
    }

    fn journal_move(&mut self, source: &Path, destination: &Path) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if let Err(e) = journal.append(source, destination) {
            log::warn!(
                "Could not journal move {} -> {}: {}",
                source.display(),
                destination.display(),
                e
            );
            self.unjournaled += 1;
        }
    }

    fn ensure_dir(&mut self, dir: &Path) -> io::Result<()> {
        if self.created_dirs.contains(dir) {
            return Ok(());
        }
        fs::create_dir_all(dir)?;
        self.created_dirs.insert(dir.to_path_buf());
        Ok(())
    }

    /// Find the first of `name`, `stem_1.ext`, `stem_2.ext`, ... that either
    /// already holds `source` or is free.
    fn resolve(
        &self,
        source: &Path,
        dir: &Path,
        name: &Path,
        operation: FileOperation,
    ) -> io::Result<Placement> {
        for n in 0..MAX_SUFFIX {
            let candidate = dir.join(suffixed_name(name, n));

            if let Some(owner) = self.claimed.get(&candidate) {
                if owner == source {
                    return Ok(Placement::Present(candidate));
                }
                continue;
            }

            match fs::symlink_metadata(&candidate) {
                Ok(_) => {
                    if holds_source(source, &candidate, operation) {
                        return Ok(Placement::Present(candidate));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(Placement::Free(candidate));
                }
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::other(format!(
            "no free name for {} in {}",
            name.display(),
            dir.display()
        )))
    }
}

fn log_outcome(source: &Path, destination: Option<&Path>, outcome: &Outcome) {
    let dest = destination
        .map(|d| d.display().to_string())
        .unwrap_or_default();
    match outcome {
        Outcome::Succeeded => log::debug!("{} -> {}", source.display(), dest),
        Outcome::Planned => log::debug!("[dry-run] {} -> {}", source.display(), dest),
        Outcome::Skipped { reason } => {
            log::info!("Skipped {} ({}): {}", source.display(), dest, reason)
        }
        Outcome::Failed { reason } => log::warn!("Failed {}: {}", source.display(), reason),
    }
}

/// `photo.jpg`, `photo_1.jpg`, `photo_2.jpg`, ...
fn suffixed_name(name: &Path, n: usize) -> PathBuf {
    if n == 0 {
        return name.to_path_buf();
    }
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.extension() {
        Some(ext) => PathBuf::from(format!("{}_{}.{}", stem, n, ext.to_string_lossy())),
        None => PathBuf::from(format!("{}_{}", stem, n)),
    }
}

/// Whether the existing `candidate` already represents `source` for the given
/// operation, making a new placement redundant.
fn holds_source(source: &Path, candidate: &Path, operation: FileOperation) -> bool {
    let same_file = match (fs::canonicalize(source), fs::canonicalize(candidate)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };

    match operation {
        FileOperation::Symlink => {
            let is_link = fs::symlink_metadata(candidate)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            is_link && same_file
        }
        FileOperation::Copy => {
            let is_file = fs::symlink_metadata(candidate)
                .map(|m| m.file_type().is_file())
                .unwrap_or(false);
            is_file && (same_file || same_content(source, candidate).unwrap_or(false))
        }
        // The source stays put when its content already sits at the destination.
        FileOperation::Move => {
            let is_file = fs::symlink_metadata(candidate)
                .map(|m| m.file_type().is_file())
                .unwrap_or(false);
            is_file && (same_file || same_content(source, candidate).unwrap_or(false))
        }
    }
}

pub(crate) fn content_digest(path: &Path) -> io::Result<blake3::Hash> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize())
}

fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(content_digest(a)? == content_digest(b)?)
}

/// Copy through a temp file in the destination folder, then rename it into
/// place without replacing anything that appeared in the meantime.
fn copy_atomic(source: &Path, destination: &Path) -> io::Result<()> {
    let dir = destination
        .parent()
        .ok_or_else(|| io::Error::other("destination has no parent folder"))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".taggy-")
        .suffix(".part")
        .tempfile_in(dir)?;
    let mut input = File::open(source)?;
    io::copy(&mut input, temp.as_file_mut())?;
    temp.as_file().sync_all()?;

    temp.persist_noclobber(destination).map_err(|e| e.error)?;
    Ok(())
}

fn symlink_to(source: &Path, link: &Path) -> io::Result<()> {
    let target = fs::canonicalize(source)?;
    create_symlink(&target, link)
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Relocate `source`. A hard link claims the destination atomically; when
/// that is impossible (another filesystem) the file is copied atomically
/// instead. The source is removed only once the destination is complete.
/// An existing destination is never replaced.
pub(crate) fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    match fs::hard_link(source, destination) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(e),
        Err(e) => {
            log::debug!(
                "Hard link {} failed ({}); falling back to copy",
                source.display(),
                e
            );
            copy_atomic(source, destination)?;
        }
    }
    fs::remove_file(source)
}
