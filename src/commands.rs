use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use taggy::config::{split_labels, TaggyConfig};
use taggy::core::history::{MoveHistory, MoveJournal, RestoreSelection};
use taggy::core::organize::{EntryRole, FileOperation, OrganizeReport, Outcome, OutputOrganizer};
use taggy::core::plan::OrganizePlan;
use taggy::core::record::ImageRecord;
use taggy::core::scoring::ScoringMethod;
use taggy::core::faces::load_face_detector;
use taggy::services::duplicates::{plan_duplicates, DuplicateOptions};
use taggy::services::embedding::{extract_embeddings, EmbeddingCache, EmbeddingProvider, ProviderKind};
use taggy::services::metadata::{save_sidecars, save_tags};
use taggy::services::scanner::ImageScanner;
use taggy::services::search::{plan_search_results, search};
use taggy::services::tagger::{label_source, plan_by_tag, Tagger};

const CACHE_FILE: &str = ".taggy/embeddings.json";

#[derive(Args, Debug)]
pub struct DuplicatesArgs {
    /// Folder containing the images
    #[arg(short, long, value_name = "DIR")]
    pub images_path: PathBuf,
    /// Where groups are written (default: `<images>/taggy_output/duplicates`)
    #[arg(short, long, value_name = "DIR")]
    pub output_folder: Option<PathBuf>,
    /// Labels used to name group folders (repeatable or comma separated)
    #[arg(short, long = "labels", value_name = "LABEL")]
    pub labels: Vec<String>,
    /// File operation applied to grouped images
    #[arg(long, value_enum)]
    pub operation: Option<FileOperation>,
    /// Minimum similarity for two images to be duplicates, in (0, 1]
    #[arg(short = 't', long, value_name = "THRESHOLD")]
    pub similarity_threshold: Option<f32>,
    /// Haar cascade (JSON) used to reward faces when picking the best image
    #[arg(long, value_name = "FILE")]
    pub face_cascade: Option<PathBuf>,
    /// Pick a best image per group and place it under `best/`
    #[arg(short = 'b', long)]
    pub propose_best: bool,
    /// Scoring policy used with --propose-best
    #[arg(long, value_enum)]
    pub best_method: Option<ScoringMethod>,
    /// Precomputed embedding store (JSON)
    #[arg(long, value_name = "FILE")]
    pub embeddings: Option<PathBuf>,
    /// Only show what would be done
    #[arg(long)]
    pub dry_run: bool,
    /// Write a JSON report of every file operation
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
    /// Do not ask before moving files
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Operations that keep the originals in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LinkOperation {
    Copy,
    Symlink,
}

impl From<LinkOperation> for FileOperation {
    fn from(op: LinkOperation) -> Self {
        match op {
            LinkOperation::Copy => FileOperation::Copy,
            LinkOperation::Symlink => FileOperation::Symlink,
        }
    }
}

#[derive(Args, Debug)]
pub struct TagArgs {
    /// Folder containing the images
    #[arg(short, long, value_name = "DIR")]
    pub images_path: PathBuf,
    /// Minimum probability for a tag to be kept
    #[arg(short = 't', long)]
    pub threshold: Option<f32>,
    /// Maximum number of tags per image
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,
    /// Candidate labels (repeatable or comma separated)
    #[arg(short, long = "labels", value_name = "LABEL")]
    pub labels: Vec<String>,
    /// Save all results into one JSON file
    #[arg(long, value_name = "FILE")]
    pub one_output_json: Option<PathBuf>,
    /// Write a `<image>.json` next to every image
    #[arg(short = 'j', long)]
    pub create_many_output_jsons: bool,
    /// File operation used with --output-folder
    #[arg(long, value_enum, default_value = "symlink")]
    pub operation: LinkOperation,
    /// Group images into one folder per tag (images may repeat)
    #[arg(short, long, value_name = "DIR")]
    pub output_folder: Option<PathBuf>,
    /// Precomputed embedding store (JSON)
    #[arg(long, value_name = "FILE")]
    pub embeddings: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Folder containing the images
    #[arg(short, long, value_name = "DIR")]
    pub images_path: PathBuf,
    /// Text query
    #[arg(short, long)]
    pub query: String,
    /// Folder to place the results in
    #[arg(short, long, value_name = "DIR")]
    pub output_folder: Option<PathBuf>,
    /// File operation used with --output-folder
    #[arg(long, value_enum, default_value = "copy")]
    pub operation: FileOperation,
    /// Number of results
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,
    /// Precomputed embedding store (JSON)
    #[arg(long, value_name = "FILE")]
    pub embeddings: Option<PathBuf>,
    /// Do not ask before moving files
    #[arg(short = 'y', long)]
    pub yes: bool,
}

pub fn run_duplicates(args: DuplicatesArgs, config: &TaggyConfig) -> Result<()> {
    let defaults = &config.defaults;
    let operation = args.operation.unwrap_or(defaults.operation);
    let threshold = args
        .similarity_threshold
        .unwrap_or(defaults.similarity_threshold);
    let method = args.best_method.unwrap_or(defaults.best_method);
    let labels = labels_or_default(&args.labels, config);
    let output = args
        .output_folder
        .clone()
        .unwrap_or_else(|| args.images_path.join("taggy_output").join("duplicates"));

    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!("Similarity threshold must be in (0, 1], got {}", threshold);
    }

    println!("▶ Finding duplicates in: {}", args.images_path.display());
    let (provider, records) =
        embed_folder(
            &args.images_path,
            &output,
            args.embeddings.as_deref(),
            config,
            args.dry_run,
        )?;

    let labeler = label_source(provider.as_ref(), &labels);
    let policy = args.propose_best.then(|| {
        let detector = match method {
            ScoringMethod::Advanced => load_face_detector(
                args.face_cascade
                    .as_deref()
                    .or(defaults.face_cascade_path.as_deref()),
            ),
            ScoringMethod::Laplacian => None,
        };
        method.build(config.scoring.sanitized(), detector)
    });

    let options = DuplicateOptions {
        threshold,
        policy: policy.as_deref(),
        labeler: labeler.as_ref(),
        include_unique: operation != FileOperation::Move,
    };
    let run = benchmark("clustering", || plan_duplicates(&records, &output, &options))?;

    if run.clustering.groups.is_empty() {
        println!("No duplicates found.");
        return Ok(());
    }

    println!(
        "Found {} duplicate group(s) covering {} image(s):",
        run.clustering.groups.len(),
        run.duplicate_count()
    );
    for group in run.plan.groups.iter().filter(|g| g.index <= run.clustering.groups.len()) {
        println!("\n✨ Group {} → {}", group.index, group.folder.display());
        if let Some(best) = &group.best {
            println!("   🏆 Best ({}) → {}", method, best.display());
        }
        for member in &group.members {
            println!("   ▶ {}", member.display());
        }
    }

    if operation == FileOperation::Move && !args.dry_run && !args.yes && !confirm_move(run.duplicate_count())? {
        println!("Aborted; no files were changed.");
        return Ok(());
    }

    let report = organize(&run.plan, operation, args.dry_run)?;
    finish_report(&report, args.report.as_deref())
}

pub fn run_tag(args: TagArgs, config: &TaggyConfig) -> Result<()> {
    let threshold = args.threshold.unwrap_or(config.defaults.tag_threshold);
    let top_k = args.top_k.unwrap_or(config.defaults.top_k);
    let labels = labels_or_default(&args.labels, config);
    let exclude = args
        .output_folder
        .clone()
        .unwrap_or_else(|| args.images_path.join("taggy_output"));

    println!("▶ Tagging images in: {}", args.images_path.display());
    let (provider, records) =
        embed_folder(&args.images_path, &exclude, args.embeddings.as_deref(), config, false)?;

    let tagger = Tagger::new(provider.as_ref(), &labels)
        .with_context(|| format!("Could not embed labels with the {} provider", provider.name()))?;
    if tagger.is_empty() {
        anyhow::bail!("No labels to tag with");
    }

    let tagged = tagger.tag_records(&records, threshold, top_k);
    for record in &tagged {
        let tags: Vec<String> = record
            .tags
            .iter()
            .map(|t| format!("{} ({:.2})", t.tag, t.score))
            .collect();
        println!("   🏷️  {} → {}", record.file.display(), tags.join(", "));
    }

    if let Some(path) = &args.one_output_json {
        save_tags(&tagged, path)?;
        println!("✅ Saved tagging results to {}", path.display());
    }
    if args.create_many_output_jsons {
        let written = save_sidecars(&tagged)?;
        println!("✅ Wrote {} sidecar JSON file(s)", written);
    }
    if let Some(output) = &args.output_folder {
        let plan = plan_by_tag(output, &tagged);
        let report = organize(&plan, args.operation.into(), false)?;
        finish_report(&report, None)?;
    }
    Ok(())
}

pub fn run_search(args: SearchArgs, config: &TaggyConfig) -> Result<()> {
    let top_k = args.top_k.unwrap_or(config.defaults.top_k);
    let exclude = args
        .output_folder
        .clone()
        .unwrap_or_else(|| args.images_path.join("taggy_output"));

    println!(
        "▶ Searching {} for {:?}",
        args.images_path.display(),
        args.query
    );
    let (provider, records) =
        embed_folder(&args.images_path, &exclude, args.embeddings.as_deref(), config, false)?;

    let hits = search(provider.as_ref(), &args.query, &records, top_k)
        .with_context(|| format!("Could not embed query {:?}", args.query))?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!("   {}. {} ({:.3})", rank + 1, hit.id.display(), hit.score);
    }

    if let Some(output) = &args.output_folder {
        if args.operation == FileOperation::Move && !args.yes && !confirm_move(hits.len())? {
            println!("Aborted; no files were changed.");
            return Ok(());
        }
        let plan = plan_search_results(output, &args.query, &hits);
        let report = organize(&plan, args.operation, false)?;
        finish_report(&report, None)?;
    }
    Ok(())
}

pub fn run_history_list(path: &Path) -> Result<()> {
    let history = MoveHistory::new(path);
    let records = history
        .load()
        .with_context(|| format!("Could not open history file {:?}", history.path()))?;

    println!("🗂️  Move History:");
    if records.is_empty() {
        println!("   (empty)");
    }
    for (i, record) in records.iter().enumerate() {
        println!("[{}] {} ({} file(s))", i, record.timestamp, record.moves.len());
        for entry in &record.moves {
            println!("     {} → {}", entry.from.display(), entry.to.display());
        }
    }
    Ok(())
}

pub fn run_history_restore(path: &Path, record: Option<usize>, all: bool) -> Result<()> {
    let history = MoveHistory::new(path);
    let selection = match (all, record) {
        (true, _) => RestoreSelection::All,
        (false, Some(index)) => RestoreSelection::Record(index),
        (false, None) => RestoreSelection::Latest,
    };

    let summary = history
        .restore(selection)
        .with_context(|| format!("Could not restore from {:?}", history.path()))?;
    println!("🔄 Restored {} file(s), skipped {}", summary.restored, summary.skipped);
    if summary.failed > 0 {
        eprintln!(
            "❌ {} file(s) could not be moved back and stay in the history",
            summary.failed
        );
    }
    if summary.markers_removed > 0 {
        println!("🏆 Removed {} best-image link(s)", summary.markers_removed);
    }
    println!(
        "🧹 Updated history, removed {} record(s)",
        summary.records_removed
    );
    Ok(())
}

/// Scan `images`, leaving out `exclude`, and embed everything found.
fn embed_folder(
    images: &Path,
    exclude: &Path,
    store_override: Option<&Path>,
    config: &TaggyConfig,
    dry_run: bool,
) -> Result<(Box<dyn EmbeddingProvider>, Vec<ImageRecord>)> {
    let (kind, store) = match store_override {
        Some(store) => (ProviderKind::Precomputed, Some(store)),
        None => (config.embedding.provider, config.embedding.store.as_deref()),
    };
    let provider = kind
        .build(store, images)
        .context("Could not set up the embedding provider")?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for images…");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let paths = ImageScanner::new()
        .exclude(exclude)
        .with_progress(spinner.clone())
        .scan(images)?;
    spinner.finish_with_message("Scan complete");

    if paths.is_empty() {
        anyhow::bail!("No images found in {}", images.display());
    }

    let mut cache = (config.embedding.cache && kind == ProviderKind::Perceptual)
        .then(|| EmbeddingCache::load(&images.join(CACHE_FILE), provider.name()));

    println!("▶ Embedding {} image(s) with {}…", paths.len(), provider.name());
    let bar = progress_bar(paths.len() as u64)?;
    let extraction = benchmark("embedding all images", || {
        extract_embeddings(provider.as_ref(), &paths, cache.as_mut(), Some(&bar))
    });
    bar.finish_and_clear();

    match cache.as_mut() {
        Some(_) if dry_run => log::debug!("Dry run; embedding cache left unchanged"),
        Some(cache) => {
            if let Err(e) = cache.save() {
                log::warn!("Could not save embedding cache: {}", e);
            }
        }
        None => {}
    }
    if extraction.cache_hits > 0 {
        println!("   {} embedding(s) served from cache", extraction.cache_hits);
    }
    if !extraction.failures.is_empty() {
        println!("⚠️  Skipped {} image(s) that could not be embedded", extraction.failures.len());
    }
    if extraction.records.is_empty() {
        anyhow::bail!("None of the {} image(s) could be embedded", paths.len());
    }

    Ok((provider, extraction.records))
}

fn organize(plan: &OrganizePlan, operation: FileOperation, dry_run: bool) -> Result<OrganizeReport> {
    let bar = progress_bar(plan.file_count() as u64)?;
    let mut organizer = OutputOrganizer::new(operation)
        .dry_run(dry_run)
        .with_progress(bar);

    // Opened before anything moves so each move is on disk as it happens.
    let mut journal_path = None;
    if operation == FileOperation::Move && !dry_run {
        match MoveJournal::open(plan.output_root()) {
            Ok(journal) => {
                journal_path = Some(journal.path().to_path_buf());
                organizer = organizer.with_journal(journal);
            }
            Err(e) => log::warn!(
                "Could not open move history in {}: {}",
                plan.output_root().display(),
                e
            ),
        }
    }

    let report = organizer.apply(plan)?;

    if operation == FileOperation::Move && !dry_run {
        let moved = report
            .entries
            .iter()
            .filter(|e| e.role == EntryRole::Member && matches!(e.outcome, Outcome::Succeeded))
            .count();
        let recorded = match &journal_path {
            Some(_) => moved.saturating_sub(report.unjournaled),
            None => 0,
        };
        if let (Some(path), true) = (&journal_path, recorded > 0) {
            println!("✅ Recorded {} move(s) in {}", recorded, path.display());
        }
        if recorded < moved {
            eprintln!(
                "⚠️  {} move(s) are missing from the history and cannot be restored",
                moved - recorded
            );
        }
    }
    Ok(report)
}

fn finish_report(report: &OrganizeReport, save_to: Option<&Path>) -> Result<()> {
    for entry in report.failures() {
        if let Outcome::Failed { reason } = &entry.outcome {
            eprintln!("❌ {}: {}", entry.source.display(), reason);
        }
    }
    if report.dry_run {
        for entry in &report.entries {
            if let (Outcome::Planned, Some(dest)) = (&entry.outcome, &entry.destination) {
                let marker = if entry.role == EntryRole::BestMarker { "🏆" } else { "📦" };
                println!(
                    "   {} [dry-run] {} {} → {}",
                    marker,
                    report.operation,
                    entry.source.display(),
                    dest.display()
                );
            }
        }
    }

    println!("\n{} ({}): {}", report.output_root.display(), report.operation, report.summary());
    if report.dry_run {
        println!("⚠️  Dry-run only; no files were changed.");
    }

    if let Some(path) = save_to {
        report.save_json(path)?;
        println!("✅ Wrote report to {}", path.display());
    }
    Ok(())
}

fn labels_or_default(raw: &[String], config: &TaggyConfig) -> Vec<String> {
    let labels = split_labels(raw);
    if labels.is_empty() {
        split_labels(&config.defaults.labels)
    } else {
        labels
    }
}

fn confirm_move(count: usize) -> Result<bool> {
    Ok(Confirm::new()
        .with_prompt(format!("Move {} file(s) out of their folders?", count))
        .default(false)
        .interact()?)
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    Ok(bar)
}

/// Run `f()`, log how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    log::info!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::fs;
    use taggy::core::history::HISTORY_FILE;
    use tempfile::TempDir;

    #[test]
    fn test_labels_fall_back_to_config() {
        let config = TaggyConfig::default();
        assert_eq!(labels_or_default(&[], &config), vec!["random", "general"]);
        assert_eq!(
            labels_or_default(&["cat,dog".to_string()], &config),
            vec!["cat", "dog"]
        );
    }

    #[test]
    fn test_move_still_reports_when_history_cannot_be_written() {
        let dir = TempDir::new().unwrap();
        let images = dir.path().join("images");
        let output = dir.path().join("output");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("a.jpg"), b"aaa").unwrap();
        fs::create_dir_all(output.join(HISTORY_FILE)).unwrap();

        let mut plan = OrganizePlan::new(&output);
        plan.push_group(None, None, vec![images.join("a.jpg")]);
        let report = organize(&plan, FileOperation::Move, false).unwrap();
        assert_eq!(report.summary().succeeded, 1);
        assert!(output.join("group_1/a.jpg").exists());

        let report_path = dir.path().join("report.json");
        finish_report(&report, Some(&report_path)).unwrap();
        assert!(report_path.is_file());
    }

    #[test]
    fn test_moves_are_journaled_before_the_report() {
        let dir = TempDir::new().unwrap();
        let images = dir.path().join("images");
        let output = dir.path().join("output");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("a.jpg"), b"aaa").unwrap();

        let mut plan = OrganizePlan::new(&output);
        plan.push_group(None, None, vec![images.join("a.jpg")]);
        let report = organize(&plan, FileOperation::Move, false).unwrap();
        assert_eq!(report.unjournaled, 0);

        let records = MoveHistory::new(&output).load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].moves[0].from, images.join("a.jpg"));
    }

    #[test]
    fn test_dry_run_leaves_embedding_cache_alone() {
        let dir = TempDir::new().unwrap();
        let images = dir.path().join("images");
        fs::create_dir_all(&images).unwrap();
        let img = GrayImage::from_fn(32, 32, |x, y| Luma([((x * 5 + y * 3) % 256) as u8]));
        img.save(images.join("a.png")).unwrap();
        let config = TaggyConfig::default();
        let output = images.join("taggy_output");

        embed_folder(&images, &output, None, &config, true).unwrap();
        assert!(!images.join(CACHE_FILE).exists());

        embed_folder(&images, &output, None, &config, false).unwrap();
        assert!(images.join(CACHE_FILE).is_file());
    }

    #[test]
    fn test_link_operation_never_moves() {
        assert_eq!(FileOperation::from(LinkOperation::Copy), FileOperation::Copy);
        assert_eq!(FileOperation::from(LinkOperation::Symlink), FileOperation::Symlink);
    }
}
