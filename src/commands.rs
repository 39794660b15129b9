//! Command handlers behind the binary. Each one wires the engine together
//! from a validated [`Config`] and prints a summary or JSON to stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};

use crate::actions::{Action, ActionKind, MutationExecutor, OperationSummary};
use crate::cache::ChecksumCache;
use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::checksum::ChecksumService;
use crate::cli::{CleanMode, Command, ManifestCommand};
use crate::config::Config;
use crate::duplicates::{DuplicateDetector, DuplicateReport, Recommendation};
use crate::inventory::Inventory;
use crate::journal::{Journal, Outcome};
use crate::manifest::Manifest;
use crate::progress::{BarReporter, ProgressReporter, SilentReporter};
use crate::scanner::MirrorScanner;
use crate::types::{HealthState, MediaKind};
use crate::utils::human_bytes;

const STATE_DIR: &str = ".mirror-recon";

pub fn run(command: &Command, config: &Config) -> anyhow::Result<()> {
    match command {
        Command::Scan { target, .. } | Command::Verify { target } => {
            let session = Session::open(config)?;
            let inventory = session.scan()?;
            session.finish()?;
            if target.json {
                println!("{}", serde_json::to_string_pretty(&inventory)?);
            } else {
                print_inventory(&inventory);
            }
        }
        Command::Duplicates {
            target,
            delete_redundant,
            dry_run,
        } => {
            let session = Session::open(config)?;
            let inventory = session.scan()?;
            let report = DuplicateDetector::new(config, &session.checksums)
                .detect(&inventory, &session.cancel, session.reporter())
                .context("detecting duplicates")?;
            session.finish()?;

            if target.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_duplicates(&report);
            }
            if *delete_redundant {
                let actions = redundant_deletes(&report);
                session.mutate(&actions, *dry_run, target.json)?;
            }
        }
        Command::Clean {
            target,
            health,
            mode,
            to,
            dry_run,
        } => {
            let states: Vec<HealthState> = health.iter().map(|&h| h.into()).collect();
            let session = Session::open(config)?;
            let inventory = session.scan()?;
            session.finish()?;
            let actions = clean_actions(&inventory, &states, *mode, to.as_deref())?;
            session.mutate(&actions, *dry_run, target.json)?;
        }
        Command::Manifest { action } => run_manifest(action, config)?,
        Command::Journal { json } => {
            let path = journal_path(config)?;
            let records = Journal::read_all(&path)
                .with_context(|| format!("reading journal {}", path.display()))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    let status = match &record.outcome {
                        Outcome::Success => "ok".to_string(),
                        Outcome::Failure { kind, reason } => format!("FAILED ({kind}): {reason}"),
                    };
                    let dest = record
                        .destination
                        .as_ref()
                        .map(|d| format!(" -> {}", d.display()))
                        .unwrap_or_default();
                    println!(
                        "{} {:<6} {}{} [{}] {status}",
                        record.timestamp.to_rfc3339(),
                        record.action.label(),
                        record.source.display(),
                        dest,
                        human_bytes(record.bytes)
                    );
                }
            }
        }
    }
    Ok(())
}

fn required_root(config: &Config) -> anyhow::Result<&Path> {
    match config.root.as_deref() {
        Some(root) => Ok(root),
        None => bail!("--root is required"),
    }
}

fn journal_path(config: &Config) -> anyhow::Result<PathBuf> {
    if let Some(path) = &config.journal {
        return Ok(path.clone());
    }
    match &config.root {
        Some(root) => Ok(root.join(STATE_DIR).join("journal.jsonl")),
        None => bail!("--journal or --root is required"),
    }
}

fn open_checksums(config: &Config) -> anyhow::Result<ChecksumService> {
    let cache = match &config.cache {
        Some(path) => ChecksumCache::open(path, config.algorithm)
            .with_context(|| format!("opening checksum cache {}", path.display()))?,
        None => ChecksumCache::in_memory(config.algorithm),
    };
    Ok(ChecksumService::new(Arc::new(cache), config.algorithm))
}

/// Everything one command invocation shares: catalog, checksums, progress.
struct Session<'c> {
    config: &'c Config,
    root: PathBuf,
    catalog: Catalog,
    checksums: ChecksumService,
    bars: Option<BarReporter>,
    cancel: CancelToken,
}

impl<'c> Session<'c> {
    fn open(config: &'c Config) -> anyhow::Result<Self> {
        let root = required_root(config)?.to_path_buf();
        let catalog = match &config.catalog {
            Some(path) => Catalog::from_json_file(path)
                .with_context(|| format!("loading catalog {}", path.display()))?,
            None => {
                warn!("no catalog given; every file will be reported as orphaned");
                Catalog::default()
            }
        };
        info!(entries = catalog.len(), "catalog loaded");
        Ok(Self {
            config,
            root,
            catalog,
            checksums: open_checksums(config)?,
            bars: BarReporter::maybe_new(config),
            cancel: CancelToken::new(),
        })
    }

    fn reporter(&self) -> &dyn ProgressReporter {
        match &self.bars {
            Some(bars) => bars,
            None => &SilentReporter,
        }
    }

    fn scan(&self) -> anyhow::Result<Inventory> {
        let scanner = MirrorScanner::new(self.config, &self.catalog, &self.checksums)?;
        let inventory = scanner
            .scan(&self.root, &self.cancel, self.reporter())
            .with_context(|| format!("scanning {}", self.root.display()))?;
        for warning in &inventory.warnings {
            warn!("{warning}");
        }
        Ok(inventory)
    }

    fn finish(&self) -> anyhow::Result<()> {
        self.checksums.cache().save().context("saving checksum cache")?;
        if let Some(bars) = &self.bars {
            bars.finalize();
        }
        Ok(())
    }

    fn mutate(&self, actions: &[Action], dry_run: bool, json: bool) -> anyhow::Result<()> {
        if actions.is_empty() {
            println!("Nothing to do.");
            return Ok(());
        }
        if dry_run {
            for action in actions {
                let dest = action
                    .destination
                    .as_ref()
                    .map(|d| format!(" -> {}", d.display()))
                    .unwrap_or_default();
                println!(
                    "[dry-run] {} {}{} ({})",
                    action.kind.label(),
                    action.source.path.display(),
                    dest,
                    human_bytes(action.source.size)
                );
            }
            return Ok(());
        }

        let journal_path = journal_path(self.config)?;
        let journal = Journal::open(&journal_path)
            .with_context(|| format!("opening journal {}", journal_path.display()))?;
        let mut executor = MutationExecutor::new(journal)
            .with_safety_margin(self.config.safety_margin)
            .with_prune_empty_dirs(self.config.prune_empty_dirs)
            .with_root(&self.root);
        let summary = executor
            .execute(actions, &self.cancel, self.reporter())
            .context("running mutation batch")?;
        if let Some(bars) = &self.bars {
            bars.finalize();
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            print_summary(&summary);
        }
        Ok(())
    }
}

/// One delete per non-keeper member of every group proven byte-identical.
pub fn redundant_deletes(report: &DuplicateReport) -> Vec<Action> {
    report
        .groups
        .iter()
        .filter(|g| g.recommendation == Recommendation::DeleteRedundant)
        .flat_map(|g| g.redundant().cloned().map(Action::delete))
        .collect()
}

/// Actions for every inventory entry in `states`. Move/copy targets keep the
/// entry's path relative to the mirror root under `to`.
pub fn clean_actions(
    inventory: &Inventory,
    states: &[HealthState],
    mode: CleanMode,
    to: Option<&Path>,
) -> anyhow::Result<Vec<Action>> {
    let selected = inventory.files.iter().filter(|f| states.contains(&f.health));
    let actions = match mode {
        CleanMode::Delete => selected.cloned().map(Action::delete).collect(),
        CleanMode::Move | CleanMode::Copy => {
            let Some(to) = to else {
                bail!("--to is required for --mode move/copy");
            };
            let kind = if mode == CleanMode::Move {
                ActionKind::Move
            } else {
                ActionKind::Copy
            };
            selected
                .map(|f| Action::relocate(kind, f.clone(), to.join(&f.relative)))
                .collect()
        }
    };
    Ok(actions)
}

fn run_manifest(action: &ManifestCommand, config: &Config) -> anyhow::Result<()> {
    let root = required_root(config)?;
    let checksums = open_checksums(config)?;
    match action {
        ManifestCommand::Create { manifest, .. } => {
            let created = Manifest::create(root, &checksums, config)
                .with_context(|| format!("hashing {}", root.display()))?;
            created
                .save(manifest)
                .with_context(|| format!("writing manifest {}", manifest.display()))?;
            println!(
                "Wrote {} entr{} ({}) to {}",
                created.files.len(),
                if created.files.len() == 1 { "y" } else { "ies" },
                created.algorithm.label(),
                manifest.display()
            );
        }
        ManifestCommand::Check { manifest, json, .. } => {
            let loaded = Manifest::load(manifest)
                .with_context(|| format!("reading manifest {}", manifest.display()))?;
            let checksums = if checksums.algorithm() == loaded.algorithm {
                checksums
            } else {
                ChecksumService::new(
                    Arc::new(ChecksumCache::in_memory(loaded.algorithm)),
                    loaded.algorithm,
                )
            };
            let report = loaded.check(root, &checksums, config)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "valid {} | corrupted {} | missing {} | unlisted {} | unreadable {}",
                    report.valid.len(),
                    report.corrupted.len(),
                    report.missing.len(),
                    report.unlisted.len(),
                    report.unreadable.len()
                );
                for path in &report.corrupted {
                    println!("  corrupted: {path}");
                }
                for path in &report.missing {
                    println!("  missing:   {path}");
                }
            }
            checksums.cache().save().context("saving checksum cache")?;
            if !report.is_clean() {
                bail!("manifest check found problems under {}", root.display());
            }
            return Ok(());
        }
    }
    checksums.cache().save().context("saving checksum cache")?;
    Ok(())
}

fn print_inventory(inventory: &Inventory) {
    let counters = &inventory.counters;
    println!(
        "{} files, {} under {}{}",
        counters.total.count,
        human_bytes(counters.total.bytes),
        inventory.root.display(),
        if inventory.is_complete() { "" } else { " (incomplete: cancelled)" }
    );
    for state in HealthState::ALL {
        let tally = counters.health(state);
        if tally.count > 0 {
            println!("  {:<10} {:>6}  {}", state.to_string(), tally.count, human_bytes(tally.bytes));
        }
    }
    for kind in MediaKind::ALL {
        let tally = counters.kind(kind);
        if tally.count > 0 {
            println!("  {:<10} {:>6}  {}", kind.to_string(), tally.count, human_bytes(tally.bytes));
        }
    }
    if counters.ambiguous > 0 {
        println!("  {} ambiguous catalog match(es)", counters.ambiguous);
    }
    if !inventory.warnings.is_empty() {
        println!("  {} warning(s)", inventory.warnings.len());
    }
}

fn print_duplicates(report: &DuplicateReport) {
    println!(
        "{} duplicate group(s), {} reclaimable{}",
        report.groups.len(),
        human_bytes(report.reclaimable_bytes()),
        if report.complete { "" } else { " (incomplete)" }
    );
    for group in &report.groups {
        let tags: Vec<&str> = group.strategies.iter().map(|s| s.tag()).collect();
        println!(
            "\n[{:.2} {:?}] {} | {} | reclaim {}",
            group.confidence,
            group.tier(),
            tags.join(","),
            group.recommendation,
            human_bytes(group.reclaimable_bytes)
        );
        for member in &group.members {
            let marker = if member.path == group.keeper { "*" } else { " " };
            println!("  {marker} {} ({})", member.path.display(), human_bytes(member.size));
        }
    }
}

fn print_summary(summary: &OperationSummary) {
    println!(
        "{}/{} succeeded, {} failed{} | {} in {:.1}s",
        summary.succeeded,
        summary.total,
        summary.failed,
        if summary.cancelled {
            format!(", {} not attempted", summary.skipped)
        } else {
            String::new()
        },
        human_bytes(summary.bytes_processed),
        summary.elapsed.as_secs_f64()
    );
    for item in summary.failures() {
        if let Outcome::Failure { kind, reason } = &item.outcome {
            println!("  {} {} ({kind}): {reason}", item.action.label(), item.source.display());
        }
    }
}
