use std::io::{IsTerminal, stderr};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[cfg(test)]
use std::cell::Cell;

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::actions::{ItemResult, OperationSummary, RunningTotals};
use crate::config::Config;
use crate::duplicates::Strategy;
use crate::inventory::Inventory;
use crate::types::MirrorFile;

const ACTION_BAR_TEMPLATE: &str = "{prefix} [{bar:40}] {pos:>5}/{len:<5} | {percent:>3}% | {elapsed_precise}<{eta_precise} | {msg}";
const SPINNER_TEMPLATE: &str = "{prefix} {spinner} {elapsed_precise} | {msg}";

/// Observer for long-running operations. Every hook defaults to a no-op, and
/// hooks may be called from worker threads.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self, _root: &Path, _units: usize) {}
    fn on_file_scanned(&self, _file: &MirrorFile) {}
    fn on_subtree_complete(&self, _subtree: &Path, _files: usize) {}
    fn on_scan_complete(&self, _inventory: &Inventory) {}
    fn on_hash_progress(&self, _done: usize, _total: usize, _path: Option<&Path>) {}
    fn on_detect_pass(&self, _strategy: Strategy, _groups: usize) {}
    fn on_action_complete(&self, _item: &ItemResult, _totals: &RunningTotals) {}
    fn on_batch_complete(&self, _summary: &OperationSummary) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

fn ellipsize(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut shortened: String = input.chars().take(keep).collect();
    shortened.push_str("...");
    shortened
}

fn file_hint(path: Option<&Path>) -> Option<String> {
    path.and_then(|p| p.file_name())
        .and_then(|os| os.to_str())
        .map(|name| ellipsize(name, 40))
}

fn format_speed(bytes: u64, elapsed: Duration) -> Option<String> {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 || bytes == 0 {
        return None;
    }
    Some(format!("{}/s", HumanBytes((bytes as f64 / seconds) as u64)))
}

#[cfg(test)]
thread_local! {
    static FORCE_PROGRESS_TTY: Cell<Option<bool>> = const { Cell::new(None) };
}

fn stderr_supports_progress() -> bool {
    #[cfg(test)]
    {
        if let Some(flag) = FORCE_PROGRESS_TTY.with(|cell| cell.get()) {
            return flag;
        }
    }
    stderr().is_terminal()
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(ACTION_BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["-", "\\", "|", "/"])
}

/// Terminal progress bars for the command-line front end.
pub struct BarReporter {
    multi: MultiProgress,
    scan_bar: ProgressBar,
    files_seen: AtomicUsize,
    bytes_seen: AtomicU64,
    scan_started: Mutex<Option<Instant>>,
    hash_bar: Mutex<Option<ProgressBar>>,
    action_bar: Mutex<Option<ProgressBar>>,
}

impl BarReporter {
    pub fn maybe_new(config: &Config) -> Option<Self> {
        if config.quiet > 0 || !stderr_supports_progress() {
            return None;
        }

        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(15));
        let scan_bar = multi.add(ProgressBar::new_spinner());
        scan_bar.set_style(spinner_style());
        scan_bar.set_prefix("[SCAN]");
        scan_bar.set_message("Waiting to start...");

        Some(Self {
            multi,
            scan_bar,
            files_seen: AtomicUsize::new(0),
            bytes_seen: AtomicU64::new(0),
            scan_started: Mutex::new(None),
            hash_bar: Mutex::new(None),
            action_bar: Mutex::new(None),
        })
    }

    fn log_summary(&self, message: String) {
        let _ = self.multi.println(message);
    }

    fn take_bar(slot: &Mutex<Option<ProgressBar>>) -> Option<ProgressBar> {
        slot.lock().ok().and_then(|mut guard| guard.take())
    }

    pub fn finalize(&self) {
        if !self.scan_bar.is_finished() {
            self.scan_bar.finish_and_clear();
        }
        for slot in [&self.hash_bar, &self.action_bar] {
            if let Some(bar) = Self::take_bar(slot) {
                bar.finish_and_clear();
                self.multi.remove(&bar);
            }
        }
    }
}

impl ProgressReporter for BarReporter {
    fn on_scan_start(&self, root: &Path, units: usize) {
        if let Ok(mut started) = self.scan_started.lock() {
            *started = Some(Instant::now());
        }
        self.scan_bar.set_style(bar_style());
        self.scan_bar.set_length(units as u64);
        self.scan_bar.set_position(0);
        self.scan_bar
            .set_message(format!("Scanning {}", ellipsize(&root.display().to_string(), 60)));
    }

    fn on_file_scanned(&self, file: &MirrorFile) {
        let seen = self.files_seen.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = self.bytes_seen.fetch_add(file.size, Ordering::Relaxed) + file.size;
        let mut message = format!(
            "{seen} file{} | {}",
            if seen == 1 { "" } else { "s" },
            HumanBytes(bytes)
        );
        if let Some(name) = file_hint(Some(&file.path)) {
            message.push_str(&format!(" (latest: {name})"));
        }
        self.scan_bar.set_message(message);
    }

    fn on_subtree_complete(&self, _subtree: &Path, _files: usize) {
        self.scan_bar.inc(1);
    }

    fn on_scan_complete(&self, inventory: &Inventory) {
        let mut summary = format!(
            "Scanned {} file{} | {}",
            inventory.len(),
            if inventory.len() == 1 { "" } else { "s" },
            HumanBytes(inventory.total_bytes())
        );
        let started = self.scan_started.lock().ok().and_then(|mut s| s.take());
        if let Some(speed) = started.and_then(|s| format_speed(inventory.total_bytes(), s.elapsed())) {
            summary.push_str(&format!(" | {speed}"));
        }
        if !inventory.is_complete() {
            summary.push_str(" | cancelled");
        }
        self.scan_bar.finish_and_clear();
        self.log_summary(summary);
    }

    fn on_hash_progress(&self, done: usize, total: usize, path: Option<&Path>) {
        let Ok(mut slot) = self.hash_bar.lock() else {
            return;
        };
        let bar = slot.get_or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(total as u64));
            bar.set_style(bar_style());
            bar.set_prefix("[HASH]");
            bar
        });
        bar.set_position(done as u64);
        if let Some(name) = file_hint(path) {
            bar.set_message(name);
        }
        if done >= total {
            bar.finish_and_clear();
            self.multi.remove(bar);
            *slot = None;
        }
    }

    fn on_detect_pass(&self, strategy: Strategy, groups: usize) {
        self.log_summary(format!(
            "[DUPES] {strategy}: {groups} group{}",
            if groups == 1 { "" } else { "s" }
        ));
    }

    fn on_action_complete(&self, item: &ItemResult, totals: &RunningTotals) {
        let Ok(mut slot) = self.action_bar.lock() else {
            return;
        };
        let bar = slot.get_or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(totals.total as u64));
            bar.set_style(bar_style());
            bar.set_prefix(format!("[{}]", item.action.label()));
            bar
        });
        bar.set_position(totals.completed as u64);
        let mut message = format!("{} processed", HumanBytes(totals.bytes_processed));
        if totals.failed > 0 {
            message.push_str(&format!(" | {} failed", totals.failed));
        }
        if let Some(name) = file_hint(Some(&item.source)) {
            message.push_str(&format!(" (latest: {name})"));
        }
        bar.set_message(message);
    }

    fn on_batch_complete(&self, summary: &OperationSummary) {
        if let Some(bar) = Self::take_bar(&self.action_bar) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        let mut line = format!(
            "Processed {}/{} action{} | {} | {} failed",
            summary.succeeded,
            summary.total,
            if summary.total == 1 { "" } else { "s" },
            HumanBytes(summary.bytes_processed),
            summary.failed
        );
        if let Some(speed) = format_speed(summary.bytes_processed, summary.elapsed) {
            line.push_str(&format!(" | {speed}"));
        }
        self.log_summary(line);
    }
}

impl Drop for BarReporter {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
pub(crate) fn force_progress_tty_for_tests(flag: Option<bool>) {
    FORCE_PROGRESS_TTY.with(|cell| cell.set(flag));
}
