use clap::ValueEnum;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// A phase with no byte progress for this long gets a stall warning.
    pub stall_threshold: Duration,
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            stall_threshold: Duration::from_secs(30),
            plain_interval: Duration::from_secs(2),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        let is_tty = self
            .tty_override
            .unwrap_or_else(|| std::io::stderr().is_terminal());
        match self.mode {
            ProgressMode::Auto if is_tty => ResolvedProgressMode::Rich,
            ProgressMode::Auto => ResolvedProgressMode::Plain,
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeSummary {
    pub input: PathBuf,
    pub video: PathBuf,
    pub manifest: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub source_bytes: u64,
    pub processed_bytes: u64,
    pub chunk_count: usize,
    pub frames_written: usize,
    pub failed_chunks: Vec<usize>,
    pub gap_policy: String,
    pub workers: usize,
    pub muxed: bool,
    pub elapsed: Duration,
    pub avg_bytes_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DecodeSummary {
    pub video: PathBuf,
    pub output: PathBuf,
    pub frame_count: usize,
    pub rejected_frames: usize,
    pub failed_frames: Vec<usize>,
    pub missing_segments: Vec<usize>,
    pub recovered_bytes: u64,
    pub padding_bytes: Option<u64>,
    pub crc_match: Option<bool>,
    pub trimmed: bool,
    pub gap_policy: String,
    pub workers: usize,
    pub elapsed: Duration,
    pub avg_bytes_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VerifySummary {
    pub source_bytes: u64,
    pub recovered_bytes: u64,
    pub padding_bytes: u64,
    pub elapsed: Duration,
    pub avg_bytes_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub avg_bytes_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    stage: String,
    processed_bytes: u64,
    total_bytes: u64,
    elapsed: Duration,
    throughput_bps: f64,
    eta: Option<Duration>,
    active_ops: Vec<String>,
}

/// Cheap to clone; shared by every worker of a phase.
#[derive(Clone)]
pub struct ProgressHandle {
    inner: Arc<ProgressInner>,
}

pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

struct ProgressInner {
    label: String,
    mode: ResolvedProgressMode,
    stall_threshold: Duration,
    plain_interval: Duration,
    state: Mutex<ProgressState>,
    rich: Option<RichUi>,
    stop: AtomicBool,
    finalized: AtomicBool,
}

struct RichUi {
    multi: MultiProgress,
    overall: ProgressBar,
    stage: ProgressBar,
    ops: Mutex<BTreeMap<String, ProgressBar>>,
}

#[derive(Debug)]
struct ProgressState {
    started: Instant,
    stage: String,
    total_bytes: u64,
    processed_bytes: u64,
    last_progress: Instant,
    last_plain_emit: Instant,
    last_stall_warn: Option<Instant>,
    rate_sample_at: Instant,
    rate_sample_bytes: u64,
    smoothed_bps: f64,
    operations: BTreeMap<String, String>,
    warnings: Vec<String>,
    warning_count: usize,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, total_bytes: u64, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();
        let now = Instant::now();

        let rich = (mode == ResolvedProgressMode::Rich).then(|| RichUi::new(&label, total_bytes));

        let inner = Arc::new(ProgressInner {
            label,
            mode,
            stall_threshold: config.stall_threshold,
            plain_interval: config.plain_interval,
            state: Mutex::new(ProgressState {
                started: now,
                stage: "starting".to_string(),
                total_bytes,
                processed_bytes: 0,
                last_progress: now,
                last_plain_emit: now.checked_sub(config.plain_interval).unwrap_or(now),
                last_stall_warn: None,
                rate_sample_at: now,
                rate_sample_bytes: 0,
                smoothed_bps: 0.0,
                operations: BTreeMap::new(),
                warnings: Vec::new(),
                warning_count: 0,
            }),
            rich,
            stop: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        });

        let ticker_inner = Arc::clone(&inner);
        let ticker = thread::spawn(move || {
            while !ticker_inner.stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(250));
                ticker_inner.tick_once();
            }
        });

        Self {
            handle: ProgressHandle { inner },
            ticker: Some(ticker),
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        self.shutdown_ticker();
        self.handle.inner.finalize(Some(final_message.into()))
    }

    fn shutdown_ticker(&mut self) {
        self.handle.inner.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown_ticker();
        let _ = self.handle.inner.finalize(None);
    }
}

impl ProgressHandle {
    pub fn set_total_bytes(&self, total_bytes: u64) {
        let snapshot = self.inner.update(|state, _| state.total_bytes = total_bytes);
        self.inner.render(&snapshot, true);
    }

    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        let snapshot = self.inner.update(|state, _| state.stage = stage);
        self.inner.render(&snapshot, true);
    }

    pub fn inc_bytes(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let snapshot = self.inner.update(|state, now| {
            state.processed_bytes = state.processed_bytes.saturating_add(delta);
            if state.total_bytes > 0 {
                state.processed_bytes = state.processed_bytes.min(state.total_bytes);
            }
            state.last_progress = now;
        });
        self.inner.render(&snapshot, false);
    }

    pub fn set_operation_status(&self, operation_id: impl Into<String>, status: impl Into<String>) {
        let op_id = operation_id.into();
        let status = status.into();
        if let Some(rich) = &self.inner.rich {
            rich.set_operation(&op_id, &status);
        }
        self.inner.lock_state().operations.insert(op_id, status);
    }

    pub fn clear_operation(&self, operation_id: &str, final_status: Option<&str>) {
        if let Some(rich) = &self.inner.rich {
            rich.clear_operation(operation_id, final_status);
        }
        self.inner.lock_state().operations.remove(operation_id);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.inner.emit("INFO", &message.into());
    }

    /// Logs and keeps the message for the phase summary.
    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        push_warning(&mut self.inner.lock_state(), &message);
        self.inner.emit("WARN", &message);
    }
}

impl ProgressInner {
    fn lock_state(&self) -> MutexGuard<'_, ProgressState> {
        // A worker that panicked mid-update leaves counters that are still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut ProgressState, Instant)) -> Snapshot {
        let mut state = self.lock_state();
        let now = Instant::now();
        f(&mut state, now);
        refresh_rate(&mut state, now);
        snapshot(&state)
    }

    fn tick_once(&self) {
        if self.mode == ResolvedProgressMode::Quiet {
            return;
        }

        let (snap, plain_due, stall_warning) = {
            let mut state = self.lock_state();
            let now = Instant::now();
            refresh_rate(&mut state, now);

            let plain_due = now.duration_since(state.last_plain_emit) >= self.plain_interval;
            if plain_due {
                state.last_plain_emit = now;
            }

            let stall_warning = if stall_warning_due(
                now,
                state.last_progress,
                state.last_stall_warn,
                self.stall_threshold,
                state.processed_bytes,
                state.total_bytes,
            ) {
                state.last_stall_warn = Some(now);
                let msg = format!(
                    "STALL WARNING: no byte progress for {}s (stage={}, active={})",
                    now.duration_since(state.last_progress).as_secs(),
                    state.stage,
                    active_display(&state.operations)
                );
                push_warning(&mut state, &msg);
                Some(msg)
            } else {
                None
            };

            (snapshot(&state), plain_due, stall_warning)
        };

        match self.mode {
            ResolvedProgressMode::Rich => self.render_rich(&snap),
            ResolvedProgressMode::Plain if plain_due => self.render_plain(&snap),
            _ => {}
        }
        if let Some(msg) = stall_warning {
            self.emit("WARN", &msg);
        }
    }

    fn render(&self, snap: &Snapshot, force_plain: bool) {
        match self.mode {
            ResolvedProgressMode::Rich => self.render_rich(snap),
            ResolvedProgressMode::Plain if force_plain => self.render_plain(snap),
            _ => {}
        }
    }

    fn render_rich(&self, snap: &Snapshot) {
        let Some(rich) = &self.rich else {
            return;
        };
        rich.overall.set_length(snap.total_bytes.max(1));
        rich.overall
            .set_position(snap.processed_bytes.min(snap.total_bytes.max(1)));
        rich.overall.set_message(format!(
            "rate={} ETA={}",
            format_rate(snap.throughput_bps),
            format_eta(snap.eta)
        ));
        rich.stage.set_message(format!(
            "{} | elapsed {} | active={}",
            snap.stage,
            format_duration(snap.elapsed),
            join_or_dash(&snap.active_ops)
        ));
    }

    fn render_plain(&self, snap: &Snapshot) {
        let pct = if snap.total_bytes == 0 {
            0.0
        } else {
            (snap.processed_bytes as f64 / snap.total_bytes as f64) * 100.0
        };
        eprintln!(
            "[PROGRESS] {} elapsed={} stage={} done={} / {} ({:.1}%) rate={} ETA={} active={}",
            self.label,
            format_duration(snap.elapsed),
            snap.stage,
            HumanBytes(snap.processed_bytes),
            HumanBytes(snap.total_bytes),
            pct,
            format_rate(snap.throughput_bps),
            format_eta(snap.eta),
            join_or_dash(&snap.active_ops)
        );
    }

    fn emit(&self, level: &str, message: &str) {
        let line = format!("[{}] {}: {}", level, self.label, message);
        match (&self.mode, &self.rich) {
            (ResolvedProgressMode::Quiet, _) => {}
            (ResolvedProgressMode::Rich, Some(rich)) => rich.stage.println(line),
            _ => eprintln!("{}", line),
        }
    }

    fn finalize(&self, final_message: Option<String>) -> ProgressOutcome {
        let (snap, warnings, warning_count) = {
            let mut state = self.lock_state();
            refresh_rate(&mut state, Instant::now());
            (snapshot(&state), state.warnings.clone(), state.warning_count)
        };
        let outcome = ProgressOutcome {
            elapsed: snap.elapsed,
            total_bytes: snap.total_bytes,
            processed_bytes: snap.processed_bytes,
            avg_bytes_per_sec: average_rate(snap.processed_bytes, snap.elapsed),
            warning_count,
            warnings,
        };
        if self.finalized.swap(true, Ordering::Relaxed) {
            return outcome;
        }

        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                self.render_plain(&snap);
                if let Some(msg) = final_message.as_deref() {
                    eprintln!("[DONE] {}: {}", self.label, msg);
                }
            }
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.overall.finish_with_message(format!(
                        "done={} / {} elapsed={} rate={}",
                        HumanBytes(snap.processed_bytes),
                        HumanBytes(snap.total_bytes),
                        format_duration(snap.elapsed),
                        format_rate(snap.throughput_bps)
                    ));
                    match final_message {
                        Some(msg) => rich.stage.finish_with_message(msg),
                        None => rich.stage.finish_and_clear(),
                    }
                    rich.clear_all_ops();
                }
            }
        }
        outcome
    }
}

impl RichUi {
    fn new(label: &str, total_bytes: u64) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(total_bytes.max(1)));
        let stage = multi.add(ProgressBar::new_spinner());

        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {prefix:.bold} {wide_bar:.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} | {msg}",
        ) {
            overall.set_style(style);
        }
        overall.set_prefix(label.to_string());

        if let Ok(style) = ProgressStyle::with_template("{spinner:.yellow} {msg}") {
            stage.set_style(style.tick_chars("|/-\\ "));
        }
        stage.enable_steady_tick(Duration::from_millis(120));
        stage.set_message("starting");

        Self {
            multi,
            overall,
            stage,
            ops: Mutex::new(BTreeMap::new()),
        }
    }

    fn set_operation(&self, op_id: &str, status: &str) {
        let mut ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
        let bar = ops.entry(op_id.to_string()).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new_spinner());
            if let Ok(style) = ProgressStyle::with_template("{spinner:.magenta} {prefix:.bold} {msg}") {
                pb.set_style(style.tick_chars("|/-\\ "));
            }
            pb.enable_steady_tick(Duration::from_millis(120));
            pb.set_prefix(op_id.to_string());
            pb
        });
        bar.set_message(status.to_string());
    }

    fn clear_operation(&self, op_id: &str, final_status: Option<&str>) {
        let mut ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(bar) = ops.remove(op_id) {
            match final_status {
                Some(status) => bar.finish_with_message(status.to_string()),
                None => bar.finish_and_clear(),
            }
        }
    }

    fn clear_all_ops(&self) {
        let mut ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
        for (_id, bar) in std::mem::take(&mut *ops) {
            bar.finish_and_clear();
        }
    }
}

fn push_warning(state: &mut ProgressState, message: &str) {
    if state.warnings.len() >= MAX_STORED_WARNINGS {
        state.warnings.remove(0);
    }
    state.warnings.push(message.to_string());
    state.warning_count += 1;
}

fn snapshot(state: &ProgressState) -> Snapshot {
    let throughput_bps = if state.smoothed_bps > 0.1 {
        state.smoothed_bps
    } else {
        average_rate(state.processed_bytes, state.started.elapsed())
    };
    Snapshot {
        stage: state.stage.clone(),
        processed_bytes: state.processed_bytes,
        total_bytes: state.total_bytes,
        elapsed: state.started.elapsed(),
        throughput_bps,
        eta: compute_eta(state.total_bytes, state.processed_bytes, throughput_bps),
        active_ops: state.operations.keys().take(4).cloned().collect(),
    }
}

fn refresh_rate(state: &mut ProgressState, now: Instant) {
    let dt = now.duration_since(state.rate_sample_at).as_secs_f64();
    if dt < 0.5 {
        return;
    }
    let delta_bytes = state.processed_bytes.saturating_sub(state.rate_sample_bytes);
    let instant_bps = delta_bytes as f64 / dt;
    state.smoothed_bps = if state.smoothed_bps <= f64::EPSILON {
        instant_bps
    } else {
        // EWMA keeps the ETA from jumping around.
        (state.smoothed_bps * 0.7) + (instant_bps * 0.3)
    };
    state.rate_sample_at = now;
    state.rate_sample_bytes = state.processed_bytes;
}

fn active_display(ops: &BTreeMap<String, String>) -> String {
    if ops.is_empty() {
        return "-".to_string();
    }
    ops.keys().take(3).cloned().collect::<Vec<_>>().join(",")
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(",")
    }
}

pub fn average_rate(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / elapsed.as_secs_f64().max(1e-6)
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

pub fn format_rate(bps: f64) -> String {
    if bps <= 0.1 {
        "0 B/s".to_string()
    } else {
        format!("{}/s", HumanBytes(bps as u64))
    }
}

fn format_eta(eta: Option<Duration>) -> String {
    eta.map(format_duration)
        .unwrap_or_else(|| "--:--".to_string())
}

fn compute_eta(total_bytes: u64, processed_bytes: u64, throughput_bps: f64) -> Option<Duration> {
    if throughput_bps <= 0.1 || processed_bytes >= total_bytes {
        return None;
    }
    let remaining = total_bytes.saturating_sub(processed_bytes) as f64;
    Some(Duration::from_secs_f64(remaining / throughput_bps))
}

fn stall_warning_due(
    now: Instant,
    last_progress: Instant,
    last_warn: Option<Instant>,
    threshold: Duration,
    processed_bytes: u64,
    total_bytes: u64,
) -> bool {
    if total_bytes > 0 && processed_bytes >= total_bytes {
        return false;
    }
    if now.duration_since(last_progress) < threshold {
        return false;
    }
    match last_warn {
        Some(prev) => now.duration_since(prev) >= threshold,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_resolution_respects_tty_override() {
        let tty = ProgressConfig::new(ProgressMode::Auto).with_tty_override(true);
        assert_eq!(tty.resolve_mode(), ResolvedProgressMode::Rich);

        let not_tty = ProgressConfig::new(ProgressMode::Auto).with_tty_override(false);
        assert_eq!(not_tty.resolve_mode(), ResolvedProgressMode::Plain);

        let quiet = ProgressConfig::new(ProgressMode::Quiet).with_tty_override(true);
        assert_eq!(quiet.resolve_mode(), ResolvedProgressMode::Quiet);
    }

    #[test]
    fn eta_uses_remaining_bytes() {
        // 750 bytes left at 50 B/s.
        let eta = compute_eta(1_000, 250, 50.0).expect("eta should exist");
        assert_eq!(eta.as_secs(), 15);

        assert!(compute_eta(100, 100, 1_000.0).is_none());
        assert!(compute_eta(100, 10, 0.0).is_none());
    }

    #[test]
    fn stall_warning_fires_once_per_threshold() {
        let now = Instant::now();
        let threshold = Duration::from_secs(30);
        assert!(stall_warning_due(now + threshold, now, None, threshold, 10, 100));
        assert!(!stall_warning_due(
            now + threshold,
            now,
            Some(now + Duration::from_secs(10)),
            threshold,
            10,
            100
        ));
        assert!(!stall_warning_due(now + threshold, now, None, threshold, 100, 100));
    }

    #[test]
    fn warnings_are_counted_and_returned_on_finish() {
        let reporter = ProgressReporter::new("test", 10, ProgressConfig::new(ProgressMode::Quiet));
        let handle = reporter.handle();
        handle.warning("chunk 3 failed");
        handle.warning("chunk 9 failed");
        handle.inc_bytes(4);
        let outcome = reporter.finish("done");
        assert_eq!(outcome.warning_count, 2);
        assert_eq!(outcome.warnings, vec!["chunk 3 failed", "chunk 9 failed"]);
        assert_eq!(outcome.processed_bytes, 4);
    }
}
