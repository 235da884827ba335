//! Result routing for a run.
//!
//! Workers and the job source never print. They push text into one of four
//! [`ResultSinks`]:
//!
//! | Sink | Console stream | Side effect |
//! |---|---|---|
//! | task stdout | task output | completion +1, progress line |
//! | task stderr | task error | completion +1 |
//! | info | operational | - |
//! | fatal | operational | cancels the run under [`FailurePolicy::Abort`] |
//!
//! [`ResultRouter`] owns the receiving ends and drains each one on its own
//! task, all built from [`spawn_drain`].

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FailurePolicy;

/// Buffer size of each result channel.
pub const SINK_CAPACITY: usize = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where routed text ends up.
pub trait Console: Send + Sync {
    /// Standard output of successful jobs.
    fn task_output(&self, text: &str);
    /// Standard error of failed jobs.
    fn task_error(&self, text: &str);
    /// Progress and diagnostics of the tool itself.
    fn app_output(&self, text: &str);
}

/// Task output on stdout, everything else on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl Console for StdConsole {
    fn task_output(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn task_error(&self, text: &str) {
        let _ = std::io::stderr().lock().write_all(text.as_bytes());
    }

    fn app_output(&self, text: &str) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(text.as_bytes());
        let _ = err.flush();
    }
}

/// Console that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryConsole {
    task_output: Mutex<String>,
    task_error: Mutex<String>,
    app_output: Mutex<String>,
}

impl MemoryConsole {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn task_output_text(&self) -> String {
        lock(&self.task_output).clone()
    }

    pub fn task_error_text(&self) -> String {
        lock(&self.task_error).clone()
    }

    pub fn app_output_text(&self) -> String {
        lock(&self.app_output).clone()
    }

    /// The text after the last carriage return of the operational stream
    /// that is not blank, i.e. what a terminal would show last.
    pub fn last_progress_line(&self) -> Option<String> {
        let app = self.app_output_text();
        app.split(['\r', '\n'])
            .filter(|s| !s.trim().is_empty())
            .filter(|s| s.contains("jobs completed"))
            .last()
            .map(str::to_string)
    }
}

impl Console for MemoryConsole {
    fn task_output(&self, text: &str) {
        lock(&self.task_output).push_str(text);
    }

    fn task_error(&self, text: &str) {
        lock(&self.task_error).push_str(text);
    }

    fn app_output(&self, text: &str) {
        lock(&self.app_output).push_str(text);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Known up front only when the whole input was read before dispatch.
    pub total: Option<u64>,
}

impl Progress {
    /// Progress line shown after each successful job.
    pub fn render(&self) -> String {
        match self.total {
            Some(total) if total > 0 => {
                let pct = self.completed as f64 / total as f64 * 100.0;
                format!(
                    "\r{:.2}% ({}/{}) jobs completed.",
                    pct, self.completed, total
                )
            }
            _ => format!("\r{} jobs completed.", self.completed),
        }
    }
}

/// Run-wide counters.
///
/// Completion state sits behind a single lock; submission and drop counts
/// only ever grow and are kept as atomics.
#[derive(Debug, Default)]
pub struct Tracker {
    progress: Mutex<Progress>,
    submitted: AtomicU64,
    dropped: AtomicU64,
    failed_nodes: Mutex<Vec<String>>,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_total(&self, total: u64) {
        lock(&self.progress).total = Some(total);
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_failure(&self, hostname: &str) {
        let mut nodes = lock(&self.failed_nodes);
        if !nodes.iter().any(|n| n == hostname) {
            nodes.push(hostname.to_string());
        }
    }

    fn complete_success(&self) -> Progress {
        let mut p = lock(&self.progress);
        p.completed += 1;
        p.succeeded += 1;
        *p
    }

    fn complete_failure(&self) -> Progress {
        let mut p = lock(&self.progress);
        p.completed += 1;
        p.failed += 1;
        *p
    }

    pub fn progress(&self) -> Progress {
        *lock(&self.progress)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed_nodes(&self) -> Vec<String> {
        lock(&self.failed_nodes).clone()
    }
}

/// Sending ends of the four result channels. Cheap to clone; the router's
/// drain loops end once every clone has been dropped.
#[derive(Debug, Clone)]
pub struct ResultSinks {
    task_stdout: mpsc::Sender<String>,
    task_stderr: mpsc::Sender<String>,
    info: mpsc::Sender<String>,
    fatal: mpsc::Sender<String>,
}

impl ResultSinks {
    async fn deliver(tx: &mpsc::Sender<String>, sink: &'static str, text: String) {
        if tx.send(text).await.is_err() {
            tracing::warn!(sink, "Result sink closed, dropping message");
        }
    }

    pub async fn success(&self, stdout: String) {
        Self::deliver(&self.task_stdout, "task_stdout", stdout).await;
    }

    pub async fn failure(&self, stderr: String) {
        Self::deliver(&self.task_stderr, "task_stderr", stderr).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        Self::deliver(&self.info, "info", message.into()).await;
    }

    pub async fn fatal(&self, message: impl Into<String>) {
        Self::deliver(&self.fatal, "fatal", message.into()).await;
    }
}

/// Drain `rx` on a new task, calling `handle` for every item and `on_close`
/// once the channel is closed and empty.
pub fn spawn_drain<T, H, C>(mut rx: mpsc::Receiver<T>, mut handle: H, on_close: C) -> JoinHandle<()>
where
    T: Send + 'static,
    H: FnMut(T) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            handle(item);
        }
        on_close();
    })
}

/// What the router saw once every sink was closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterSummary {
    pub progress: Progress,
    pub fatal_messages: Vec<String>,
}

/// Owns the four drain tasks of a run.
pub struct ResultRouter {
    handles: Vec<JoinHandle<()>>,
    console: Arc<dyn Console>,
    tracker: Arc<Tracker>,
    fatal_messages: Arc<Mutex<Vec<String>>>,
}

impl ResultRouter {
    /// Create the sinks and start draining them. Must be called before any
    /// producer is started.
    pub fn start(
        console: Arc<dyn Console>,
        tracker: Arc<Tracker>,
        policy: FailurePolicy,
        cancel: CancellationToken,
    ) -> (ResultSinks, ResultRouter) {
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(SINK_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel::<String>(SINK_CAPACITY);
        let (info_tx, info_rx) = mpsc::channel::<String>(SINK_CAPACITY);
        let (fatal_tx, fatal_rx) = mpsc::channel::<String>(SINK_CAPACITY);

        let fatal_messages = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::with_capacity(4);

        let c = console.clone();
        handles.push(spawn_drain(info_rx, move |msg: String| c.app_output(&msg), || {}));

        let c = console.clone();
        let record = fatal_messages.clone();
        handles.push(spawn_drain(
            fatal_rx,
            move |msg: String| {
                tracing::error!(message = %msg, "Fatal error reported");
                let first = {
                    let mut messages = lock(&record);
                    messages.push(msg.clone());
                    messages.len() == 1
                };
                match policy {
                    FailurePolicy::Abort => {
                        if first {
                            cancel.cancel();
                        }
                    }
                    FailurePolicy::KeepGoing => {
                        c.app_output(&format!("\nWarning: {}\n", msg));
                    }
                }
            },
            || {},
        ));

        let c = console.clone();
        let t = tracker.clone();
        let c_close = console.clone();
        handles.push(spawn_drain(
            stdout_rx,
            move |out: String| {
                c.task_output(&out);
                let progress = t.complete_success();
                c.app_output(&progress.render());
            },
            move || c_close.app_output("\n"),
        ));

        let c = console.clone();
        let t = tracker.clone();
        handles.push(spawn_drain(
            stderr_rx,
            move |err: String| {
                t.complete_failure();
                c.task_error(&err);
            },
            || {},
        ));

        let sinks = ResultSinks {
            task_stdout: stdout_tx,
            task_stderr: stderr_tx,
            info: info_tx,
            fatal: fatal_tx,
        };
        let router = ResultRouter {
            handles,
            console,
            tracker,
            fatal_messages,
        };
        (sinks, router)
    }

    /// Wait for every drain loop to finish and print the completion total.
    ///
    /// Only returns once all [`ResultSinks`] clones have been dropped.
    pub async fn finish(self) -> RouterSummary {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Result drain task panicked");
            }
        }

        let progress = self.tracker.progress();
        self.console
            .app_output(&format!("Total completed: {}\n", progress.completed));

        let fatal_messages = lock(&self.fatal_messages).clone();
        RouterSummary {
            progress,
            fatal_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(policy: FailurePolicy) -> (ResultSinks, ResultRouter, Arc<MemoryConsole>, Arc<Tracker>, CancellationToken) {
        let console = MemoryConsole::new();
        let tracker = Tracker::new();
        let cancel = CancellationToken::new();
        let (sinks, router) =
            ResultRouter::start(console.clone(), tracker.clone(), policy, cancel.clone());
        (sinks, router, console, tracker, cancel)
    }

    #[test]
    fn progress_render_with_total() {
        let p = Progress {
            completed: 10,
            succeeded: 10,
            failed: 0,
            total: Some(10),
        };
        assert_eq!(p.render(), "\r100.00% (10/10) jobs completed.");

        let p = Progress {
            completed: 1,
            total: Some(3),
            ..Default::default()
        };
        assert_eq!(p.render(), "\r33.33% (1/3) jobs completed.");
    }

    #[test]
    fn progress_render_without_total() {
        let p = Progress {
            completed: 10,
            ..Default::default()
        };
        assert_eq!(p.render(), "\r10 jobs completed.");
    }

    #[tokio::test]
    async fn routes_each_sink_to_its_stream() {
        let (sinks, router, console, _tracker, cancel) = start(FailurePolicy::Abort);

        sinks.success("out-1\n".to_string()).await;
        sinks.failure("err-1\n".to_string()).await;
        sinks.info("hello operator\n").await;
        drop(sinks);

        let summary = router.finish().await;
        assert_eq!(summary.progress.completed, 2);
        assert_eq!(summary.progress.succeeded, 1);
        assert_eq!(summary.progress.failed, 1);
        assert!(summary.fatal_messages.is_empty());
        assert!(!cancel.is_cancelled());

        assert_eq!(console.task_output_text(), "out-1\n");
        assert_eq!(console.task_error_text(), "err-1\n");
        let app = console.app_output_text();
        assert!(app.contains("hello operator"));
        assert!(app.ends_with("Total completed: 2\n"));
    }

    #[tokio::test]
    async fn fatal_cancels_under_abort() {
        let (sinks, router, _console, _tracker, cancel) = start(FailurePolicy::Abort);
        sinks.fatal("Error connecting to a: refused").await;
        sinks.fatal("Error connecting to b: refused").await;
        drop(sinks);

        let summary = router.finish().await;
        assert!(cancel.is_cancelled());
        assert_eq!(summary.fatal_messages.len(), 2);
        assert_eq!(summary.fatal_messages[0], "Error connecting to a: refused");
    }

    #[tokio::test]
    async fn fatal_is_reported_under_keep_going() {
        let (sinks, router, console, _tracker, cancel) = start(FailurePolicy::KeepGoing);
        sinks.fatal("Error connecting to a: refused").await;
        drop(sinks);

        let summary = router.finish().await;
        assert!(!cancel.is_cancelled());
        assert_eq!(summary.fatal_messages.len(), 1);
        assert!(console
            .app_output_text()
            .contains("Warning: Error connecting to a: refused"));
    }

    #[tokio::test]
    async fn percentage_reaches_hundred() {
        let (sinks, router, console, tracker, _cancel) = start(FailurePolicy::Abort);
        tracker.set_total(4);
        for i in 0..4 {
            sinks.success(format!("{i}\n")).await;
        }
        drop(sinks);
        router.finish().await;

        assert_eq!(
            console.last_progress_line().as_deref(),
            Some("100.00% (4/4) jobs completed.")
        );
    }

    #[test]
    fn tracker_counts_failed_nodes_once() {
        let t = Tracker::new();
        t.record_node_failure("a");
        t.record_node_failure("a");
        t.record_node_failure("b");
        assert_eq!(t.failed_nodes(), vec!["a".to_string(), "b".to_string()]);

        t.record_submitted();
        t.record_dropped();
        assert_eq!(t.submitted(), 1);
        assert_eq!(t.dropped(), 1);
    }
}
