//! Shutdown escalation shared by both supervisor strategies.

use std::{future::Future, pin::Pin, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{DEFAULT_KILL_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT};

/// Timeouts applied when stopping tracked units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Wait after polite termination before forcing.
    pub timeout: Duration,
    /// Wait after forced termination before giving up on confirmation.
    pub kill_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout: DEFAULT_SHUTDOWN_TIMEOUT, kill_timeout: DEFAULT_KILL_TIMEOUT }
    }
}

/// What happened to the units tracked when shutdown ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Units that exited on their own or after polite termination.
    pub terminated: usize,
    /// Units confirmed gone after forced termination.
    pub killed: usize,
    /// Units whose exit could not be confirmed even after forcing.
    pub unconfirmed: usize,
}

impl ShutdownReport {
    /// Total number of units that were tracked.
    pub fn total(&self) -> usize {
        self.terminated + self.killed + self.unconfirmed
    }

    /// Units that needed forced termination.
    pub fn forced(&self) -> usize {
        self.killed + self.unconfirmed
    }

    /// Logs the outcome; units that never confirmed their exit are an error.
    pub(crate) fn log(&self, units: &str) {
        if self.unconfirmed > 0 {
            error!(
                units,
                terminated = self.terminated,
                killed = self.killed,
                unconfirmed = self.unconfirmed,
                "units did not confirm exit after forced termination"
            );
        } else {
            info!(units, terminated = self.terminated, killed = self.killed, "units stopped");
        }
    }
}

/// A tracked unit the escalation ladder can stop.
pub(crate) trait Stoppable: Send {
    /// Whether the unit already exited.
    fn has_exited(&mut self) -> bool;

    /// Sends the polite termination request.
    fn terminate(&mut self);

    /// Forces the unit to stop.
    fn kill(&mut self);

    /// Resolves once the unit has exited.
    fn wait(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Label used in log fields.
    fn label(&self) -> String;
}

enum Termination {
    Terminated,
    Killed,
    Unconfirmed,
}

/// Stops every unit concurrently. Total wall time is bounded by
/// `timeout + config.kill_timeout`.
pub(crate) async fn stop_all<S: Stoppable>(
    units: Vec<S>,
    timeout: Duration,
    config: ShutdownConfig,
) -> ShutdownReport {
    let deadline = Instant::now() + timeout;

    let outcomes = join_all(units.into_iter().map(|unit| stop_one(unit, deadline, config))).await;

    outcomes.into_iter().fold(ShutdownReport::default(), |mut report, outcome| {
        match outcome {
            Termination::Terminated => report.terminated += 1,
            Termination::Killed => report.killed += 1,
            Termination::Unconfirmed => report.unconfirmed += 1,
        }
        report
    })
}

async fn stop_one<S: Stoppable>(mut unit: S, deadline: Instant, config: ShutdownConfig) -> Termination {
    if unit.has_exited() {
        return Termination::Terminated;
    }

    unit.terminate();
    if tokio::time::timeout_at(deadline, unit.wait()).await.is_ok() {
        debug!(unit = %unit.label(), "unit stopped after termination request");
        return Termination::Terminated;
    }

    warn!(unit = %unit.label(), "unit ignored termination request, forcing");
    unit.kill();

    if tokio::time::timeout(config.kill_timeout, unit.wait()).await.is_ok() {
        Termination::Killed
    } else {
        warn!(unit = %unit.label(), "unit exit not confirmed after forced termination");
        Termination::Unconfirmed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use tokio::sync::Notify;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    /// Log sink collecting formatted events.
    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn logged(report: ShutdownReport) -> String {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || report.log("children"));
        captured.text()
    }

    /// Unit driven entirely by flags, exiting when the behaviour allows.
    struct FakeUnit {
        obeys_terminate: bool,
        obeys_kill: bool,
        exited: Arc<AtomicBool>,
        notify: Arc<Notify>,
    }

    impl FakeUnit {
        fn new(obeys_terminate: bool, obeys_kill: bool) -> Self {
            Self {
                obeys_terminate,
                obeys_kill,
                exited: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            }
        }

        fn exit(&self) {
            self.exited.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
    }

    impl Stoppable for FakeUnit {
        fn has_exited(&mut self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }

        fn terminate(&mut self) {
            if self.obeys_terminate {
                self.exit();
            }
        }

        fn kill(&mut self) {
            if self.obeys_kill {
                self.exit();
            }
        }

        fn wait(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                loop {
                    let notified = self.notify.notified();
                    if self.exited.load(Ordering::SeqCst) {
                        return;
                    }
                    notified.await;
                }
            })
        }

        fn label(&self) -> String {
            "fake".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn classifies_each_unit_by_how_it_stopped() {
        let units = vec![
            FakeUnit::new(true, true),
            FakeUnit::new(false, true),
            FakeUnit::new(false, false),
        ];
        let config =
            ShutdownConfig { timeout: Duration::from_secs(5), kill_timeout: Duration::from_secs(1) };

        let start = Instant::now();
        let report = stop_all(units, config.timeout, config).await;

        assert_eq!(report, ShutdownReport { terminated: 1, killed: 1, unconfirmed: 1 });
        assert_eq!(report.total(), 3);
        assert_eq!(report.forced(), 2);
        assert!(start.elapsed() <= config.timeout + config.kill_timeout + Duration::from_millis(10));
    }

    #[tokio::test]
    async fn empty_set_reports_nothing() {
        let report = stop_all(Vec::<FakeUnit>::new(), Duration::from_secs(5), ShutdownConfig::default())
            .await;
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test]
    async fn already_exited_unit_is_not_signalled() {
        let mut unit = FakeUnit::new(false, false);
        unit.exit();
        assert!(unit.has_exited());

        let report = stop_all(vec![unit], Duration::from_millis(10), ShutdownConfig::default()).await;
        assert_eq!(report.terminated, 1);
    }

    #[test]
    fn unconfirmed_units_are_logged_as_error() {
        let output = logged(ShutdownReport { terminated: 2, killed: 0, unconfirmed: 1 });
        assert!(output.contains("ERROR"), "{output}");
        assert!(output.contains("unconfirmed=1"), "{output}");

        let output = logged(ShutdownReport { terminated: 2, killed: 1, unconfirmed: 0 });
        assert!(output.contains("INFO"), "{output}");
        assert!(!output.contains("ERROR"), "{output}");
    }
}
