//! Grid-walking experiment executor.
//!
//! Walks thetas (outer) and phis (inner), moving the positioner to each
//! grid point and reading every configured polarization from the
//! analyzer. Cancellation is checked before every move.
//!
//! The positioner lives on its own thread and runs moves in the order they
//! are queued. The scan thread waits for each move's terminal jog event, so
//! a move timeout lets the scan carry on while the move finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, SendError, Sender};
use hardware::analyzer::{Analyzer, AnalyzerError};
use hardware::positioner::{Axis, JogKind, Positioner, PositionerError};
use shared::result_set::{ResultSet, ResultSetError};
use thiserror::Error;
use tracing::{error, info, warn};

use super::config::ExperimentConfig;
use super::events::{EventSink, ExperimentEvent, FinishReason};

/// Error that ends an experiment with an error rather than a finish reason
#[derive(Error, Debug)]
pub enum ExperimentError {
    /// Positioner failed its pre-run connection check
    #[error("positioner error: {0}")]
    Positioner(#[from] PositionerError),

    /// Analyzer read failed; `partial` holds everything acquired before it
    #[error("analyzer error: {source}")]
    Analyzer {
        #[source]
        source: AnalyzerError,
        partial: ResultSet,
    },

    /// Acquired network did not fit the result set
    #[error("result set error: {source}")]
    ResultSet {
        #[source]
        source: ResultSetError,
        partial: ResultSet,
    },

    /// Experiment thread panicked before it could report
    #[error("experiment worker panicked")]
    WorkerPanicked,
}

impl ExperimentError {
    /// Networks acquired before the failure.
    pub fn partial_results(&self) -> Option<&ResultSet> {
        match self {
            ExperimentError::Positioner(_) | ExperimentError::WorkerPanicked => None,
            ExperimentError::Analyzer { partial, .. } | ExperimentError::ResultSet { partial, .. } => {
                Some(partial)
            }
        }
    }
}

/// Shared flag asking a run to stop at its next check point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Result of a run that reached its finish event.
#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub results: ResultSet,
    pub reason: FinishReason,
}

/// Outcome of waiting for a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveWait {
    Completed,
    Aborted,
}

type Job<P> = Box<dyn FnOnce(&mut P) + Send>;

/// Positioner owned by a dedicated thread that runs queued jobs in order.
struct PositionerThread<P> {
    jobs: Sender<Job<P>>,
    thread: JoinHandle<P>,
}

impl<P: Positioner + 'static> PositionerThread<P> {
    fn spawn(mut positioner: P) -> Self {
        let (jobs, queue) = unbounded::<Job<P>>();
        let thread = std::thread::spawn(move || {
            for job in queue {
                job(&mut positioner);
            }
            positioner
        });
        Self { jobs, thread }
    }

    fn queue(&self, job: impl FnOnce(&mut P) + Send + 'static) {
        if self.jobs.send(Box::new(job)).is_err() {
            error!("Positioner thread has stopped");
        }
    }

    /// Run `f` after every queued job and wait for its result.
    fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut P) -> R + Send + 'static,
    ) -> Result<R, PositionerError> {
        let (tx, rx) = bounded(1);
        self.queue(move |p| {
            let _ = tx.send(f(p));
        });
        rx.recv().map_err(|_| thread_stopped())
    }

    /// Wait for queued jobs and take the positioner back.
    fn into_inner(self) -> P {
        drop(self.jobs);
        match self.thread.join() {
            Ok(positioner) => positioner,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn thread_stopped() -> PositionerError {
    PositionerError::Connection("positioner thread stopped".to_string())
}

/// Move to `target` and report how the move's jog ended.
fn move_and_watch<P: Positioner>(
    positioner: &mut P,
    axis: Axis,
    target: f64,
) -> Result<MoveWait, PositionerError> {
    let events = positioner.subscribe();
    positioner.move_absolute(axis, target)?;
    let aborted = events
        .try_iter()
        .any(|e| e.axis == axis && e.kind == JogKind::Aborted);
    Ok(if aborted {
        MoveWait::Aborted
    } else {
        MoveWait::Completed
    })
}

/// Executes one scan over a positioner and analyzer.
pub struct ExperimentExecutor<P: Positioner + 'static, A: Analyzer> {
    positioner: PositionerThread<P>,
    analyzer: A,
    config: ExperimentConfig,
    cancel: CancelToken,
}

impl<P: Positioner + 'static, A: Analyzer> ExperimentExecutor<P, A> {
    pub fn new(positioner: P, analyzer: A, config: ExperimentConfig) -> Self {
        Self {
            positioner: PositionerThread::spawn(positioner),
            analyzer,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run `f` on the positioner once every queued move has finished.
    pub fn with_positioner<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut P) -> R + Send + 'static,
    ) -> Result<R, PositionerError> {
        self.positioner.call(f)
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Give back the instruments, waiting for any move still running.
    pub fn into_parts(self) -> (P, A) {
        (self.positioner.into_inner(), self.analyzer)
    }

    /// Check the instruments before any event is emitted.
    fn preflight(&mut self) -> Result<(), ExperimentError> {
        self.positioner.call(|p| p.test_connection())??;
        let available = self.analyzer.available_params();
        for pol in &self.config.polarizations {
            if !available.contains(&(pol.a, pol.b)) {
                return Err(ExperimentError::Analyzer {
                    source: AnalyzerError::UnsupportedPortPair {
                        a: pol.a,
                        b: pol.b,
                        nports: self.analyzer.nports(),
                    },
                    partial: ResultSet::new(),
                });
            }
        }
        Ok(())
    }

    /// Run the scan, emitting events to `sink`.
    ///
    /// A positioner fault or abort ends the run normally with the matching
    /// [`FinishReason`]. An analyzer or result set failure emits `Finished`
    /// and is then returned as an error carrying the partial results.
    pub fn run(&mut self, sink: &mut impl EventSink) -> Result<ExperimentOutcome, ExperimentError> {
        self.preflight()?;

        let total = self.config.total_points();
        info!(
            "Starting scan: {} thetas x {} phis x {} polarizations",
            self.config.thetas.len(),
            self.config.phis.len(),
            self.config.polarizations.len()
        );
        sink.emit(ExperimentEvent::Started {
            total_points: total,
        });

        let mut results = ResultSet::new();
        let mut completed = 0usize;
        let mut iter_times: Vec<Duration> = Vec::with_capacity(total);
        let mut reason = FinishReason::Completed;

        let thetas = self.config.thetas.clone();
        let phis = self.config.phis.clone();

        let grid = if total == 0 { &[][..] } else { &thetas[..] };
        'scan: for &theta in grid {
            if self.cancel.is_cancelled() {
                reason = FinishReason::Cancelled;
                break;
            }
            match self.wait_for(Axis::Theta, theta) {
                Ok(MoveWait::Completed) => {}
                Ok(MoveWait::Aborted) => {
                    reason = FinishReason::Cancelled;
                    break;
                }
                Err(e) => {
                    error!("Theta move to {theta} failed: {e}");
                    reason = FinishReason::Failed(e.to_string());
                    break;
                }
            }
            info!("Cut theta={theta}");

            let mut cut_completed = 0usize;
            for &phi in &phis {
                if self.cancel.is_cancelled() {
                    reason = FinishReason::Cancelled;
                    break 'scan;
                }
                let t0 = Instant::now();
                match self.wait_for(Axis::Phi, phi) {
                    Ok(MoveWait::Completed) => {}
                    Ok(MoveWait::Aborted) => {
                        reason = FinishReason::Cancelled;
                        break 'scan;
                    }
                    Err(e) => {
                        error!("Phi move to {phi} failed: {e}");
                        reason = FinishReason::Failed(e.to_string());
                        break 'scan;
                    }
                }

                if let Err(e) = self.acquire_point(phi, theta, &mut results, sink) {
                    error!("Acquisition at phi={phi} theta={theta} failed: {e}");
                    let message = e.to_string();
                    sink.emit(ExperimentEvent::Finished(FinishReason::Failed(message)));
                    return Err(match e {
                        PointError::Analyzer(source) => ExperimentError::Analyzer {
                            source,
                            partial: results,
                        },
                        PointError::ResultSet(source) => ExperimentError::ResultSet {
                            source,
                            partial: results,
                        },
                    });
                }

                iter_times.push(t0.elapsed());
                completed += 1;
                cut_completed += 1;
                sink.emit(ExperimentEvent::CutIterCountUpdated(cut_completed));
                sink.emit(ExperimentEvent::TotalIterCountUpdated(completed));
                sink.emit(ExperimentEvent::TimeEstUpdated(estimate_remaining(
                    &iter_times,
                    total - completed,
                )));
            }
        }

        info!(
            "Scan finished ({reason:?}): {completed}/{total} points, {} networks",
            results.len()
        );
        sink.emit(ExperimentEvent::Finished(reason.clone()));
        Ok(ExperimentOutcome { results, reason })
    }

    /// Read every polarization at the current pose.
    fn acquire_point(
        &mut self,
        phi: f64,
        theta: f64,
        results: &mut ResultSet,
        sink: &mut impl EventSink,
    ) -> Result<(), PointError> {
        for pol in &self.config.polarizations {
            let mut network = self
                .analyzer
                .read_sparam(pol.a, pol.b)
                .map_err(PointError::Analyzer)?;
            network.tag(phi, theta, &pol.label, false);
            results
                .append(network.clone())
                .map_err(PointError::ResultSet)?;
            sink.emit(ExperimentEvent::DataAcquired(network));
        }
        Ok(())
    }

    /// Queue a move of `axis` to `target` and wait for its terminal jog
    /// event.
    ///
    /// A timeout counts as completion. The move keeps running on the
    /// positioner thread and later moves queue behind it.
    fn wait_for(&mut self, axis: Axis, target: f64) -> Result<MoveWait, PositionerError> {
        let (done_tx, done) = bounded(1);
        self.positioner.queue(move |p| {
            if let Err(SendError(Err(e))) = done_tx.send(move_and_watch(p, axis, target)) {
                warn!("{axis} move to {target} failed after its wait timed out: {e}");
            }
        });

        let outcome = match self.config.move_timeout {
            Some(timeout) => done.recv_timeout(timeout),
            None => done.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match outcome {
            Ok(Ok(MoveWait::Aborted)) => {
                warn!("{axis} move to {target} aborted");
                Ok(MoveWait::Aborted)
            }
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Timed out waiting for {axis} move to {target}, continuing");
                Ok(MoveWait::Completed)
            }
            Err(RecvTimeoutError::Disconnected) => Err(thread_stopped()),
        }
    }
}

/// Failure while reading one grid point.
#[derive(Error, Debug)]
enum PointError {
    #[error(transparent)]
    Analyzer(AnalyzerError),
    #[error(transparent)]
    ResultSet(ResultSetError),
}

/// Mean iteration time multiplied by the points left.
pub fn estimate_remaining(iter_times: &[Duration], remaining: usize) -> Duration {
    if iter_times.is_empty() || remaining == 0 {
        return Duration::ZERO;
    }
    let mean = iter_times.iter().map(Duration::as_secs_f64).sum::<f64>() / iter_times.len() as f64;
    Duration::from_secs_f64(mean * remaining as f64)
}
