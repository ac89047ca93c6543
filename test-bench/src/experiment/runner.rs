//! Runs an experiment on a background thread.

use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver};
use hardware::analyzer::Analyzer;
use hardware::positioner::{AbortHandle, Positioner};
use tracing::{error, warn};

use super::config::ExperimentConfig;
use super::events::{ExperimentEvent, FinishReason};
use super::executor::{CancelToken, ExperimentError, ExperimentExecutor, ExperimentOutcome};

/// Starts experiment workers.
pub struct ExperimentRunner;

impl ExperimentRunner {
    /// Spawn a worker thread that owns the instruments for the run.
    ///
    /// Events are delivered on [`ExperimentHandle::events`]. A panic in the
    /// run still ends the stream with `Finished(Failed)`.
    pub fn spawn<P, A>(
        positioner: P,
        analyzer: A,
        config: ExperimentConfig,
    ) -> std::io::Result<ExperimentHandle<P, A>>
    where
        P: Positioner + 'static,
        A: Analyzer + 'static,
    {
        let (tx, rx) = unbounded();
        let abort = positioner.abort_handle();
        let executor = ExperimentExecutor::new(positioner, analyzer, config);
        let cancel = executor.cancel_token();

        let worker = std::thread::Builder::new()
            .name("experiment".to_string())
            .spawn(move || {
                let mut executor = executor;
                let mut sink = tx.clone();
                match panic::catch_unwind(AssertUnwindSafe(|| executor.run(&mut sink))) {
                    Ok(result) => {
                        if let Err(e) = &result {
                            error!("Experiment failed: {e}");
                        }
                        Some((result, executor.into_parts()))
                    }
                    Err(_) => {
                        error!("Experiment worker panicked");
                        let message = ExperimentError::WorkerPanicked.to_string();
                        let _ = tx.send(ExperimentEvent::Finished(FinishReason::Failed(message)));
                        None
                    }
                }
            })?;

        Ok(ExperimentHandle {
            events: rx,
            cancel,
            abort,
            worker: Some(worker),
        })
    }
}

type WorkerResult<P, A> = (Result<ExperimentOutcome, ExperimentError>, (P, A));

/// Control side of a running experiment.
pub struct ExperimentHandle<P, A> {
    events: Receiver<ExperimentEvent>,
    cancel: CancelToken,
    abort: AbortHandle,
    worker: Option<JoinHandle<Option<WorkerResult<P, A>>>>,
}

impl<P, A> ExperimentHandle<P, A> {
    pub fn events(&self) -> &Receiver<ExperimentEvent> {
        &self.events
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Stop at the next grid point. With `abort_move` the move in flight is
    /// aborted as well.
    pub fn cancel(&self, abort_move: bool) {
        self.cancel.cancel();
        if abort_move {
            if let Err(e) = self.abort.abort() {
                warn!("Abort request failed: {e}");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the worker and take back the instruments.
    ///
    /// A panicked worker gives [`ExperimentError::WorkerPanicked`] and no
    /// instruments.
    pub fn join(mut self) -> (Result<ExperimentOutcome, ExperimentError>, Option<(P, A)>) {
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(Some((result, parts)))) => (result, Some(parts)),
            Some(Ok(None)) | Some(Err(_)) | None => (Err(ExperimentError::WorkerPanicked), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::config::Polarization;
    use hardware::analyzer::{all_port_pairs, AnalyzerResult, SimulatedAnalyzer};
    use hardware::positioner::SimulatedPositioner;
    use shared::network::{Frequency, Network};
    use shared::settings::SettingsStore;
    use std::time::Duration;

    /// Analyzer whose driver crashes on the first read.
    struct CrashingAnalyzer;

    impl Analyzer for CrashingAnalyzer {
        fn read_sparam(&mut self, _a: usize, _b: usize) -> AnalyzerResult<Network> {
            panic!("driver crashed");
        }

        fn available_params(&self) -> Vec<(usize, usize)> {
            all_port_pairs(2)
        }

        fn nports(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_background_run_delivers_events() {
        let positioner = SimulatedPositioner::new(SettingsStore::in_memory());
        let analyzer = SimulatedAnalyzer::new(Frequency::linspace(1e9, 2e9, 3))
            .with_pose(positioner.pose());
        let config = ExperimentConfig::new(
            vec![0.0, 10.0],
            vec![0.0],
            vec![Polarization::new("V", 2, 1)],
        );

        let handle = ExperimentRunner::spawn(positioner, analyzer, config).unwrap();
        let events: Vec<_> = handle.events().iter().collect();
        let (result, parts) = handle.join();

        assert_eq!(result.unwrap().results.len(), 2);
        assert_eq!(events.first(), Some(&ExperimentEvent::Started { total_points: 2 }));
        assert_eq!(
            events.last(),
            Some(&ExperimentEvent::Finished(FinishReason::Completed))
        );
        let (positioner, analyzer) = parts.unwrap();
        assert_eq!(positioner.phi(), 10.0);
        assert_eq!(analyzer.read_count(), 2);
    }

    #[test]
    fn test_cancel_with_abort_stops_move() {
        let positioner = SimulatedPositioner::new(SettingsStore::in_memory())
            .with_move_duration(Duration::from_millis(500));
        let analyzer = SimulatedAnalyzer::new(Frequency::linspace(1e9, 2e9, 3));
        let config = ExperimentConfig::new(
            vec![90.0, 180.0],
            vec![0.0],
            vec![Polarization::new("V", 2, 1)],
        );

        let handle = ExperimentRunner::spawn(positioner, analyzer, config).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        handle.cancel(true);
        let events: Vec<_> = handle.events().iter().collect();
        let (result, parts) = handle.join();

        let outcome = result.unwrap();
        assert_eq!(outcome.reason, FinishReason::Cancelled);
        assert!(outcome.results.is_empty());
        assert_eq!(
            events.last(),
            Some(&ExperimentEvent::Finished(FinishReason::Cancelled))
        );
        let (positioner, _) = parts.unwrap();
        assert!(positioner.phi() < 90.0);
    }

    #[test]
    fn test_worker_panic_is_reported_as_error() {
        let positioner = SimulatedPositioner::new(SettingsStore::in_memory());
        let config = ExperimentConfig::new(vec![0.0], vec![0.0], vec![Polarization::new("V", 2, 1)]);

        let handle = ExperimentRunner::spawn(positioner, CrashingAnalyzer, config).unwrap();
        let events: Vec<_> = handle.events().iter().collect();
        let (result, parts) = handle.join();

        assert!(matches!(result, Err(ExperimentError::WorkerPanicked)));
        assert!(parts.is_none());
        assert_eq!(events.first(), Some(&ExperimentEvent::Started { total_points: 1 }));
        assert!(matches!(
            events.last(),
            Some(ExperimentEvent::Finished(FinishReason::Failed(_)))
        ));
    }
}
