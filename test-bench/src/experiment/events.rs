//! Events emitted by a running experiment.

use std::time::Duration;

use crossbeam_channel::Sender;
use shared::network::Network;

/// Why a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishReason {
    /// Every grid point was measured
    Completed,
    /// Cancelled, or a move was aborted
    Cancelled,
    /// A positioner or analyzer fault stopped the run
    Failed(String),
}

/// One message from the orchestrator.
///
/// Within a run `Started` comes first and `Finished` last. `DataAcquired`
/// follows grid order: theta outer, phi inner, polarization innermost.
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentEvent {
    Started { total_points: usize },
    DataAcquired(Network),
    /// Grid points completed in the current theta cut
    CutIterCountUpdated(usize),
    /// Grid points completed in the whole run
    TotalIterCountUpdated(usize),
    /// Estimated time left
    TimeEstUpdated(Duration),
    Finished(FinishReason),
}

/// Receiver of experiment events.
pub trait EventSink {
    fn emit(&mut self, event: ExperimentEvent);
}

/// Events are dropped once the receiving side hangs up.
impl EventSink for Sender<ExperimentEvent> {
    fn emit(&mut self, event: ExperimentEvent) {
        let _ = self.send(event);
    }
}

impl EventSink for Vec<ExperimentEvent> {
    fn emit(&mut self, event: ExperimentEvent) {
        self.push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: ExperimentEvent) {
        (**self).emit(event);
    }
}
