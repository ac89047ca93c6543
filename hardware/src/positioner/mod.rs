//! Two-axis antenna positioners.
//!
//! Every positioner exposes the same jog contract through [`Positioner`]:
//!
//! - `move_relative(axis, 0)` emits `Started` then `Completed` and never
//!   touches hardware.
//! - A non-zero move emits `Started` before the first hardware write and
//!   exactly one of `Completed` or `Aborted` afterwards. A limit or I/O
//!   fault returns an error and emits no terminal event.
//! - Absolute moves are relative moves by `target - current`.
//! - [`AbortHandle`] can stop an in-flight move from another thread.
//!
//! Jog events are delivered to any number of subscribers through
//! [`JogNotifier`].

mod registry;
mod simulated;
pub mod turntable;

pub use registry::{ConnectOptions, PositionerCtor, PositionerRegistry, RegistryError};
pub use simulated::{SimulatedPose, SimulatedPositioner, SIMULATED_MANUFACTURER, SIMULATED_MODEL};
pub use turntable::{AxisConfig, ConfigError, StepperTurntable, TurntableConfig};

pub use crate::serial::MockSerialLink;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::debug;

/// Angles below this magnitude are treated as no move.
pub const JOG_EPSILON_DEG: f64 = 1e-9;

/// Positioner axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Azimuth-like axis
    Phi,
    /// Elevation-like axis
    Theta,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Phi => write!(f, "phi"),
            Axis::Theta => write!(f, "theta"),
        }
    }
}

/// Which end stop was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Home,
    Max,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Home => write!(f, "Home limit"),
            LimitKind::Max => write!(f, "Max limit"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PositionerError {
    /// Initialization handshake failed
    #[error("connection error: {0}")]
    Connection(String),

    /// End stop reached during a move
    #[error("{0}")]
    Limit(LimitKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No terminal status before the move watchdog expired
    #[error("{axis} move did not finish within {elapsed:?}")]
    MoveTimeout { axis: Axis, elapsed: Duration },

    /// Controller sent something the driver cannot use
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type PositionerResult<T> = Result<T, PositionerError>;

/// Jog lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogKind {
    Started,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JogEvent {
    pub axis: Axis,
    pub kind: JogKind,
}

/// Fan-out of jog events to subscribers.
///
/// Subscribers whose receiver has been dropped are pruned on the next emit.
#[derive(Debug, Clone, Default)]
pub struct JogNotifier {
    subscribers: Arc<Mutex<Vec<Sender<JogEvent>>>>,
}

impl JogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<JogEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn emit(&self, axis: Axis, kind: JogKind) {
        debug!("Jog {axis} {kind:?}");
        let event = JogEvent { axis, kind };
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event).is_ok());
    }
}

/// Thread-safe handle that stops any in-flight move.
#[derive(Clone)]
pub struct AbortHandle {
    abort: Arc<dyn Fn() -> PositionerResult<()> + Send + Sync>,
}

impl AbortHandle {
    pub fn new(abort: impl Fn() -> PositionerResult<()> + Send + Sync + 'static) -> Self {
        Self {
            abort: Arc::new(abort),
        }
    }

    pub fn abort(&self) -> PositionerResult<()> {
        (self.abort)()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle").finish_non_exhaustive()
    }
}

/// How a hardware move ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Completed,
    Aborted,
}

/// Run one relative jog with the event contract shared by all drivers.
///
/// `body` performs the hardware move and is skipped for zero-length jogs.
pub fn run_jog<F>(notifier: &JogNotifier, axis: Axis, degrees: f64, body: F) -> PositionerResult<()>
where
    F: FnOnce() -> PositionerResult<MoveOutcome>,
{
    notifier.emit(axis, JogKind::Started);
    if degrees.abs() < JOG_EPSILON_DEG {
        notifier.emit(axis, JogKind::Completed);
        return Ok(());
    }
    match body()? {
        MoveOutcome::Completed => notifier.emit(axis, JogKind::Completed),
        MoveOutcome::Aborted => notifier.emit(axis, JogKind::Aborted),
    }
    Ok(())
}

/// Two-axis positioner.
pub trait Positioner: Send {
    fn manufacturer(&self) -> &str;

    fn model(&self) -> &str;

    /// Current phi angle in degrees.
    fn phi(&self) -> f64;

    /// Current theta angle in degrees.
    fn theta(&self) -> f64;

    /// Check that the controller answers.
    fn test_connection(&mut self) -> PositionerResult<()>;

    /// Handle for stopping moves from another thread.
    fn abort_handle(&self) -> AbortHandle;

    fn abort_movement(&self) -> PositionerResult<()> {
        self.abort_handle().abort()
    }

    fn jog_notifier(&self) -> &JogNotifier;

    fn subscribe(&self) -> Receiver<JogEvent> {
        self.jog_notifier().subscribe()
    }

    /// Declare the current phi pose to be zero.
    fn zero_phi(&mut self) -> PositionerResult<()>;

    /// Declare the current theta pose to be zero.
    fn zero_theta(&mut self) -> PositionerResult<()>;

    fn zero_all(&mut self) -> PositionerResult<()> {
        self.zero_phi()?;
        self.zero_theta()
    }

    /// Move `axis` by `degrees` and block until it stops.
    fn move_relative(&mut self, axis: Axis, degrees: f64) -> PositionerResult<()>;

    fn angle(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Phi => self.phi(),
            Axis::Theta => self.theta(),
        }
    }

    fn move_absolute(&mut self, axis: Axis, degrees: f64) -> PositionerResult<()> {
        let delta = degrees - self.angle(axis);
        self.move_relative(axis, delta)
    }

    fn move_phi_relative(&mut self, degrees: f64) -> PositionerResult<()> {
        self.move_relative(Axis::Phi, degrees)
    }

    fn move_theta_relative(&mut self, degrees: f64) -> PositionerResult<()> {
        self.move_relative(Axis::Theta, degrees)
    }

    fn move_phi_absolute(&mut self, degrees: f64) -> PositionerResult<()> {
        self.move_absolute(Axis::Phi, degrees)
    }

    fn move_theta_absolute(&mut self, degrees: f64) -> PositionerResult<()> {
        self.move_absolute(Axis::Theta, degrees)
    }
}

impl<P: Positioner + ?Sized> Positioner for Box<P> {
    fn manufacturer(&self) -> &str {
        (**self).manufacturer()
    }

    fn model(&self) -> &str {
        (**self).model()
    }

    fn phi(&self) -> f64 {
        (**self).phi()
    }

    fn theta(&self) -> f64 {
        (**self).theta()
    }

    fn test_connection(&mut self) -> PositionerResult<()> {
        (**self).test_connection()
    }

    fn abort_handle(&self) -> AbortHandle {
        (**self).abort_handle()
    }

    fn jog_notifier(&self) -> &JogNotifier {
        (**self).jog_notifier()
    }

    fn zero_phi(&mut self) -> PositionerResult<()> {
        (**self).zero_phi()
    }

    fn zero_theta(&mut self) -> PositionerResult<()> {
        (**self).zero_theta()
    }

    fn zero_all(&mut self) -> PositionerResult<()> {
        (**self).zero_all()
    }

    fn move_relative(&mut self, axis: Axis, degrees: f64) -> PositionerResult<()> {
        (**self).move_relative(axis, degrees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_jog_skips_body() {
        let notifier = JogNotifier::new();
        let rx = notifier.subscribe();

        run_jog(&notifier, Axis::Phi, 0.0, || panic!("body must not run")).unwrap();

        let events: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(events, vec![JogKind::Started, JogKind::Completed]);
    }

    #[test]
    fn test_aborted_body_emits_aborted() {
        let notifier = JogNotifier::new();
        let rx = notifier.subscribe();

        run_jog(&notifier, Axis::Theta, 5.0, || Ok(MoveOutcome::Aborted)).unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                JogEvent { axis: Axis::Theta, kind: JogKind::Started },
                JogEvent { axis: Axis::Theta, kind: JogKind::Aborted },
            ]
        );
    }

    #[test]
    fn test_failed_body_has_no_terminal_event() {
        let notifier = JogNotifier::new();
        let rx = notifier.subscribe();

        let err = run_jog(&notifier, Axis::Phi, 1.0, || {
            Err(PositionerError::Limit(LimitKind::Max))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Max limit");

        let events: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(events, vec![JogKind::Started]);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let notifier = JogNotifier::new();
        drop(notifier.subscribe());
        let rx = notifier.subscribe();
        notifier.emit(Axis::Phi, JogKind::Started);
        assert_eq!(rx.len(), 1);
        assert_eq!(notifier.subscribers.lock().unwrap().len(), 1);
    }
}
