//! Software positioner with no hardware behind it.
//!
//! Moves take an optional fixed time and can be aborted part way, in which
//! case the axis stops at the fraction of the move that had elapsed. Axis
//! travel can be limited to exercise limit handling. The current pose is
//! shared through [`SimulatedPose`] so a simulated analyzer can shape its
//! readings by where the antenna points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shared::settings::SettingsStore;
use tracing::{debug, warn};

use super::turntable::angle_key;
use super::{
    run_jog, AbortHandle, Axis, ConnectOptions, JogNotifier, LimitKind, MoveOutcome, Positioner,
    PositionerError, PositionerRegistry, PositionerResult,
};

pub const SIMULATED_MANUFACTURER: &str = "Simulated";
pub const SIMULATED_MODEL: &str = "Two-Axis Positioner";

/// Interval at which a timed move checks for abort.
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(2);

/// Shared (phi, theta) pose in degrees.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPose {
    inner: Arc<Mutex<(f64, f64)>>,
}

impl SimulatedPose {
    pub fn phi(&self) -> f64 {
        self.get().0
    }

    pub fn theta(&self) -> f64 {
        self.get().1
    }

    pub fn get(&self) -> (f64, f64) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, axis: Axis, value: f64) {
        let mut pose = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match axis {
            Axis::Phi => pose.0 = value,
            Axis::Theta => pose.1 = value,
        }
    }
}

/// Simulated two-axis positioner.
pub struct SimulatedPositioner {
    pose: SimulatedPose,
    move_duration: Duration,
    phi_limits: Option<(f64, f64)>,
    theta_limits: Option<(f64, f64)>,
    abort_requested: Arc<AtomicBool>,
    notifier: JogNotifier,
    settings: SettingsStore,
    moves: usize,
}

impl SimulatedPositioner {
    /// Instant moves, starting from the pose stored in `settings`.
    pub fn new(settings: SettingsStore) -> Self {
        let pose = SimulatedPose::default();
        for axis in [Axis::Phi, Axis::Theta] {
            if let Some(angle) = settings.get_f64(&angle_key(SIMULATED_MODEL, axis)) {
                pose.set(axis, angle);
            }
        }
        Self {
            pose,
            move_duration: Duration::ZERO,
            phi_limits: None,
            theta_limits: None,
            abort_requested: Arc::new(AtomicBool::new(false)),
            notifier: JogNotifier::new(),
            settings,
            moves: 0,
        }
    }

    /// Every non-zero move takes `duration`.
    pub fn with_move_duration(mut self, duration: Duration) -> Self {
        self.move_duration = duration;
        self
    }

    /// Restrict `axis` to `[min, max]` degrees. Moves past `min` hit the
    /// home limit and moves past `max` hit the max limit.
    pub fn with_limits(mut self, axis: Axis, min: f64, max: f64) -> Self {
        match axis {
            Axis::Phi => self.phi_limits = Some((min, max)),
            Axis::Theta => self.theta_limits = Some((min, max)),
        }
        self
    }

    pub fn pose(&self) -> SimulatedPose {
        self.pose.clone()
    }

    /// Number of non-zero moves performed.
    pub fn move_count(&self) -> usize {
        self.moves
    }

    fn limits(&self, axis: Axis) -> Option<(f64, f64)> {
        match axis {
            Axis::Phi => self.phi_limits,
            Axis::Theta => self.theta_limits,
        }
    }

    fn drive(&mut self, axis: Axis, degrees: f64) -> PositionerResult<MoveOutcome> {
        let start = self.angle(axis);
        let target = start + degrees;
        if let Some((min, max)) = self.limits(axis) {
            if target < min {
                return Err(PositionerError::Limit(LimitKind::Home));
            }
            if target > max {
                return Err(PositionerError::Limit(LimitKind::Max));
            }
        }

        self.abort_requested.store(false, Ordering::SeqCst);
        self.moves += 1;
        debug!("Simulated {axis} move {start:.3} -> {target:.3}");

        let began = Instant::now();
        while began.elapsed() < self.move_duration {
            if self.abort_requested.swap(false, Ordering::SeqCst) {
                let fraction = began.elapsed().as_secs_f64() / self.move_duration.as_secs_f64();
                self.pose.set(axis, start + degrees * fraction.min(1.0));
                self.persist(axis);
                return Ok(MoveOutcome::Aborted);
            }
            std::thread::sleep(ABORT_CHECK_INTERVAL.min(self.move_duration));
        }

        self.pose.set(axis, target);
        self.persist(axis);
        Ok(MoveOutcome::Completed)
    }

    fn persist(&self, axis: Axis) {
        let key = angle_key(SIMULATED_MODEL, axis);
        if let Err(e) = self.settings.set(&key, self.angle(axis)) {
            warn!("Failed to persist {key}: {e}");
        }
    }
}

impl Positioner for SimulatedPositioner {
    fn manufacturer(&self) -> &str {
        SIMULATED_MANUFACTURER
    }

    fn model(&self) -> &str {
        SIMULATED_MODEL
    }

    fn phi(&self) -> f64 {
        self.pose.phi()
    }

    fn theta(&self) -> f64 {
        self.pose.theta()
    }

    fn test_connection(&mut self) -> PositionerResult<()> {
        Ok(())
    }

    fn abort_handle(&self) -> AbortHandle {
        let flag = Arc::clone(&self.abort_requested);
        AbortHandle::new(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn jog_notifier(&self) -> &JogNotifier {
        &self.notifier
    }

    fn zero_phi(&mut self) -> PositionerResult<()> {
        self.pose.set(Axis::Phi, 0.0);
        self.persist(Axis::Phi);
        Ok(())
    }

    fn zero_theta(&mut self) -> PositionerResult<()> {
        self.pose.set(Axis::Theta, 0.0);
        self.persist(Axis::Theta);
        Ok(())
    }

    fn move_relative(&mut self, axis: Axis, degrees: f64) -> PositionerResult<()> {
        let notifier = self.notifier.clone();
        run_jog(&notifier, axis, degrees, || self.drive(axis, degrees))
    }
}

/// Register the simulated positioner.
pub fn initialize(registry: &mut PositionerRegistry) {
    registry.register(
        SIMULATED_MANUFACTURER,
        SIMULATED_MODEL,
        Box::new(|_address: &str, options: &ConnectOptions| -> PositionerResult<Box<dyn Positioner>> {
            let positioner = SimulatedPositioner::new(options.settings.clone())
                .with_move_duration(options.simulated_move_duration);
            Ok(Box::new(positioner))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioner::JogKind;

    #[test]
    fn test_absolute_moves_and_zero() {
        let mut p = SimulatedPositioner::new(SettingsStore::in_memory());
        p.move_phi_absolute(-10.0).unwrap();
        p.move_theta_absolute(30.0).unwrap();
        p.move_phi_absolute(10.0).unwrap();
        assert_eq!((p.phi(), p.theta()), (10.0, 30.0));
        assert_eq!(p.pose().get(), (10.0, 30.0));

        p.zero_all().unwrap();
        assert_eq!((p.phi(), p.theta()), (0.0, 0.0));
    }

    #[test]
    fn test_zero_length_move_is_not_counted() {
        let mut p = SimulatedPositioner::new(SettingsStore::in_memory());
        let rx = p.subscribe();
        p.move_theta_absolute(0.0).unwrap();
        assert_eq!(p.move_count(), 0);
        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JogKind::Started, JogKind::Completed]);
    }

    #[test]
    fn test_limits() {
        let mut p =
            SimulatedPositioner::new(SettingsStore::in_memory()).with_limits(Axis::Theta, -5.0, 5.0);
        assert!(matches!(
            p.move_theta_relative(6.0),
            Err(PositionerError::Limit(LimitKind::Max))
        ));
        assert!(matches!(
            p.move_theta_relative(-6.0),
            Err(PositionerError::Limit(LimitKind::Home))
        ));
        assert_eq!(p.theta(), 0.0);
    }

    #[test]
    fn test_abort_stops_part_way() {
        let mut p = SimulatedPositioner::new(SettingsStore::in_memory())
            .with_move_duration(Duration::from_millis(400));
        let rx = p.subscribe();
        let handle = p.abort_handle();
        let aborter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.abort().unwrap();
        });

        p.move_phi_relative(90.0).unwrap();
        aborter.join().unwrap();

        assert!(p.phi() > 0.0 && p.phi() < 90.0);
        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JogKind::Started, JogKind::Aborted]);
    }

    #[test]
    fn test_pose_restored_from_settings() {
        let settings = SettingsStore::in_memory();
        let mut p = SimulatedPositioner::new(settings.clone());
        p.move_phi_relative(12.0).unwrap();

        let restored = SimulatedPositioner::new(settings);
        assert_eq!(restored.phi(), 12.0);
    }

    #[test]
    fn test_pose_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        {
            let mut p = SimulatedPositioner::new(SettingsStore::with_path(path.clone()).unwrap());
            p.move_theta_absolute(-7.5).unwrap();
        }

        let restored = SimulatedPositioner::new(SettingsStore::with_path(path).unwrap());
        assert_eq!(restored.theta(), -7.5);
        assert_eq!(restored.phi(), 0.0);
    }
}
