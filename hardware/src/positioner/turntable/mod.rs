//! Serial stepper turntable driver.
//!
//! The controller drives two stepper axes: X carries theta and Y carries
//! phi. Angles are converted to step counts with the per-axis
//! [`AxisConfig`]; theta steps forward and phi steps reversed in the stock
//! configuration.
//!
//! A move is one `RN` command followed by empty status polls until the
//! controller reports `f` or `>`. There is no sleep between polls: each
//! poll blocks for at most the serial read timeout. `H` and `L` are limit
//! faults.
//!
//! Aborts are written through a cloned port handle so they can be sent
//! while the driver thread is blocked in a read. After an abort the
//! controller's step count is queried to work out how far the axis got.
//!
//! The last known angles are stored in the settings under `<model>_phi`
//! and `<model>_theta` after every move and restored on connect.

mod config;
pub mod protocol;

pub use config::{AxisConfig, ConfigError, TurntableConfig};

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use shared::settings::SettingsStore;
use tracing::{debug, info, warn};

use self::protocol::{Response, Status};
use super::{
    run_jog, AbortHandle, Axis, ConnectOptions, JogNotifier, LimitKind, MoveOutcome, Positioner,
    PositionerError, PositionerRegistry, PositionerResult,
};
use crate::serial::{self, SerialLink};

/// Lines read while looking for a reply addressed to the queried axis.
const MAX_REPLY_LINES: usize = 8;

/// Stepper turntable on a serial line.
pub struct StepperTurntable {
    config: TurntableConfig,
    link: Box<dyn SerialLink>,
    abort_link: Arc<Mutex<Box<dyn SerialLink>>>,
    abort_requested: Arc<AtomicBool>,
    notifier: JogNotifier,
    settings: SettingsStore,
    phi: f64,
    theta: f64,
    phi_count: i64,
    theta_count: i64,
}

impl StepperTurntable {
    /// Open `port` and run the controller init sequence.
    pub fn connect(
        port: &str,
        config: TurntableConfig,
        settings: SettingsStore,
    ) -> PositionerResult<Self> {
        info!("Opening {} on {port} at {} baud", config.model, config.baud_rate);
        let link = serial::open_port(port, config.baud_rate, config.timeout())
            .map_err(|e| PositionerError::Connection(format!("{port}: {e}")))?;
        Self::with_link(link, config, settings)
    }

    /// Run the init sequence over an already open link.
    pub fn with_link(
        link: Box<dyn SerialLink>,
        config: TurntableConfig,
        settings: SettingsStore,
    ) -> PositionerResult<Self> {
        let abort_link = link
            .try_clone_link()
            .map_err(|e| PositionerError::Connection(format!("cannot clone port: {e}")))?;

        let phi = settings.get_f64(&angle_key(&config.model, Axis::Phi)).unwrap_or(0.0);
        let theta = settings
            .get_f64(&angle_key(&config.model, Axis::Theta))
            .unwrap_or(0.0);

        let mut turntable = Self {
            phi_count: config.phi.initial_count,
            theta_count: config.theta.initial_count,
            config,
            link,
            abort_link: Arc::new(Mutex::new(abort_link)),
            abort_requested: Arc::new(AtomicBool::new(false)),
            notifier: JogNotifier::new(),
            settings,
            phi,
            theta,
        };
        turntable.initialize_axes()?;
        info!(
            "{} ready at phi={:.3} theta={:.3}",
            turntable.config.model, turntable.phi, turntable.theta
        );
        Ok(turntable)
    }

    pub fn config(&self) -> &TurntableConfig {
        &self.config
    }

    fn initialize_axes(&mut self) -> PositionerResult<()> {
        for axis in [Axis::Theta, Axis::Phi] {
            let prefix = prefix(axis);
            let cfg = self.axis_config(axis).clone();
            let steps = [
                (protocol::OP_INIT, String::new()),
                (protocol::OP_ABSOLUTE_POSITION, cfg.initial_count.to_string()),
                (protocol::OP_RUN_CURRENT, cfg.run_current.to_string()),
                (protocol::OP_HOLD_CURRENT, cfg.hold_current.to_string()),
                (protocol::OP_DWELL, cfg.dwell_ms.to_string()),
                (protocol::OP_STEP_SUBMODE, cfg.step_submode.to_string()),
                (protocol::OP_ENCODER_MODE, cfg.encoder_mode.to_string()),
                (protocol::OP_DIRECTION, cfg.direction.to_string()),
                (protocol::OP_START_SPEED, cfg.start_speed.to_string()),
                (protocol::OP_END_SPEED, cfg.end_speed.to_string()),
                (protocol::OP_SLOPE, cfg.slope.to_string()),
                (protocol::OP_ENCODER_ENABLE, "1".to_string()),
            ];
            for (opcode, args) in steps {
                debug!("Init {prefix}{opcode}{args}");
                if self.transact(prefix, opcode, &args)?.is_none() {
                    return Err(PositionerError::Connection(format!(
                        "no reply to {prefix}{opcode}{args}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn axis_config(&self, axis: Axis) -> &AxisConfig {
        match axis {
            Axis::Phi => &self.config.phi,
            Axis::Theta => &self.config.theta,
        }
    }

    fn count_mut(&mut self, axis: Axis) -> &mut i64 {
        match axis {
            Axis::Phi => &mut self.phi_count,
            Axis::Theta => &mut self.theta_count,
        }
    }

    fn angle_mut(&mut self, axis: Axis) -> &mut f64 {
        match axis {
            Axis::Phi => &mut self.phi,
            Axis::Theta => &mut self.theta,
        }
    }

    /// Controller step count for `axis` as tracked by the driver.
    pub fn step_count(&self, axis: Axis) -> i64 {
        match axis {
            Axis::Phi => self.phi_count,
            Axis::Theta => self.theta_count,
        }
    }

    /// Send one command and return the first reply addressed to that axis.
    fn transact(
        &mut self,
        prefix: &str,
        opcode: &str,
        args: &str,
    ) -> PositionerResult<Option<Response>> {
        self.send(prefix, opcode, args)?;
        self.read_reply(prefix, |_| true)
    }

    /// Write one command. Unread input is dropped first so the next reply
    /// read belongs to this command and not to an earlier abort.
    fn send(&mut self, prefix: &str, opcode: &str, args: &str) -> PositionerResult<()> {
        self.link.clear_input()?;
        let command = protocol::encode(prefix, opcode, args);
        self.link.write_all(command.as_bytes())?;
        self.link.flush()?;
        Ok(())
    }

    fn read_reply(
        &mut self,
        prefix: &str,
        accept: impl Fn(&Response) -> bool,
    ) -> PositionerResult<Option<Response>> {
        let expected = protocol::reply_axis(prefix);
        for _ in 0..MAX_REPLY_LINES {
            let line = serial::read_until(&mut self.link, protocol::TERMINATOR)?;
            if line.is_empty() {
                return Ok(None);
            }
            match protocol::parse_response(&line) {
                Some(reply) if Some(reply.axis) == expected && accept(&reply) => {
                    return Ok(Some(reply))
                }
                _ => debug!("Skipping reply {:?}", String::from_utf8_lossy(&line)),
            }
        }
        Ok(None)
    }

    /// Execute a hardware move and report how it ended.
    fn drive(&mut self, axis: Axis, degrees: f64) -> PositionerResult<MoveOutcome> {
        let prefix = prefix(axis);
        let steps = self.axis_config(axis).steps_for(degrees);
        let count_before = self.step_count(axis);

        self.abort_requested.store(false, Ordering::SeqCst);
        info!("Moving {axis} by {degrees:.4} deg ({steps:+} steps)");

        let first = self
            .transact(prefix, protocol::OP_RUN_RELATIVE, &format!("{steps:+}"))?
            .ok_or_else(|| PositionerError::Protocol(format!("no reply to {axis} move")))?;

        // The move reply is the first status observation. `>` there only
        // means the command was accepted, so polling continues.
        let mut status = first.status;
        let started = Instant::now();
        let max_duration = self.config.max_move_duration();
        loop {
            match status {
                Status::HomeLimit => return Err(PositionerError::Limit(LimitKind::Home)),
                Status::MaxLimit => return Err(PositionerError::Limit(LimitKind::Max)),
                Status::Finished => break,
                Status::Ready | Status::Busy(_) => {}
            }
            if self.abort_requested.load(Ordering::SeqCst) {
                break;
            }
            if started.elapsed() > max_duration {
                return Err(PositionerError::MoveTimeout {
                    axis,
                    elapsed: started.elapsed(),
                });
            }
            if let Some(reply) = self.transact(prefix, protocol::OP_STATUS, "")? {
                status = reply.status;
                if status == Status::Ready {
                    break;
                }
            }
        }

        if self.abort_requested.swap(false, Ordering::SeqCst) {
            self.recover_after_abort(axis, count_before);
            return Ok(MoveOutcome::Aborted);
        }

        *self.count_mut(axis) = count_before + steps;
        *self.angle_mut(axis) += degrees;
        self.persist(axis);
        Ok(MoveOutcome::Completed)
    }

    /// Work out how far an aborted move got from the controller's count.
    fn recover_after_abort(&mut self, axis: Axis, count_before: i64) {
        let prefix = prefix(axis);
        let reply = self
            .send(prefix, protocol::OP_POSITION, "")
            .and_then(|()| self.read_reply(prefix, |r| r.count().is_some()));

        match reply {
            Ok(Some(reply)) => {
                let count = reply.count().unwrap_or(count_before);
                let travelled = self.axis_config(axis).degrees_for(count - count_before);
                *self.count_mut(axis) = count;
                *self.angle_mut(axis) += travelled;
                self.persist(axis);
                info!("{axis} aborted after {travelled:.4} deg");
            }
            Ok(None) => warn!("{axis} aborted; position query got no reply, angle unchanged"),
            Err(e) => warn!("{axis} aborted; position query failed: {e}"),
        }
    }

    fn persist(&self, axis: Axis) {
        let key = angle_key(&self.config.model, axis);
        if let Err(e) = self.settings.set(&key, self.angle(axis)) {
            warn!("Failed to persist {key}: {e}");
        }
    }
}

fn prefix(axis: Axis) -> &'static str {
    match axis {
        Axis::Theta => protocol::AXIS_X,
        Axis::Phi => protocol::AXIS_Y,
    }
}

/// Settings key holding the last angle of `axis` for `model`.
pub fn angle_key(model: &str, axis: Axis) -> String {
    format!("{model}_{axis}")
}

impl Positioner for StepperTurntable {
    fn manufacturer(&self) -> &str {
        &self.config.manufacturer
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn phi(&self) -> f64 {
        self.phi
    }

    fn theta(&self) -> f64 {
        self.theta
    }

    fn test_connection(&mut self) -> PositionerResult<()> {
        match self.transact(protocol::AXIS_X, protocol::OP_STATUS, "")? {
            Some(_) => Ok(()),
            None => Err(PositionerError::Connection(
                "controller did not answer status poll".to_string(),
            )),
        }
    }

    fn abort_handle(&self) -> AbortHandle {
        let link = Arc::clone(&self.abort_link);
        let flag = Arc::clone(&self.abort_requested);
        AbortHandle::new(move || {
            flag.store(true, Ordering::SeqCst);
            let mut link = link.lock().unwrap_or_else(|e| e.into_inner());
            for axis in [protocol::AXIS_X, protocol::AXIS_Y, protocol::AXIS_Z] {
                link.write_all(protocol::encode(axis, protocol::OP_ABORT, "").as_bytes())?;
            }
            link.flush()?;
            warn!("Abort sent to all axes");
            Ok(())
        })
    }

    fn jog_notifier(&self) -> &JogNotifier {
        &self.notifier
    }

    fn zero_phi(&mut self) -> PositionerResult<()> {
        self.phi = 0.0;
        self.persist(Axis::Phi);
        Ok(())
    }

    fn zero_theta(&mut self) -> PositionerResult<()> {
        self.theta = 0.0;
        self.persist(Axis::Theta);
        Ok(())
    }

    fn move_relative(&mut self, axis: Axis, degrees: f64) -> PositionerResult<()> {
        let notifier = self.notifier.clone();
        run_jog(&notifier, axis, degrees, || self.drive(axis, degrees))
    }
}

/// Register the stock turntable model.
pub fn initialize(registry: &mut PositionerRegistry) {
    let stock = TurntableConfig::default();
    let manufacturer = stock.manufacturer.clone();
    let model = stock.model.clone();
    registry.register(
        &manufacturer,
        &model,
        Box::new(move |address: &str, options: &ConnectOptions| -> PositionerResult<Box<dyn Positioner>> {
            let config = options
                .turntable_config
                .clone()
                .unwrap_or_else(|| stock.clone());
            let turntable = StepperTurntable::connect(address, config, options.settings.clone())?;
            Ok(Box::new(turntable))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioner::{JogKind, MockSerialLink};
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    /// Y-axis init commands for the stock config.
    const Y_INIT: [&str; 12] = [
        "IN", "AP100000", "RC25", "HC5", "DW50", "SM8", "EM0", "DI0", "SS200", "ES1600", "SL4",
        "EE1",
    ];

    /// Answer every X command with `x0>` and the Y init with `y0>`.
    fn script_init(mock: &MockSerialLink) {
        mock.on_any("x0>\r");
        for op in Y_INIT {
            mock.on(&format!("Y0{op}\r"), "y0>\r");
        }
    }

    fn connect(mock: &MockSerialLink, config: TurntableConfig, settings: &SettingsStore) -> StepperTurntable {
        script_init(mock);
        let t = StepperTurntable::with_link(Box::new(mock.clone()), config, settings.clone())
            .unwrap();
        mock.clear_written();
        t
    }

    fn turntable(mock: &MockSerialLink) -> StepperTurntable {
        connect(mock, TurntableConfig::default(), &SettingsStore::in_memory())
    }

    #[test]
    fn test_init_sends_sequence_for_both_axes() {
        let mock = MockSerialLink::new();
        script_init(&mock);
        StepperTurntable::with_link(
            Box::new(mock.clone()),
            TurntableConfig::default(),
            SettingsStore::in_memory(),
        )
        .unwrap();

        let written = mock.written();
        assert_eq!(written.len(), 24);
        assert_eq!(written[0], "X0IN\r");
        assert_eq!(written[1], "X0AP100000\r");
        assert_eq!(written[7], "X0DI0\r");
        assert_eq!(written[11], "X0EE1\r");
        assert_eq!(written[12], "Y0IN\r");
        assert_eq!(written[19], "Y0DI0\r");
    }

    #[test]
    fn test_init_without_reply_is_connection_error() {
        let mock = MockSerialLink::new();
        let result = StepperTurntable::with_link(
            Box::new(mock),
            TurntableConfig::default(),
            SettingsStore::in_memory(),
        );
        assert!(matches!(result, Err(PositionerError::Connection(_))));
    }

    #[test]
    fn test_init_reply_from_wrong_axis_is_connection_error() {
        let mock = MockSerialLink::new();
        mock.on_any("x0>\r");
        let result = StepperTurntable::with_link(
            Box::new(mock),
            TurntableConfig::default(),
            SettingsStore::in_memory(),
        );
        assert!(matches!(result, Err(PositionerError::Connection(_))));
    }

    #[test]
    fn test_theta_move_finishes() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("X0RN+3200\r", "x0f\r");
        let rx = t.subscribe();

        t.move_theta_relative(10.0).unwrap();

        assert_eq!(t.theta(), 10.0);
        assert_eq!(t.step_count(Axis::Theta), 103_200);
        assert_eq!(mock.written(), vec!["X0RN+3200\r".to_string()]);
        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JogKind::Started, JogKind::Completed]);
    }

    #[test]
    fn test_phi_steps_are_reversed_and_polled() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("Y0RN-1600\r", "y0b\r");
        mock.on_sequence("Y0\r", &["y0b\r", "y0b\r", "y0f\r"]);

        t.move_phi_relative(5.0).unwrap();

        assert_eq!(t.phi(), 5.0);
        let polls = mock.written().iter().filter(|w| *w == "Y0\r").count();
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_accepted_move_polls_until_ready() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("X0RN+640\r", "x0>\r");
        mock.on_sequence("X0\r", &["x0b\r", "x0>\r"]);

        t.move_theta_relative(2.0).unwrap();
        assert_eq!(t.theta(), 2.0);
        assert_eq!(mock.written().len(), 3);
    }

    #[test]
    fn test_home_limit_fails_without_advancing() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("X0RN+3200\r", "x0H\r");
        let rx = t.subscribe();

        let err = t.move_theta_relative(10.0).unwrap_err();
        assert!(matches!(err, PositionerError::Limit(LimitKind::Home)));
        assert_eq!(err.to_string(), "Home limit");
        assert_eq!(t.theta(), 0.0);
        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JogKind::Started]);
    }

    #[test]
    fn test_max_limit_during_poll() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("X0RN-320\r", "x0b\r");
        mock.on_sequence("X0\r", &["x0b\r", "x0L\r"]);

        let err = t.move_theta_relative(-1.0).unwrap_err();
        assert!(matches!(err, PositionerError::Limit(LimitKind::Max)));
    }

    #[test]
    fn test_zero_move_writes_nothing() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        let rx = t.subscribe();

        t.move_phi_relative(0.0).unwrap();

        assert!(mock.written().is_empty());
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_relative_round_trip_restores_count() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("X0RN+3950\r", "x0f\r");
        mock.on("X0RN-3950\r", "x0f\r");

        let before = t.step_count(Axis::Theta);
        t.move_theta_relative(12.345).unwrap();
        t.move_theta_relative(-12.345).unwrap();
        assert_eq!(t.step_count(Axis::Theta), before);
    }

    #[test]
    fn test_absolute_move_within_one_step() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("Y0RN-2400\r", "y0f\r");

        t.move_phi_absolute(7.5).unwrap();
        assert_abs_diff_eq!(t.phi(), 7.5, epsilon = 1.0 / 320.0);
    }

    #[test]
    fn test_angles_persist_and_restore() {
        let mock = MockSerialLink::new();
        let settings = SettingsStore::in_memory();
        let mut t = connect(&mock, TurntableConfig::default(), &settings);
        mock.on("X0RN+3200\r", "x0f\r");

        t.move_theta_relative(10.0).unwrap();
        assert_eq!(settings.get_f64("Stepper Turntable_theta"), Some(10.0));

        let mut again = connect(&mock, TurntableConfig::default(), &settings);
        assert_eq!(again.theta(), 10.0);

        again.zero_all().unwrap();
        again.zero_all().unwrap();
        assert_eq!((again.phi(), again.theta()), (0.0, 0.0));
        assert_eq!(settings.get_f64("Stepper Turntable_theta"), Some(0.0));
    }

    #[test]
    fn test_abort_recovers_partial_travel() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("X0RN+3200\r", "x0b\r");
        mock.on("X0\r", "x0b\r");
        mock.on("Y0AB\r", "y0>\r");
        mock.on("Z0AB\r", "z0>\r");
        mock.on("X0PX\r", "x0>101600\r");

        let handle = t.abort_handle();
        let rx = t.subscribe();
        let aborter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.abort().unwrap();
        });

        t.move_theta_relative(10.0).unwrap();
        aborter.join().unwrap();

        assert_abs_diff_eq!(t.theta(), 5.0, epsilon = 1e-12);
        assert_eq!(t.step_count(Axis::Theta), 101_600);
        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JogKind::Started, JogKind::Aborted]);
        let written = mock.written();
        assert!(written.contains(&"Z0AB\r".to_string()));
        assert!(written.contains(&"X0PX\r".to_string()));
    }

    #[test]
    fn test_idle_abort_replies_do_not_end_next_move() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        // Every AB is answered with `x0>` that nobody reads.
        t.abort_handle().abort().unwrap();
        mock.clear_written();
        mock.on("X0RN+3200\r", "x0>\r");
        mock.on_sequence("X0\r", &["x0b\r", "x0b\r", "x0b\r", "x0f\r"]);
        let rx = t.subscribe();

        t.move_theta_relative(10.0).unwrap();

        let polls = mock.written().iter().filter(|w| *w == "X0\r").count();
        assert_eq!(polls, 4);
        assert_eq!(t.theta(), 10.0);
        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JogKind::Started, JogKind::Completed]);
    }

    #[test]
    fn test_unsolicited_line_is_not_taken_as_move_reply() {
        let mock = MockSerialLink::new();
        let mut t = turntable(&mock);
        mock.on("Y0RN-1600\r", "y0b\r");
        mock.on_sequence("Y0\r", &["y0b\r", "y0f\r"]);
        mock.inject("y0f\r");

        t.move_phi_relative(5.0).unwrap();

        let polls = mock.written().iter().filter(|w| *w == "Y0\r").count();
        assert_eq!(polls, 2);
        assert_eq!(t.phi(), 5.0);
    }

    #[test]
    fn test_stuck_move_times_out() {
        let mock = MockSerialLink::new();
        let config = TurntableConfig {
            max_move_secs: 0.05,
            ..TurntableConfig::default()
        };
        let mut t = connect(&mock, config, &SettingsStore::in_memory());
        mock.on("X0RN+320\r", "x0b\r");
        mock.on("X0\r", "x0b\r");

        let err = t.move_theta_relative(1.0).unwrap_err();
        assert!(matches!(err, PositionerError::MoveTimeout { axis: Axis::Theta, .. }));
        assert_eq!(t.theta(), 0.0);
    }
}
