//! Closed-loop crystal trim calibration.
//!
//! Each trial keys the carrier, sweeps it once and nudges the trim by an
//! amount proportional to the frequency error, clamped to
//! `[step_min, step_max]`. A higher trim lowers the carrier. Readings that
//! are missing or weaker than `min_signal_dbm` use up a trial without
//! touching the trim. If no trial lands within the tolerance window the
//! module is put back on its original trim.

use std::{fmt, time::Instant};
use tracing::{error, info, warn};

use crate::{
    analyzer::{Measurement, SpectrumAnalyzer},
    channel::Connector,
    config::CalibrationConfig,
    railtest::Dut,
    Error, TrimValue,
};

/// Result of a converged session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Calibration {
    pub trim: TrimValue,
    pub trials: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum FailureReason {
    #[error("no reading within tolerance after {0} trials")]
    TrialsExhausted(u32),
    #[error("DUT stopped responding")]
    Transport(#[source] Error),
    #[error("spectrum analyzer failed")]
    Instrument(#[source] Error),
    #[error("invalid calibration settings")]
    Config(#[source] Error),
}

/// What became of the pre-session trim after a failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rollback {
    Restored(TrimValue),
    /// Writing the original value back failed too.
    Failed(TrimValue),
    /// The session ended before the original value was known.
    Unknown,
}

impl fmt::Display for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rollback::Restored(trim) => write!(f, "trim restored to {trim}"),
            Rollback::Failed(trim) => write!(f, "restoring trim {trim} failed"),
            Rollback::Unknown => write!(f, "trim untouched"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("calibration failed after {trials} trials, {rollback}: {reason}")]
pub struct CalibrationFailure {
    #[source]
    pub reason: FailureReason,
    pub trials: u32,
    pub rollback: Rollback,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Outcome {
    Converged(TrimValue),
    Failed,
}

/// State of one calibration run.
#[derive(Clone, Debug)]
struct Session {
    max_trials: u32,
    trial: u32,
    initial: Option<TrimValue>,
    /// Last value written to the DUT; `None` while a write is unconfirmed.
    current: Option<TrimValue>,
    outcome: Option<Outcome>,
    paused: bool,
}

impl Session {
    fn new(config: &CalibrationConfig) -> Self {
        Self {
            max_trials: config.max_trials,
            trial: 0,
            initial: None,
            current: None,
            outcome: None,
            paused: false,
        }
    }

    /// Starts the next trial, or returns false once all are used up.
    fn next_trial(&mut self) -> bool {
        if self.outcome.is_some() || self.trial >= self.max_trials {
            return false;
        }
        self.trial += 1;
        true
    }
}

/// What one reading means for the trim.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Verdict {
    NoMarker,
    LowSignal(Measurement),
    Converged(Measurement),
    /// Signed trim change; positive when the carrier is above target.
    Step(Measurement, i32),
}

fn div_nearest(dividend: u64, divisor: u64) -> u64 {
    dividend.saturating_add(divisor >> 1) / divisor
}

/// Trim steps for a frequency error of `error_hz`, before direction.
pub fn step_size(config: &CalibrationConfig, error_hz: u64) -> u16 {
    let steps = div_nearest(error_hz, config.hz_per_step);
    let clamped = steps.clamp(u64::from(config.step_min), u64::from(config.step_max));
    // step_max is a u16, so the clamped value fits
    u16::try_from(clamped).unwrap_or(config.step_max)
}

pub fn assess(config: &CalibrationConfig, marker: Option<Measurement>) -> Verdict {
    let Some(m) = marker else {
        return Verdict::NoMarker;
    };
    if m.signal_dbm < config.min_signal_dbm {
        return Verdict::LowSignal(m);
    }
    let error_hz = m.frequency_hz.abs_diff(config.target_hz);
    if error_hz <= config.tolerance_hz {
        return Verdict::Converged(m);
    }
    let step = i32::from(step_size(config, error_hz));
    if m.frequency_hz < config.target_hz {
        Verdict::Step(m, -step)
    } else {
        Verdict::Step(m, step)
    }
}

fn apply_step(trim: TrimValue, step: i32) -> TrimValue {
    let magnitude = TrimValue::try_from(step.unsigned_abs()).unwrap_or(TrimValue::MAX);
    if step < 0 {
        trim.saturating_sub(magnitude)
    } else {
        trim.saturating_add(magnitude)
    }
}

/// Calibrates the DUT's crystal trim.
///
/// Holds the DUT channel open for the whole session and closes it on every
/// exit path; the analyzer is always resumed once it has been paused. On
/// failure the original trim is written back on a best-effort basis.
pub fn run_calibration<C: Connector, A: SpectrumAnalyzer>(
    dut: &mut Dut<'_, C>,
    analyzer: &mut A,
    config: &CalibrationConfig,
) -> Result<Calibration, CalibrationFailure> {
    let mut session = Session::new(config);

    let result = config
        .validate()
        .map_err(FailureReason::Config)
        .and_then(|()| dut.channel_mut().ensure_open().map_err(FailureReason::Transport))
        .and_then(|()| drive(&mut session, dut, analyzer, config));

    let outcome = match result {
        Ok(trim) => {
            debug_assert_eq!(session.outcome, Some(Outcome::Converged(trim)));
            Ok(Calibration {
                trim,
                trials: session.trial,
            })
        }
        Err(reason) => {
            session.outcome = Some(Outcome::Failed);
            let rollback = roll_back(&session, dut);
            error!(trials = session.trial, ?rollback, "*** Calibration FAILED *** {reason}");
            Err(CalibrationFailure {
                reason,
                trials: session.trial,
                rollback,
            })
        }
    };

    if session.paused {
        if let Err(err) = analyzer.resume() {
            warn!("could not resume analyzer: {err}");
        }
    }
    dut.channel_mut().close();
    outcome
}

fn roll_back<C: Connector>(session: &Session, dut: &mut Dut<'_, C>) -> Rollback {
    let Some(initial) = session.initial else {
        return Rollback::Unknown;
    };
    match dut.set_trim(initial) {
        Ok(()) => {
            warn!(trim = initial, "restored original trim");
            Rollback::Restored(initial)
        }
        Err(err) => {
            error!(trim = initial, "could not restore original trim: {err}");
            Rollback::Failed(initial)
        }
    }
}

fn drive<C: Connector, A: SpectrumAnalyzer>(
    session: &mut Session,
    dut: &mut Dut<'_, C>,
    analyzer: &mut A,
    config: &CalibrationConfig,
) -> Result<TrimValue, FailureReason> {
    use FailureReason::{Instrument, Transport};

    dut.handshake().map_err(Transport)?;
    let initial = dut.get_trim().map_err(Transport)?;
    session.initial = Some(initial);
    session.current = Some(initial);
    dut.setup_tone(&config.tone).map_err(Transport)?;

    let sweep = config.sweep();
    analyzer.set_rbw(config.rbw).map_err(Instrument)?;
    analyzer.disable_spur().map_err(Instrument)?;
    analyzer.configure_sweep(&sweep).map_err(Instrument)?;
    session.paused = true;
    analyzer.pause().map_err(Instrument)?;
    // Noise floor only, never used as a reading
    analyzer.trigger_scan(&sweep).map_err(Instrument)?;

    let mut last = Instant::now();
    while session.next_trial() {
        let trim = session.current.ok_or(Transport(Error::ChannelClosed))?;

        dut.start_tone().map_err(Transport)?;
        let scanned = analyzer.trigger_scan(&sweep);
        dut.stop_tone().map_err(Transport)?;
        scanned.map_err(Instrument)?;
        let marker = analyzer.fetch_peak_marker().map_err(Instrument)?;

        let elapsed = last.elapsed();
        last = Instant::now();
        let trial = session.trial;
        match assess(config, marker) {
            Verdict::NoMarker => warn!(trial, trim, ?elapsed, "no marker found"),
            Verdict::LowSignal(m) => warn!(
                trial,
                trim,
                freq = m.frequency_hz,
                dbm = m.signal_dbm,
                "marker strength is low"
            ),
            Verdict::Converged(m) => {
                info!(trial, trim, freq = m.frequency_hz, dbm = m.signal_dbm, ?elapsed, "converged");
                session.outcome = Some(Outcome::Converged(trim));
                return Ok(trim);
            }
            Verdict::Step(m, step) => {
                let next = apply_step(trim, step);
                info!(
                    trial,
                    trim,
                    freq = m.frequency_hz,
                    dbm = m.signal_dbm,
                    ?elapsed,
                    next,
                    "adjusting"
                );
                if sweep.at_edge(m.frequency_hz) {
                    warn!(
                        trial,
                        freq = m.frequency_hz,
                        "peak on the sweep edge, carrier may be outside the window"
                    );
                }
                session.current = None;
                dut.set_trim(next).map_err(Transport)?;
                if config.verify_writes {
                    let read = dut.get_trim().map_err(Transport)?;
                    if read != next {
                        return Err(Transport(Error::TrimReadback {
                            written: next,
                            read,
                        }));
                    }
                }
                session.current = Some(next);
            }
        }
    }
    Err(FailureReason::TrialsExhausted(session.trial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Channel, ChannelOptions},
        sim::{ScriptedConnector, SimAnalyzer, SimConnector, SimDut},
    };
    use proptest::prelude::*;
    use std::time::Duration;

    const TARGET: u64 = 908_420_000;

    fn quick() -> ChannelOptions {
        ChannelOptions {
            settle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn reading(frequency_hz: u64, signal_dbm: f64) -> Option<Measurement> {
        Some(Measurement {
            frequency_hz,
            signal_dbm,
        })
    }

    fn calibrate(
        sim: &SimDut,
        analyzer: &mut SimAnalyzer,
        config: &CalibrationConfig,
    ) -> (Result<Calibration, CalibrationFailure>, Channel<SimConnector<SimDut>>) {
        let mut channel = Channel::new(sim.connector(), quick());
        let result = run_calibration(&mut Dut::new(&mut channel), analyzer, config);
        (result, channel)
    }

    proptest! {
        #[test]
        fn step_is_clamped(error_hz in 0u64..10_000_000) {
            let config = CalibrationConfig::default();
            let step = step_size(&config, error_hz);
            prop_assert!((1..=30).contains(&step));
        }

        #[test]
        fn step_rounds_to_nearest(units in 1u64..=30) {
            let config = CalibrationConfig::default();
            prop_assert_eq!(u64::from(step_size(&config, units * 1500)), units);
            prop_assert_eq!(u64::from(step_size(&config, units * 1500 + 749)), units);
        }

        #[test]
        fn converges_on_monotonic_crystal(
            initial in 50u16..=200,
            offset in -18i32..=18,
            hz_per_unit in 1300i64..=1600,
        ) {
            let zero = u16::try_from(i32::from(initial) + offset).unwrap();
            let sim = SimDut::new(TARGET, initial, zero);
            sim.state_mut().hz_per_unit = hz_per_unit;
            let mut analyzer = sim.analyzer();
            let config = CalibrationConfig::default();

            let (result, _) = calibrate(&sim, &mut analyzer, &config);
            let cal = result.unwrap();
            prop_assert!(cal.trials <= config.max_trials);
            prop_assert_eq!(sim.state().trim, cal.trim);
            prop_assert!(sim.state().carrier_hz().abs_diff(TARGET) <= config.tolerance_hz);
        }
    }

    #[test]
    fn step_saturates() {
        let config = CalibrationConfig::default();
        assert_eq!(step_size(&config, 50_000), 30);
        assert_eq!(step_size(&config, 10), 1);
        assert_eq!(step_size(&config, 1_100), 1);
        assert_eq!(step_size(&config, 2_300), 2);
    }

    #[test]
    fn step_direction() {
        let config = CalibrationConfig::default();
        assert!(matches!(assess(&config, reading(TARGET - 4_500, -8.0)), Verdict::Step(_, -3)));
        assert!(matches!(assess(&config, reading(TARGET + 4_500, -8.0)), Verdict::Step(_, 3)));
    }

    #[test]
    fn tolerance_window_is_inclusive() {
        let config = CalibrationConfig::default();
        for hz in [TARGET - 1_000, TARGET, TARGET + 1_000] {
            assert!(matches!(assess(&config, reading(hz, -8.0)), Verdict::Converged(_)), "{hz}");
        }
        assert!(matches!(assess(&config, reading(TARGET + 1_001, -8.0)), Verdict::Step(_, 1)));
        assert!(matches!(assess(&config, reading(TARGET - 1_001, -8.0)), Verdict::Step(_, -1)));
    }

    #[test]
    fn signal_floor() {
        let config = CalibrationConfig::default();
        assert!(matches!(assess(&config, reading(TARGET, -21.0)), Verdict::LowSignal(_)));
        assert!(matches!(assess(&config, reading(TARGET, -20.0)), Verdict::Converged(_)));
        assert_eq!(assess(&config, None), Verdict::NoMarker);
    }

    #[test]
    fn trim_saturates_at_range_ends() {
        assert_eq!(apply_step(5, -30), 0);
        assert_eq!(apply_step(TrimValue::MAX - 1, 30), TrimValue::MAX);
        assert_eq!(apply_step(70, 25), 95);
    }

    #[test]
    fn scenario_70_to_95() {
        let sim = SimDut::new(TARGET, 70, 95);
        let mut analyzer = sim.analyzer();
        let (result, channel) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());

        let cal = result.unwrap();
        assert!(cal.trim.abs_diff(95) <= 1);
        assert!(cal.trials <= 6);
        assert_eq!(sim.state().trim, cal.trim);
        assert!(!channel.is_open());
        assert_eq!(analyzer.resumes, 1);
        assert!(!analyzer.paused);
        assert_eq!(analyzer.rbw, Some(crate::analyzer::Rbw::Khz(1)));
        assert!(analyzer.spur_disabled);
        assert_eq!(analyzer.sweep, Some(CalibrationConfig::default().sweep()));
        // Baseline plus one scan per trial
        assert_eq!(analyzer.scans, cal.trials as usize + 1);
        assert_eq!(analyzer.tone_scans, cal.trials as usize);
        assert!(!sim.state().tone);
    }

    #[test]
    fn already_calibrated_writes_nothing() {
        let sim = SimDut::new(TARGET, 95, 95);
        let mut analyzer = sim.analyzer();
        let (result, _) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());
        assert_eq!(result.unwrap(), Calibration { trim: 95, trials: 1 });
        assert!(sim.state().trim_writes.is_empty());
    }

    #[test]
    fn upper_edge_converges() {
        let sim = SimDut::new(TARGET, 80, 10);
        let mut analyzer = sim.analyzer().with_readings([reading(TARGET + 1_000, -8.0)]);
        let (result, _) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());
        assert_eq!(result.unwrap(), Calibration { trim: 80, trials: 1 });
    }

    #[test]
    fn just_outside_edge_steps() {
        // The modelled carrier is 1500 Hz high at 80 and on target at 81
        let sim = SimDut::new(TARGET, 80, 81);
        let mut analyzer = sim.analyzer().with_readings([reading(TARGET + 1_001, -8.0)]);
        let (result, _) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());
        assert_eq!(result.unwrap(), Calibration { trim: 81, trials: 2 });
        assert_eq!(sim.state().trim_writes, [81]);
    }

    #[test]
    fn weak_reading_is_ignored() {
        let config = CalibrationConfig::default();
        let sim = SimDut::new(TARGET, 95, 95);
        let weak = config.min_signal_dbm - 1.0;
        let mut analyzer = sim
            .analyzer()
            .with_readings([reading(TARGET, weak), reading(TARGET + 20_000, weak)]);
        let (result, _) = calibrate(&sim, &mut analyzer, &config);
        assert_eq!(result.unwrap(), Calibration { trim: 95, trials: 3 });
        assert!(sim.state().trim_writes.is_empty());
    }

    #[test]
    fn missing_marker_uses_a_trial() {
        let sim = SimDut::new(TARGET, 95, 95);
        let mut analyzer = sim.analyzer().with_readings([None, None]);
        let (result, _) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());
        assert_eq!(result.unwrap().trials, 3);
        assert!(sim.state().trim_writes.is_empty());
    }

    #[test]
    fn failure_message_chains_cause() {
        use std::error::Error as _;

        let failure = CalibrationFailure {
            reason: FailureReason::Transport(Error::Timeout),
            trials: 4,
            rollback: Rollback::Failed(70),
        };
        assert_eq!(
            failure.to_string(),
            "calibration failed after 4 trials, restoring trim 70 failed: DUT stopped responding"
        );
        let reason = failure.source().unwrap();
        assert_eq!(reason.source().unwrap().to_string(), "Timed out waiting for a line");
    }

    #[test]
    fn exhausted_trials_restore_initial_trim() {
        // Carrier stuck 20 kHz high whatever the trim
        let sim = SimDut::new(TARGET + 20_000, 70, 95);
        sim.state_mut().hz_per_unit = 0;
        let mut analyzer = sim.analyzer();
        let config = CalibrationConfig::default();
        let (result, channel) = calibrate(&sim, &mut analyzer, &config);

        let failure = result.unwrap_err();
        assert!(matches!(failure.reason, FailureReason::TrialsExhausted(12)));
        assert_eq!(failure.trials, config.max_trials);
        assert_eq!(failure.rollback, Rollback::Restored(70));
        let state = sim.state();
        assert_eq!(state.trim_writes.len(), 13);
        assert_eq!(state.trim_writes.last(), Some(&70));
        assert_eq!(state.trim, 70);
        assert_eq!(analyzer.resumes, 1);
        assert!(!channel.is_open());
    }

    #[test]
    fn no_carrier_restores_initial_trim() {
        let sim = SimDut::new(TARGET, 70, 95);
        sim.state_mut().signal_dbm = -45.0;
        let mut analyzer = sim.analyzer();
        let (result, _) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());
        let failure = result.unwrap_err();
        assert!(matches!(failure.reason, FailureReason::TrialsExhausted(_)));
        assert_eq!(sim.state().trim_writes, [70]);
    }

    #[test]
    fn silent_dut_aborts_session() {
        let sim = SimDut::new(TARGET, 70, 95);
        // handshake, getctune, four setup commands, then the first tone on
        sim.state_mut().answer_limit = Some(6);
        let mut analyzer = sim.analyzer();
        let (result, channel) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());

        let failure = result.unwrap_err();
        assert!(matches!(failure.reason, FailureReason::Transport(Error::Timeout)));
        assert_eq!(failure.trials, 1);
        assert_eq!(failure.rollback, Rollback::Failed(70));
        assert_eq!(analyzer.resumes, 1);
        assert!(!channel.is_open());
    }

    #[test]
    fn instrument_fault_is_reported_separately() {
        let sim = SimDut::new(TARGET, 70, 95);
        let mut analyzer = sim.analyzer();
        analyzer.fail_on_scan = Some(2);
        let (result, _) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());

        let failure = result.unwrap_err();
        assert!(matches!(failure.reason, FailureReason::Instrument(Error::Instrument(_))));
        assert_eq!(failure.rollback, Rollback::Restored(70));
        let state = sim.state();
        assert!(!state.tone);
        assert_eq!(state.trim, 70);
        assert_eq!(analyzer.resumes, 1);
    }

    #[test]
    fn unconfirmed_write_aborts() {
        // First reading peaks at the upper sweep edge, 20 steps high
        let sim = SimDut::new(TARGET, 70, 95);
        sim.state_mut().stuck = true;
        let mut analyzer = sim.analyzer();
        let (result, _) = calibrate(&sim, &mut analyzer, &CalibrationConfig::default());

        let failure = result.unwrap_err();
        assert!(matches!(
            failure.reason,
            FailureReason::Transport(Error::TrimReadback { written: 90, read: 70 })
        ));
        assert_eq!(failure.rollback, Rollback::Restored(70));
    }

    #[test]
    fn unverified_writes_are_trusted() {
        let sim = SimDut::new(TARGET, 70, 95);
        sim.state_mut().stuck = true;
        let mut analyzer = sim.analyzer();
        let config = CalibrationConfig {
            verify_writes: false,
            ..Default::default()
        };
        let (result, _) = calibrate(&sim, &mut analyzer, &config);
        assert!(matches!(result.unwrap_err().reason, FailureReason::TrialsExhausted(_)));
        assert!(!sim.state().commands.iter().skip(2).any(|c| c == "getctune"));
    }

    #[test]
    fn wrong_firmware_never_touches_trim() {
        let sim = SimDut::new(TARGET, 70, 95);
        let mut analyzer = sim.analyzer();
        let mut channel = Channel::new(sim.connector(), quick());
        let mut dut = Dut::new(&mut channel).expect_version("3.0");
        let failure = run_calibration(&mut dut, &mut analyzer, &CalibrationConfig::default())
            .unwrap_err();
        assert!(matches!(failure.reason, FailureReason::Transport(Error::Version { .. })));
        assert_eq!(failure.rollback, Rollback::Unknown);
        assert_eq!(analyzer.resumes, 0);
        assert!(sim.state().trim_writes.is_empty());
    }

    #[test]
    fn rejects_bad_settings_before_touching_hardware() {
        let sim = SimDut::new(TARGET, 70, 95);
        let mut analyzer = sim.analyzer();
        let config = CalibrationConfig {
            hz_per_step: 0,
            ..Default::default()
        };
        let (result, channel) = calibrate(&sim, &mut analyzer, &config);
        let failure = result.unwrap_err();
        assert!(matches!(failure.reason, FailureReason::Config(Error::Invalid(_))));
        assert_eq!(channel.connector().connects(), 0);
        assert!(sim.state().commands.is_empty());
    }

    #[test]
    fn missing_port_fails_cleanly() {
        let mut channel = Channel::new(ScriptedConnector::scripted(&[]).unplugged(), quick());
        let sim = SimDut::new(TARGET, 70, 95);
        let mut analyzer = sim.analyzer();
        let failure = run_calibration(
            &mut Dut::new(&mut channel),
            &mut analyzer,
            &CalibrationConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(failure.reason, FailureReason::Transport(Error::TransportNotFound(_))));
        assert_eq!(failure.trials, 0);
        assert_eq!(failure.rollback, Rollback::Unknown);
    }
}
