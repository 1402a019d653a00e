//! Per-detector state held by a module.

use crate::codec::{CalibrationPlot, ErrorInfo, KeyValue, ParamValue};
use crate::mapping::MappingModeControl;
use crate::stats::Stats;
use crate::{PslError, PslResult};
use log::warn;
use std::collections::HashMap;
use std::fmt;

pub const MAX_CHANNELS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Ready,
    Error,
    Adc,
    Histogram,
    ListMode,
    Characterizing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Adc => "adc",
            Self::Histogram => "histogram",
            Self::ListMode => "list mode",
            Self::Characterizing => "characterizing",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Open,
    StartOscilloscope,
    OscilloscopeData,
    StartHistogram,
    StartListMode,
    StartCalibration,
    Stop,
    CalibrationComplete,
    AsyncError,
    Close,
}

impl ChannelState {
    /// State after `transition`, or the error refusing it.
    pub fn next(self, transition: Transition) -> PslResult<ChannelState> {
        use ChannelState::*;
        use Transition::*;
        match (self, transition) {
            (_, Close) => Ok(Disconnected),
            (Disconnected, Open) => Ok(Ready),
            (Disconnected, _) => Err(PslError::NotConnected),
            (_, Open) => Err(PslError::AlreadyOpen),
            (_, AsyncError) => Ok(Error),
            (Ready, StartOscilloscope) => Ok(Adc),
            (Ready, StartHistogram) => Ok(Histogram),
            (Ready, StartListMode) => Ok(ListMode),
            (Ready, StartCalibration) => Ok(Characterizing),
            (_, StartOscilloscope | StartHistogram | StartListMode | StartCalibration) => {
                Err(PslError::NotIdle)
            }
            (Adc | Histogram | ListMode | Characterizing | Error | Ready, Stop) => Ok(Ready),
            (Adc, OscilloscopeData) => Ok(Ready),
            (Characterizing, CalibrationComplete) => Ok(Ready),
            (state, OscilloscopeData | CalibrationComplete) => Ok(state),
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Histogram | Self::ListMode)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CalibrationState {
    #[default]
    None,
    NeedRefresh,
    Ready,
}

/// Firmware options reported by the card for one channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelFeatures {
    pub gate_veto: bool,
    pub termination_50ohm: bool,
    pub attenuation_ground: bool,
    pub risetime_optimization: bool,
    pub sample_rate: f64,
}

impl Default for ChannelFeatures {
    fn default() -> Self {
        Self {
            gate_veto: false,
            termination_50ohm: false,
            attenuation_ground: false,
            risetime_optimization: false,
            sample_rate: crate::binner::DEFAULT_SAMPLE_RATE,
        }
    }
}

impl ChannelFeatures {
    pub const KEYS: [&'static str; 5] = [
        "afe.gateVetoAvailable",
        "afe.termination50OhmAvailable",
        "afe.attenuationGroundAvailable",
        "pulse.risetimeOptimizationAvailable",
        "instrument.sampleRate",
    ];

    pub fn from_params(params: &[KeyValue]) -> Self {
        let mut features = Self::default();
        for kv in params {
            let flag = kv.value.as_bool().unwrap_or(false);
            match kv.key.as_str() {
                "afe.gateVetoAvailable" => features.gate_veto = flag,
                "afe.termination50OhmAvailable" => features.termination_50ohm = flag,
                "afe.attenuationGroundAvailable" => features.attenuation_ground = flag,
                "pulse.risetimeOptimizationAvailable" => features.risetime_optimization = flag,
                "instrument.sampleRate" => {
                    if let Some(rate) = kv.value.as_f64().filter(|r| *r > 0.0) {
                        features.sample_rate = rate;
                    }
                }
                _ => {}
            }
        }
        features
    }
}

/// Latest results of a characterization on one channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Characterization {
    pub running: bool,
    pub successful: bool,
    /// Percent, 0..100.
    pub progress: f64,
    pub stage: String,
    pub blob: Option<String>,
    pub example: CalibrationPlot,
    pub model: CalibrationPlot,
    pub final_: CalibrationPlot,
}

pub const MAX_STAGE_LEN: usize = 100;

/// One-shot arrivals a caller can wait for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncEvent {
    Oscilloscope,
    Calibration,
    ParamUpdate,
}

/// Single-use completion signal for one awaited [`AsyncEvent`].
#[derive(Debug, Default)]
pub struct Latch {
    waiting: Option<AsyncEvent>,
    result: Option<PslResult<()>>,
}

impl Latch {
    pub fn arm(&mut self, event: AsyncEvent) {
        self.waiting = Some(event);
        self.result = None;
    }

    /// Completes the latch if it is waiting for `event`.
    pub fn fire(&mut self, event: AsyncEvent, result: PslResult<()>) -> bool {
        if self.waiting != Some(event) || self.result.is_some() {
            return false;
        }
        self.result = Some(result);
        true
    }

    /// Completes whatever the latch is waiting for with `err`.
    pub fn fail(&mut self, err: PslError) {
        if self.waiting.is_some() && self.result.is_none() {
            self.result = Some(Err(err));
        }
    }

    pub fn is_fired(&self) -> bool {
        self.result.is_some()
    }

    /// Consumes the result and disarms the latch.
    pub fn take(&mut self) -> Option<PslResult<()>> {
        let result = self.result.take();
        if result.is_some() {
            self.waiting = None;
        }
        result
    }
}

impl Characterization {
    pub fn set_stage(&mut self, stage: &str) {
        self.stage = stage.chars().take(MAX_STAGE_LEN).collect();
    }
}

#[derive(Debug, Default)]
pub struct Channel {
    pub index: usize,
    pub state: ChannelState,
    pub calibration: CalibrationState,
    pub stats: Stats,
    pub features: ChannelFeatures,
    pub adc_trace: Vec<i32>,
    pub mapping: MappingModeControl,
    pub characterization: Characterization,
    /// Bound firmware-set alias, if any.
    pub firmware_set: Option<String>,
    /// Cached acquisition values keyed by name.
    pub values: HashMap<String, f64>,
    /// Last value the card pushed for each parameter.
    pub params: HashMap<String, ParamValue>,
    pub last_error: Option<ErrorInfo>,
    pub latch: Latch,
    /// Set when a finished characterization still has to be fetched.
    pub fetch_calibration: bool,
    pub histograms: u64,
}

impl Channel {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, transition: Transition) -> PslResult<ChannelState> {
        self.state = self.state.next(transition)?;
        Ok(self.state)
    }

    /// Applies `transition` when the table allows it and logs a refusal.
    pub fn apply_or_warn(&mut self, transition: Transition) {
        if let Err(err) = self.apply(transition) {
            warn!(
                "channel {}: {:?} refused in {:?}: {}",
                self.index, transition, self.state, err
            );
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_cycle() {
        let mut ch = Channel::new(0);
        assert_eq!(ch.apply(Transition::Open).unwrap(), ChannelState::Ready);
        assert_eq!(
            ch.apply(Transition::StartHistogram).unwrap(),
            ChannelState::Histogram
        );
        assert!(ch.state.is_running());
        assert_eq!(
            ch.apply(Transition::StartListMode).unwrap_err(),
            PslError::NotIdle
        );
        assert_eq!(ch.apply(Transition::Stop).unwrap(), ChannelState::Ready);
    }

    #[test]
    fn refused_transition_keeps_state() {
        let mut ch = Channel::new(0);
        ch.apply_or_warn(Transition::StartHistogram);
        assert_eq!(ch.state, ChannelState::Disconnected);
        ch.apply_or_warn(Transition::Open);
        ch.apply_or_warn(Transition::Open);
        assert_eq!(ch.state, ChannelState::Ready);
    }

    #[test]
    fn single_shot_trace_returns_to_ready() {
        let state = ChannelState::Ready
            .next(Transition::StartOscilloscope)
            .unwrap();
        assert_eq!(state, ChannelState::Adc);
        assert_eq!(
            state.next(Transition::OscilloscopeData).unwrap(),
            ChannelState::Ready
        );
        assert_eq!(
            ChannelState::Histogram
                .next(Transition::OscilloscopeData)
                .unwrap(),
            ChannelState::Histogram
        );
    }

    #[test]
    fn errors_and_close() {
        for state in [
            ChannelState::Ready,
            ChannelState::Adc,
            ChannelState::ListMode,
            ChannelState::Characterizing,
        ] {
            assert_eq!(
                state.next(Transition::AsyncError).unwrap(),
                ChannelState::Error
            );
            assert_eq!(
                state.next(Transition::Close).unwrap(),
                ChannelState::Disconnected
            );
        }
        assert_eq!(
            ChannelState::Error.next(Transition::Stop).unwrap(),
            ChannelState::Ready
        );
        assert_eq!(
            ChannelState::Disconnected
                .next(Transition::StartHistogram)
                .unwrap_err(),
            PslError::NotConnected
        );
        assert_eq!(
            ChannelState::Ready.next(Transition::Open).unwrap_err(),
            PslError::AlreadyOpen
        );
    }

    #[test]
    fn calibration_completes_only_while_characterizing() {
        assert_eq!(
            ChannelState::Characterizing
                .next(Transition::CalibrationComplete)
                .unwrap(),
            ChannelState::Ready
        );
        assert_eq!(
            ChannelState::Error
                .next(Transition::CalibrationComplete)
                .unwrap(),
            ChannelState::Error
        );
    }

    #[test]
    fn features_from_card_params() {
        let features = ChannelFeatures::from_params(&[
            KeyValue::new("afe.gateVetoAvailable", ParamValue::Bool(true)),
            KeyValue::new("instrument.sampleRate", ParamValue::Float(125.0e6)),
        ]);
        assert!(features.gate_veto);
        assert!(!features.termination_50ohm);
        assert_eq!(features.sample_rate, 125.0e6);
    }

    #[test]
    fn latch_fires_only_for_awaited_event() {
        let mut latch = Latch::default();
        assert!(!latch.fire(AsyncEvent::Oscilloscope, Ok(())));
        latch.arm(AsyncEvent::Oscilloscope);
        assert!(!latch.fire(AsyncEvent::ParamUpdate, Ok(())));
        assert!(!latch.is_fired());
        assert!(latch.fire(AsyncEvent::Oscilloscope, Ok(())));
        assert_eq!(latch.take(), Some(Ok(())));
        assert_eq!(latch.take(), None);
        latch.arm(AsyncEvent::Calibration);
        latch.fail(PslError::SocketClosed);
        assert_eq!(latch.take(), Some(Err(PslError::SocketClosed)));
    }

    #[test]
    fn stage_text_is_capped() {
        let mut c = Characterization::default();
        c.set_stage(&"x".repeat(300));
        assert_eq!(c.stage.len(), MAX_STAGE_LEN);
    }
}
