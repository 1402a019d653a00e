//! Message bodies carried inside transport frames.
//!
//! A body is a varint message type followed by the fields of that message in
//! a fixed order. Requests flow host to card; responses and asynchronous
//! events flow card to host.

use crate::transport::{decode_varint, encode_varint};
use crate::{PslError, PslResult};
use bytes::{Buf, BufMut, BytesMut};

/// Channel id addressing every channel of a card.
pub const ALL_CHANNELS: i32 = -1;

const MAX_REPEATED: u64 = 1 << 24;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// One of a closed set of option names.
    Opt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int = 0,
    Float = 1,
    Bool = 2,
    Str = 3,
    Opt = 4,
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            Self::Int(_) => ParamType::Int,
            Self::Float(_) => ParamType::Float,
            Self::Bool(_) => ParamType::Bool,
            Self::Str(_) => ParamType::Str,
            Self::Opt(_) => ParamType::Opt,
        }
    }

    /// Numeric view used by the acquisition value registry.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Str(s) | Self::Opt(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Opt(s) => Some(s),
            _ => None,
        }
    }

    /// Builds a value of `ty` from a registry double.
    pub fn from_f64(ty: ParamType, value: f64) -> Self {
        match ty {
            ParamType::Int => Self::Int(value.round() as i64),
            ParamType::Float => Self::Float(value),
            ParamType::Bool => Self::Bool(value != 0.0),
            ParamType::Str => Self::Str(value.to_string()),
            ParamType::Opt => Self::Opt(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: ParamValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: ParamValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDetails {
    pub param: KeyValue,
    pub read_only: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: i32,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(err: PslError, message: impl Into<String>) -> Self {
        Self {
            code: err.card_code(),
            message: message.into(),
        }
    }

    pub fn to_error(&self) -> PslError {
        PslError::from_card_code(self.code)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationPlot {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl CalibrationPlot {
    pub fn len(&self) -> usize {
        self.x.len().min(self.y.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a pulse characterization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationInfo {
    /// Opaque, card-encrypted blob.
    pub data: String,
    pub example: CalibrationPlot,
    pub model: CalibrationPlot,
    pub final_: CalibrationPlot,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramStats {
    pub time_elapsed: f64,
    pub samples_detected: u64,
    pub samples_erased: u64,
    pub pulses_accepted: u64,
    pub pulses_rejected: u64,
    pub input_count_rate: f64,
    pub output_count_rate: f64,
    /// Fraction, 0..1.
    pub dead_time: f64,
    pub underflows: u64,
    pub overflows: u64,
    pub gate_state: bool,
    /// Set on gated or spatial histograms when a pixel boundary was crossed.
    pub pixel_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    pub channel: i32,
    pub data_set_id: u64,
    pub accepted: Vec<u32>,
    pub rejected: Vec<u32>,
    pub stats: HistogramStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping { verbose: bool },
    GetParam { channel: i32, key: String },
    GetParams { channel: i32, keys: Vec<String> },
    SetParam { channel: i32, param: KeyValue },
    SetParams { channel: i32, params: Vec<KeyValue> },
    ListParamDetails { channel: i32, prefix: String },
    StartOscilloscope { channel: i32 },
    StartHistogram { channel: i32 },
    StartFft { channel: i32 },
    StartListMode { channel: i32 },
    StartCalibration { channel: i32 },
    Stop { channel: i32 },
    GetCalibration { channel: i32 },
    SetCalibration { channel: i32, calibration: CalibrationInfo },
    CalculateDcOffset { channel: i32 },
    SaveConfiguration,
    DeleteSavedConfiguration,
    SoftwareUpdate { image: Vec<u8>, checksum: String, auto_restart: bool },
    MonitorChannels { channels: Vec<i32> },
    CheckParamConsistency { channel: i32 },
    Restart,
    ResetSpatialSystem,
    ProbeDatagram,
    SynchronizeLog { log_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success {
        channel: i32,
        error: Option<ErrorInfo>,
    },
    GetParamResponse {
        channel: i32,
        results: Vec<KeyValue>,
        error: Option<ErrorInfo>,
    },
    GetCalibrationResponse {
        channel: i32,
        calibration: CalibrationInfo,
        error: Option<ErrorInfo>,
    },
    CalculateDcOffsetResponse {
        channel: i32,
        offset: f64,
        error: Option<ErrorInfo>,
    },
    ListParamDetailsResponse {
        channel: i32,
        details: Vec<ParamDetails>,
        error: Option<ErrorInfo>,
    },
    CalibrationProgress {
        channel: i32,
        /// Fraction complete, 0..1.
        progress: f64,
        complete: bool,
        stage: String,
        error: Option<ErrorInfo>,
    },
    ParamUpdated {
        channel: i32,
        params: Vec<KeyValue>,
    },
    OscilloscopeData {
        channel: i32,
        samples: Vec<i32>,
    },
    HistogramData(Histogram),
    HistogramDatagram(Histogram),
    ListModeData {
        channel: i32,
        data: Vec<u8>,
    },
    CheckParamConsistencyResponse {
        channel: i32,
        consistent: bool,
        message: String,
        error: Option<ErrorInfo>,
    },
    SoftwareUpdateComplete {
        error: Option<ErrorInfo>,
    },
    AsynchronousError {
        channel: i32,
        error: ErrorInfo,
    },
}

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ping = 1,
    GetParam = 2,
    GetParams = 3,
    SetParam = 4,
    SetParams = 5,
    ListParamDetails = 6,
    StartOscilloscope = 7,
    StartHistogram = 8,
    StartFft = 9,
    StartListMode = 10,
    StartCalibration = 11,
    Stop = 12,
    GetCalibration = 13,
    SetCalibration = 14,
    CalculateDcOffset = 15,
    SaveConfiguration = 16,
    DeleteSavedConfiguration = 17,
    SoftwareUpdate = 18,
    MonitorChannels = 19,
    CheckParamConsistency = 20,
    Restart = 21,
    ResetSpatialSystem = 22,
    ProbeDatagram = 23,
    SynchronizeLog = 24,

    Success = 64,
    GetParamResponse = 65,
    GetCalibrationResponse = 66,
    CalculateDcOffsetResponse = 67,
    ListParamDetailsResponse = 68,
    CalibrationProgress = 69,
    ParamUpdated = 70,
    OscilloscopeData = 71,
    HistogramData = 72,
    HistogramDatagram = 73,
    ListModeData = 74,
    CheckParamConsistencyResponse = 75,
    SoftwareUpdateComplete = 76,
    AsynchronousError = 77,
}

impl TryFrom<u64> for MessageType {
    type Error = PslError;

    fn try_from(value: u64) -> PslResult<Self> {
        use MessageType::*;
        Ok(match value {
            1 => Ping,
            2 => GetParam,
            3 => GetParams,
            4 => SetParam,
            5 => SetParams,
            6 => ListParamDetails,
            7 => StartOscilloscope,
            8 => StartHistogram,
            9 => StartFft,
            10 => StartListMode,
            11 => StartCalibration,
            12 => Stop,
            13 => GetCalibration,
            14 => SetCalibration,
            15 => CalculateDcOffset,
            16 => SaveConfiguration,
            17 => DeleteSavedConfiguration,
            18 => SoftwareUpdate,
            19 => MonitorChannels,
            20 => CheckParamConsistency,
            21 => Restart,
            22 => ResetSpatialSystem,
            23 => ProbeDatagram,
            24 => SynchronizeLog,
            64 => Success,
            65 => GetParamResponse,
            66 => GetCalibrationResponse,
            67 => CalculateDcOffsetResponse,
            68 => ListParamDetailsResponse,
            69 => CalibrationProgress,
            70 => ParamUpdated,
            71 => OscilloscopeData,
            72 => HistogramData,
            73 => HistogramDatagram,
            74 => ListModeData,
            75 => CheckParamConsistencyResponse,
            76 => SoftwareUpdateComplete,
            77 => AsynchronousError,
            _ => return Err(PslError::FormatError),
        })
    }
}

struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    fn new(ty: MessageType) -> Self {
        let mut enc = Self {
            buf: BytesMut::with_capacity(64),
        };
        enc.varint(ty as u64);
        enc
    }

    fn varint(&mut self, value: u64) {
        let mut tmp = Vec::with_capacity(10);
        encode_varint(value, &mut tmp);
        self.buf.put_slice(&tmp);
    }

    fn int(&mut self, value: i64) {
        self.varint(((value << 1) ^ (value >> 63)) as u64);
    }

    fn float(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    fn boolean(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    fn bytes(&mut self, value: &[u8]) {
        self.varint(value.len() as u64);
        self.buf.put_slice(value);
    }

    fn string(&mut self, value: &str) {
        self.bytes(value.as_bytes());
    }

    fn strings(&mut self, values: &[String]) {
        self.varint(values.len() as u64);
        values.iter().for_each(|s| self.string(s));
    }

    fn floats(&mut self, values: &[f64]) {
        self.varint(values.len() as u64);
        values.iter().for_each(|v| self.float(*v));
    }

    fn words(&mut self, values: &[u32]) {
        self.varint(values.len() as u64);
        values.iter().for_each(|v| self.varint(u64::from(*v)));
    }

    fn ints(&mut self, values: &[i32]) {
        self.varint(values.len() as u64);
        values.iter().for_each(|v| self.int(i64::from(*v)));
    }

    fn opt_float(&mut self, value: Option<f64>) {
        self.boolean(value.is_some());
        if let Some(v) = value {
            self.float(v);
        }
    }

    fn value(&mut self, value: &ParamValue) {
        self.buf.put_u8(value.param_type() as u8);
        match value {
            ParamValue::Int(v) => self.int(*v),
            ParamValue::Float(v) => self.float(*v),
            ParamValue::Bool(v) => self.boolean(*v),
            ParamValue::Str(s) | ParamValue::Opt(s) => self.string(s),
        }
    }

    fn key_value(&mut self, kv: &KeyValue) {
        self.string(&kv.key);
        self.value(&kv.value);
    }

    fn key_values(&mut self, kvs: &[KeyValue]) {
        self.varint(kvs.len() as u64);
        kvs.iter().for_each(|kv| self.key_value(kv));
    }

    fn error(&mut self, error: &Option<ErrorInfo>) {
        self.boolean(error.is_some());
        if let Some(e) = error {
            self.int(i64::from(e.code));
            self.string(&e.message);
        }
    }

    fn plot(&mut self, plot: &CalibrationPlot) {
        self.floats(&plot.x);
        self.floats(&plot.y);
    }

    fn calibration(&mut self, cal: &CalibrationInfo) {
        self.string(&cal.data);
        self.plot(&cal.example);
        self.plot(&cal.model);
        self.plot(&cal.final_);
    }

    fn histogram(&mut self, h: &Histogram) {
        self.int(i64::from(h.channel));
        self.varint(h.data_set_id);
        self.words(&h.accepted);
        self.words(&h.rejected);
        let s = &h.stats;
        self.float(s.time_elapsed);
        self.varint(s.samples_detected);
        self.varint(s.samples_erased);
        self.varint(s.pulses_accepted);
        self.varint(s.pulses_rejected);
        self.float(s.input_count_rate);
        self.float(s.output_count_rate);
        self.float(s.dead_time);
        self.varint(s.underflows);
        self.varint(s.overflows);
        self.boolean(s.gate_state);
        self.boolean(s.pixel_complete);
    }

    fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> PslResult<()> {
        if self.buf.remaining() < n {
            Err(PslError::FormatError)
        } else {
            Ok(())
        }
    }

    fn varint(&mut self) -> PslResult<u64> {
        let (value, used) = decode_varint(self.buf)?.ok_or(PslError::FormatError)?;
        self.buf.advance(used);
        Ok(value)
    }

    fn count(&mut self) -> PslResult<usize> {
        let n = self.varint()?;
        if n > MAX_REPEATED {
            return Err(PslError::TooBig);
        }
        Ok(n as usize)
    }

    fn int(&mut self) -> PslResult<i64> {
        let raw = self.varint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn int32(&mut self) -> PslResult<i32> {
        i32::try_from(self.int()?).map_err(|_| PslError::FormatError)
    }

    fn word(&mut self) -> PslResult<u32> {
        u32::try_from(self.varint()?).map_err(|_| PslError::FormatError)
    }

    fn float(&mut self) -> PslResult<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    fn boolean(&mut self) -> PslResult<bool> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(PslError::FormatError),
        }
    }

    fn bytes(&mut self) -> PslResult<Vec<u8>> {
        let n = self.count()?;
        self.need(n)?;
        let out = self.buf[..n].to_vec();
        self.buf.advance(n);
        Ok(out)
    }

    fn string(&mut self) -> PslResult<String> {
        String::from_utf8(self.bytes()?).map_err(|_| PslError::FormatError)
    }

    fn strings(&mut self) -> PslResult<Vec<String>> {
        let n = self.count()?;
        (0..n).map(|_| self.string()).collect()
    }

    fn floats(&mut self) -> PslResult<Vec<f64>> {
        let n = self.count()?;
        self.need(n.saturating_mul(8))?;
        (0..n).map(|_| self.float()).collect()
    }

    fn words(&mut self) -> PslResult<Vec<u32>> {
        let n = self.count()?;
        self.need(n)?;
        (0..n).map(|_| self.word()).collect()
    }

    fn ints(&mut self) -> PslResult<Vec<i32>> {
        let n = self.count()?;
        self.need(n)?;
        (0..n).map(|_| self.int32()).collect()
    }

    fn opt_float(&mut self) -> PslResult<Option<f64>> {
        if self.boolean()? {
            Ok(Some(self.float()?))
        } else {
            Ok(None)
        }
    }

    fn value(&mut self) -> PslResult<ParamValue> {
        self.need(1)?;
        Ok(match self.buf.get_u8() {
            0 => ParamValue::Int(self.int()?),
            1 => ParamValue::Float(self.float()?),
            2 => ParamValue::Bool(self.boolean()?),
            3 => ParamValue::Str(self.string()?),
            4 => ParamValue::Opt(self.string()?),
            _ => return Err(PslError::BadType),
        })
    }

    fn key_value(&mut self) -> PslResult<KeyValue> {
        let key = self.string()?;
        let value = self.value()?;
        Ok(KeyValue { key, value })
    }

    fn key_values(&mut self) -> PslResult<Vec<KeyValue>> {
        let n = self.count()?;
        (0..n).map(|_| self.key_value()).collect()
    }

    fn error(&mut self) -> PslResult<Option<ErrorInfo>> {
        if !self.boolean()? {
            return Ok(None);
        }
        let code = self.int32()?;
        let message = self.string()?;
        Ok(Some(ErrorInfo { code, message }))
    }

    fn plot(&mut self) -> PslResult<CalibrationPlot> {
        let x = self.floats()?;
        let y = self.floats()?;
        Ok(CalibrationPlot { x, y })
    }

    fn calibration(&mut self) -> PslResult<CalibrationInfo> {
        Ok(CalibrationInfo {
            data: self.string()?,
            example: self.plot()?,
            model: self.plot()?,
            final_: self.plot()?,
        })
    }

    fn histogram(&mut self) -> PslResult<Histogram> {
        let channel = self.int32()?;
        let data_set_id = self.varint()?;
        let accepted = self.words()?;
        let rejected = self.words()?;
        let stats = HistogramStats {
            time_elapsed: self.float()?,
            samples_detected: self.varint()?,
            samples_erased: self.varint()?,
            pulses_accepted: self.varint()?,
            pulses_rejected: self.varint()?,
            input_count_rate: self.float()?,
            output_count_rate: self.float()?,
            dead_time: self.float()?,
            underflows: self.varint()?,
            overflows: self.varint()?,
            gate_state: self.boolean()?,
            pixel_complete: self.boolean()?,
        };
        Ok(Histogram {
            channel,
            data_set_id,
            accepted,
            rejected,
            stats,
        })
    }

    fn finish<T>(self, value: T) -> PslResult<T> {
        if self.buf.has_remaining() {
            Err(PslError::FormatError)
        } else {
            Ok(value)
        }
    }
}

/// Reads just the message type of a body.
pub fn peek_type(body: &[u8]) -> PslResult<MessageType> {
    let (code, _) = decode_varint(body)?.ok_or(PslError::FormatError)?;
    MessageType::try_from(code)
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        use MessageType as T;
        match self {
            Self::Ping { .. } => T::Ping,
            Self::GetParam { .. } => T::GetParam,
            Self::GetParams { .. } => T::GetParams,
            Self::SetParam { .. } => T::SetParam,
            Self::SetParams { .. } => T::SetParams,
            Self::ListParamDetails { .. } => T::ListParamDetails,
            Self::StartOscilloscope { .. } => T::StartOscilloscope,
            Self::StartHistogram { .. } => T::StartHistogram,
            Self::StartFft { .. } => T::StartFft,
            Self::StartListMode { .. } => T::StartListMode,
            Self::StartCalibration { .. } => T::StartCalibration,
            Self::Stop { .. } => T::Stop,
            Self::GetCalibration { .. } => T::GetCalibration,
            Self::SetCalibration { .. } => T::SetCalibration,
            Self::CalculateDcOffset { .. } => T::CalculateDcOffset,
            Self::SaveConfiguration => T::SaveConfiguration,
            Self::DeleteSavedConfiguration => T::DeleteSavedConfiguration,
            Self::SoftwareUpdate { .. } => T::SoftwareUpdate,
            Self::MonitorChannels { .. } => T::MonitorChannels,
            Self::CheckParamConsistency { .. } => T::CheckParamConsistency,
            Self::Restart => T::Restart,
            Self::ResetSpatialSystem => T::ResetSpatialSystem,
            Self::ProbeDatagram => T::ProbeDatagram,
            Self::SynchronizeLog { .. } => T::SynchronizeLog,
        }
    }

    /// The channel a request addresses; `None` for module-wide requests.
    pub fn channel(&self) -> Option<i32> {
        match self {
            Self::GetParam { channel, .. }
            | Self::GetParams { channel, .. }
            | Self::SetParam { channel, .. }
            | Self::SetParams { channel, .. }
            | Self::ListParamDetails { channel, .. }
            | Self::StartOscilloscope { channel }
            | Self::StartHistogram { channel }
            | Self::StartFft { channel }
            | Self::StartListMode { channel }
            | Self::StartCalibration { channel }
            | Self::Stop { channel }
            | Self::GetCalibration { channel }
            | Self::SetCalibration { channel, .. }
            | Self::CalculateDcOffset { channel }
            | Self::CheckParamConsistency { channel } => Some(*channel),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new(self.message_type());
        match self {
            Self::Ping { verbose } => enc.boolean(*verbose),
            Self::GetParam { channel, key } => {
                enc.int(i64::from(*channel));
                enc.string(key);
            }
            Self::GetParams { channel, keys } => {
                enc.int(i64::from(*channel));
                enc.strings(keys);
            }
            Self::SetParam { channel, param } => {
                enc.int(i64::from(*channel));
                enc.key_value(param);
            }
            Self::SetParams { channel, params } => {
                enc.int(i64::from(*channel));
                enc.key_values(params);
            }
            Self::ListParamDetails { channel, prefix } => {
                enc.int(i64::from(*channel));
                enc.string(prefix);
            }
            Self::StartOscilloscope { channel }
            | Self::StartHistogram { channel }
            | Self::StartFft { channel }
            | Self::StartListMode { channel }
            | Self::StartCalibration { channel }
            | Self::Stop { channel }
            | Self::GetCalibration { channel }
            | Self::CalculateDcOffset { channel }
            | Self::CheckParamConsistency { channel } => enc.int(i64::from(*channel)),
            Self::SetCalibration {
                channel,
                calibration,
            } => {
                enc.int(i64::from(*channel));
                enc.calibration(calibration);
            }
            Self::SoftwareUpdate {
                image,
                checksum,
                auto_restart,
            } => {
                enc.bytes(image);
                enc.string(checksum);
                enc.boolean(*auto_restart);
            }
            Self::MonitorChannels { channels } => enc.ints(channels),
            Self::SynchronizeLog { log_id } => enc.varint(*log_id),
            Self::SaveConfiguration
            | Self::DeleteSavedConfiguration
            | Self::Restart
            | Self::ResetSpatialSystem
            | Self::ProbeDatagram => {}
        }
        enc.finish()
    }

    pub fn decode(body: &[u8]) -> PslResult<Self> {
        let mut dec = Decoder::new(body);
        let ty = MessageType::try_from(dec.varint()?)?;
        use MessageType as T;
        let req = match ty {
            T::Ping => Self::Ping {
                verbose: dec.boolean()?,
            },
            T::GetParam => Self::GetParam {
                channel: dec.int32()?,
                key: dec.string()?,
            },
            T::GetParams => Self::GetParams {
                channel: dec.int32()?,
                keys: dec.strings()?,
            },
            T::SetParam => Self::SetParam {
                channel: dec.int32()?,
                param: dec.key_value()?,
            },
            T::SetParams => Self::SetParams {
                channel: dec.int32()?,
                params: dec.key_values()?,
            },
            T::ListParamDetails => Self::ListParamDetails {
                channel: dec.int32()?,
                prefix: dec.string()?,
            },
            T::StartOscilloscope => Self::StartOscilloscope {
                channel: dec.int32()?,
            },
            T::StartHistogram => Self::StartHistogram {
                channel: dec.int32()?,
            },
            T::StartFft => Self::StartFft {
                channel: dec.int32()?,
            },
            T::StartListMode => Self::StartListMode {
                channel: dec.int32()?,
            },
            T::StartCalibration => Self::StartCalibration {
                channel: dec.int32()?,
            },
            T::Stop => Self::Stop {
                channel: dec.int32()?,
            },
            T::GetCalibration => Self::GetCalibration {
                channel: dec.int32()?,
            },
            T::SetCalibration => Self::SetCalibration {
                channel: dec.int32()?,
                calibration: dec.calibration()?,
            },
            T::CalculateDcOffset => Self::CalculateDcOffset {
                channel: dec.int32()?,
            },
            T::SaveConfiguration => Self::SaveConfiguration,
            T::DeleteSavedConfiguration => Self::DeleteSavedConfiguration,
            T::SoftwareUpdate => Self::SoftwareUpdate {
                image: dec.bytes()?,
                checksum: dec.string()?,
                auto_restart: dec.boolean()?,
            },
            T::MonitorChannels => Self::MonitorChannels {
                channels: dec.ints()?,
            },
            T::CheckParamConsistency => Self::CheckParamConsistency {
                channel: dec.int32()?,
            },
            T::Restart => Self::Restart,
            T::ResetSpatialSystem => Self::ResetSpatialSystem,
            T::ProbeDatagram => Self::ProbeDatagram,
            T::SynchronizeLog => Self::SynchronizeLog {
                log_id: dec.varint()?,
            },
            _ => return Err(PslError::InvalidRequest),
        };
        dec.finish(req)
    }
}

impl Response {
    pub fn message_type(&self) -> MessageType {
        use MessageType as T;
        match self {
            Self::Success { .. } => T::Success,
            Self::GetParamResponse { .. } => T::GetParamResponse,
            Self::GetCalibrationResponse { .. } => T::GetCalibrationResponse,
            Self::CalculateDcOffsetResponse { .. } => T::CalculateDcOffsetResponse,
            Self::ListParamDetailsResponse { .. } => T::ListParamDetailsResponse,
            Self::CalibrationProgress { .. } => T::CalibrationProgress,
            Self::ParamUpdated { .. } => T::ParamUpdated,
            Self::OscilloscopeData { .. } => T::OscilloscopeData,
            Self::HistogramData(_) => T::HistogramData,
            Self::HistogramDatagram(_) => T::HistogramDatagram,
            Self::ListModeData { .. } => T::ListModeData,
            Self::CheckParamConsistencyResponse { .. } => T::CheckParamConsistencyResponse,
            Self::SoftwareUpdateComplete { .. } => T::SoftwareUpdateComplete,
            Self::AsynchronousError { .. } => T::AsynchronousError,
        }
    }

    /// Channel the message applies to; `None` for module-wide messages.
    pub fn channel(&self) -> Option<i32> {
        match self {
            Self::Success { channel, .. }
            | Self::GetParamResponse { channel, .. }
            | Self::GetCalibrationResponse { channel, .. }
            | Self::CalculateDcOffsetResponse { channel, .. }
            | Self::ListParamDetailsResponse { channel, .. }
            | Self::CalibrationProgress { channel, .. }
            | Self::ParamUpdated { channel, .. }
            | Self::OscilloscopeData { channel, .. }
            | Self::ListModeData { channel, .. }
            | Self::CheckParamConsistencyResponse { channel, .. }
            | Self::AsynchronousError { channel, .. } => Some(*channel),
            Self::HistogramData(h) | Self::HistogramDatagram(h) => Some(h.channel),
            Self::SoftwareUpdateComplete { .. } => None,
        }
    }

    /// The card-reported failure carried by this response, if any.
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Success { error, .. }
            | Self::GetParamResponse { error, .. }
            | Self::GetCalibrationResponse { error, .. }
            | Self::CalculateDcOffsetResponse { error, .. }
            | Self::ListParamDetailsResponse { error, .. }
            | Self::CalibrationProgress { error, .. }
            | Self::CheckParamConsistencyResponse { error, .. }
            | Self::SoftwareUpdateComplete { error } => error.as_ref(),
            Self::AsynchronousError { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new(self.message_type());
        match self {
            Self::Success { channel, error } => {
                enc.int(i64::from(*channel));
                enc.error(error);
            }
            Self::GetParamResponse {
                channel,
                results,
                error,
            } => {
                enc.int(i64::from(*channel));
                enc.key_values(results);
                enc.error(error);
            }
            Self::GetCalibrationResponse {
                channel,
                calibration,
                error,
            } => {
                enc.int(i64::from(*channel));
                enc.calibration(calibration);
                enc.error(error);
            }
            Self::CalculateDcOffsetResponse {
                channel,
                offset,
                error,
            } => {
                enc.int(i64::from(*channel));
                enc.float(*offset);
                enc.error(error);
            }
            Self::ListParamDetailsResponse {
                channel,
                details,
                error,
            } => {
                enc.int(i64::from(*channel));
                enc.varint(details.len() as u64);
                for d in details {
                    enc.key_value(&d.param);
                    enc.boolean(d.read_only);
                    enc.opt_float(d.min);
                    enc.opt_float(d.max);
                    enc.strings(&d.options);
                }
                enc.error(error);
            }
            Self::CalibrationProgress {
                channel,
                progress,
                complete,
                stage,
                error,
            } => {
                enc.int(i64::from(*channel));
                enc.float(*progress);
                enc.boolean(*complete);
                enc.string(stage);
                enc.error(error);
            }
            Self::ParamUpdated { channel, params } => {
                enc.int(i64::from(*channel));
                enc.key_values(params);
            }
            Self::OscilloscopeData { channel, samples } => {
                enc.int(i64::from(*channel));
                enc.ints(samples);
            }
            Self::HistogramData(h) | Self::HistogramDatagram(h) => enc.histogram(h),
            Self::ListModeData { channel, data } => {
                enc.int(i64::from(*channel));
                enc.bytes(data);
            }
            Self::CheckParamConsistencyResponse {
                channel,
                consistent,
                message,
                error,
            } => {
                enc.int(i64::from(*channel));
                enc.boolean(*consistent);
                enc.string(message);
                enc.error(error);
            }
            Self::SoftwareUpdateComplete { error } => enc.error(error),
            Self::AsynchronousError { channel, error } => {
                enc.int(i64::from(*channel));
                enc.error(&Some(error.clone()));
            }
        }
        enc.finish()
    }

    pub fn decode(body: &[u8]) -> PslResult<Self> {
        let mut dec = Decoder::new(body);
        let ty = MessageType::try_from(dec.varint()?)?;
        use MessageType as T;
        let resp = match ty {
            T::Success => Self::Success {
                channel: dec.int32()?,
                error: dec.error()?,
            },
            T::GetParamResponse => Self::GetParamResponse {
                channel: dec.int32()?,
                results: dec.key_values()?,
                error: dec.error()?,
            },
            T::GetCalibrationResponse => Self::GetCalibrationResponse {
                channel: dec.int32()?,
                calibration: dec.calibration()?,
                error: dec.error()?,
            },
            T::CalculateDcOffsetResponse => Self::CalculateDcOffsetResponse {
                channel: dec.int32()?,
                offset: dec.float()?,
                error: dec.error()?,
            },
            T::ListParamDetailsResponse => {
                let channel = dec.int32()?;
                let n = dec.count()?;
                let mut details = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    details.push(ParamDetails {
                        param: dec.key_value()?,
                        read_only: dec.boolean()?,
                        min: dec.opt_float()?,
                        max: dec.opt_float()?,
                        options: dec.strings()?,
                    });
                }
                Self::ListParamDetailsResponse {
                    channel,
                    details,
                    error: dec.error()?,
                }
            }
            T::CalibrationProgress => Self::CalibrationProgress {
                channel: dec.int32()?,
                progress: dec.float()?,
                complete: dec.boolean()?,
                stage: dec.string()?,
                error: dec.error()?,
            },
            T::ParamUpdated => Self::ParamUpdated {
                channel: dec.int32()?,
                params: dec.key_values()?,
            },
            T::OscilloscopeData => Self::OscilloscopeData {
                channel: dec.int32()?,
                samples: dec.ints()?,
            },
            T::HistogramData => Self::HistogramData(dec.histogram()?),
            T::HistogramDatagram => Self::HistogramDatagram(dec.histogram()?),
            T::ListModeData => Self::ListModeData {
                channel: dec.int32()?,
                data: dec.bytes()?,
            },
            T::CheckParamConsistencyResponse => Self::CheckParamConsistencyResponse {
                channel: dec.int32()?,
                consistent: dec.boolean()?,
                message: dec.string()?,
                error: dec.error()?,
            },
            T::SoftwareUpdateComplete => Self::SoftwareUpdateComplete {
                error: dec.error()?,
            },
            T::AsynchronousError => {
                let channel = dec.int32()?;
                let error = dec.error()?.ok_or(PslError::FormatError)?;
                Self::AsynchronousError { channel, error }
            }
            _ => return Err(PslError::FormatError),
        };
        dec.finish(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_params_body_survives_the_wire() {
        let req = Request::SetParams {
            channel: ALL_CHANNELS,
            params: vec![
                KeyValue::new("afe.analogGain", ParamValue::Float(4.0)),
                KeyValue::new("pulse.detectionThreshold", ParamValue::Int(-12)),
                KeyValue::new("gate.enabled", ParamValue::Bool(true)),
                KeyValue::new("instrument.name", ParamValue::Str("fx".into())),
                KeyValue::new("histogram.mode", ParamValue::Opt("gated".into())),
            ],
        };
        let body = req.encode();
        assert_eq!(peek_type(&body).unwrap(), MessageType::SetParams);
        assert_eq!(Request::decode(&body).unwrap(), req);
    }

    #[test]
    fn histogram_push_keeps_stats() {
        let h = Histogram {
            channel: 2,
            data_set_id: 9,
            accepted: vec![0, 1, 70_000, u32::MAX],
            rejected: vec![3, 0, 0, 0],
            stats: HistogramStats {
                time_elapsed: 1.5,
                samples_detected: 1 << 40,
                pulses_accepted: 10,
                input_count_rate: 1234.5,
                dead_time: 0.25,
                pixel_complete: true,
                ..Default::default()
            },
        };
        let body = Response::HistogramDatagram(h.clone()).encode();
        assert_eq!(
            Response::decode(&body).unwrap(),
            Response::HistogramDatagram(h)
        );
    }

    #[test]
    fn async_error_requires_error_info() {
        let resp = Response::AsynchronousError {
            channel: 1,
            error: ErrorInfo::new(PslError::FpgaFailure, "fpga down"),
        };
        let decoded = Response::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.error().unwrap().to_error(), PslError::FpgaFailure);

        let bogus = Response::Success {
            channel: 1,
            error: None,
        }
        .encode();
        let mut bogus = bogus;
        bogus[0] = MessageType::AsynchronousError as u8;
        assert_eq!(Response::decode(&bogus), Err(PslError::FormatError));
    }

    #[test]
    fn truncated_and_trailing_bodies_are_rejected() {
        let body = Request::GetParam {
            channel: 0,
            key: "instrument.serialNumber".into(),
        }
        .encode();
        assert_eq!(
            Request::decode(&body[..body.len() - 3]),
            Err(PslError::FormatError)
        );
        let mut long = body.clone();
        long.push(0);
        assert_eq!(Request::decode(&long), Err(PslError::FormatError));
        assert_eq!(Request::decode(&[99]), Err(PslError::FormatError));
    }

    #[test]
    fn responses_are_not_requests() {
        let body = Response::Success {
            channel: 0,
            error: None,
        }
        .encode();
        assert_eq!(Request::decode(&body), Err(PslError::InvalidRequest));
    }

    #[test]
    fn param_value_views() {
        assert_eq!(ParamValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(ParamValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(ParamValue::Opt("2048".into()).as_f64(), Some(2048.0));
        assert_eq!(ParamValue::Str("x".into()).as_f64(), None);
        assert_eq!(
            ParamValue::from_f64(ParamType::Int, 2.6),
            ParamValue::Int(3)
        );
        assert_eq!(ParamValue::Float(4.0).as_i64(), Some(4));
        assert_eq!(ParamValue::Float(4.5).as_i64(), None);
    }

    #[test]
    fn calibration_response_carries_plots() {
        let resp = Response::GetCalibrationResponse {
            channel: 0,
            calibration: CalibrationInfo {
                data: "opaque==".into(),
                example: CalibrationPlot {
                    x: vec![0.0, 1.0],
                    y: vec![2.0, 3.0],
                },
                model: CalibrationPlot::default(),
                final_: CalibrationPlot {
                    x: vec![5.0],
                    y: vec![6.0],
                },
            },
            error: None,
        };
        assert_eq!(Response::decode(&resp.encode()).unwrap(), resp);
    }
}
