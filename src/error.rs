use thiserror::Error;

/// Every failure the layer can report.
///
/// The discriminants are stable and are what `From<i32>` maps back from, so a
/// code that crossed an FFI or log boundary can be turned back into the enum.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
pub enum PslError {
    // transport
    #[error("connect failed")]
    ConnectFailed = 101,
    #[error("socket closed")]
    SocketClosed = 102,
    #[error("read failed")]
    ReadFailed = 103,
    #[error("write failed")]
    WriteFailed = 104,
    #[error("host unreachable")]
    HostUnreachable = 105,
    #[error("out of resources")]
    OutOfResources = 106,
    #[error("timeout")]
    Timeout = 107,

    // protocol
    #[error("bad parameters")]
    BadParameters = 201,
    #[error("command failed")]
    CommandFailed = 202,
    #[error("invalid request")]
    InvalidRequest = 203,
    #[error("another thread is already waiting")]
    MultipleThreadWait = 204,
    #[error("authorization failed")]
    AuthorizationFailed = 205,
    #[error("not connected")]
    NotConnected = 206,
    #[error("non-gated histogram disabled")]
    NonGatedHistogramDisabled = 207,

    // device
    #[error("device error")]
    DeviceError = 301,
    #[error("calibration not running")]
    CalibrationNotRunning = 302,
    #[error("histogram not running")]
    HistogramNotRunning = 303,
    #[error("list mode not running")]
    ListModeNotRunning = 304,
    #[error("stale calibration")]
    StaleCalibration = 305,
    #[error("no calibration data")]
    NoCalibrationData = 306,
    #[error("startup baseline failed")]
    StartupBaselineFailed = 307,
    #[error("histogram FPGA bad data")]
    HistogramFpgaBadData = 308,
    #[error("invalid FPGA version")]
    InvalidFpgaVersion = 309,
    #[error("FPGA failure")]
    FpgaFailure = 310,
    #[error("card has been reset")]
    CardHasBeenReset = 311,

    // validation
    #[error("unknown value")]
    UnknownValue = 401,
    #[error("value out of range for its type")]
    TypeValueOutOfRange = 402,
    #[error("bad type")]
    BadType = 403,
    #[error("read only")]
    ReadOnly = 404,
    #[error("already open")]
    AlreadyOpen = 405,
    #[error("not idle")]
    NotIdle = 406,
    #[error("format error")]
    FormatError = 407,
    #[error("internal buffer overrun")]
    InternalBufferOverrun = 408,
    #[error("invalid value")]
    InvalidValue = 409,
    #[error("bad channel")]
    BadChannel = 410,

    // resource
    #[error("out of memory")]
    OutOfMemory = 501,
    #[error("not found")]
    NotFound = 502,
    #[error("too big")]
    TooBig = 503,
    #[error("too many")]
    TooMany = 504,

    #[error("unknown error")]
    Unknown = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Device,
    Validation,
    Resource,
    Other,
}

impl From<i32> for PslError {
    fn from(value: i32) -> Self {
        match value {
            101 => Self::ConnectFailed,
            102 => Self::SocketClosed,
            103 => Self::ReadFailed,
            104 => Self::WriteFailed,
            105 => Self::HostUnreachable,
            106 => Self::OutOfResources,
            107 => Self::Timeout,
            201 => Self::BadParameters,
            202 => Self::CommandFailed,
            203 => Self::InvalidRequest,
            204 => Self::MultipleThreadWait,
            205 => Self::AuthorizationFailed,
            206 => Self::NotConnected,
            207 => Self::NonGatedHistogramDisabled,
            301 => Self::DeviceError,
            302 => Self::CalibrationNotRunning,
            303 => Self::HistogramNotRunning,
            304 => Self::ListModeNotRunning,
            305 => Self::StaleCalibration,
            306 => Self::NoCalibrationData,
            307 => Self::StartupBaselineFailed,
            308 => Self::HistogramFpgaBadData,
            309 => Self::InvalidFpgaVersion,
            310 => Self::FpgaFailure,
            311 => Self::CardHasBeenReset,
            401 => Self::UnknownValue,
            402 => Self::TypeValueOutOfRange,
            403 => Self::BadType,
            404 => Self::ReadOnly,
            405 => Self::AlreadyOpen,
            406 => Self::NotIdle,
            407 => Self::FormatError,
            408 => Self::InternalBufferOverrun,
            409 => Self::InvalidValue,
            410 => Self::BadChannel,
            501 => Self::OutOfMemory,
            502 => Self::NotFound,
            503 => Self::TooBig,
            504 => Self::TooMany,
            _ => Self::Unknown,
        }
    }
}

impl PslError {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn kind(self) -> ErrorKind {
        match self.code() / 100 {
            1 => ErrorKind::Transport,
            2 => ErrorKind::Protocol,
            3 => ErrorKind::Device,
            4 => ErrorKind::Validation,
            5 => ErrorKind::Resource,
            _ => ErrorKind::Other,
        }
    }

    /// Transport failures tear the whole module down; everything else is
    /// scoped to the request or channel that produced it.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::SocketClosed | Self::WriteFailed | Self::ReadFailed | Self::HostUnreachable
        )
    }

    /// Maps the error code carried in a card response.
    pub fn from_card_code(code: i32) -> Self {
        match code {
            1 => Self::BadParameters,
            2 => Self::CommandFailed,
            3 => Self::InvalidRequest,
            4 => Self::ReadFailed,
            5 => Self::WriteFailed,
            6 => Self::SocketClosed,
            7 => Self::Timeout,
            8 => Self::OutOfMemory,
            9 => Self::NotFound,
            10 => Self::TooBig,
            11 => Self::TooMany,
            12 => Self::MultipleThreadWait,
            13 => Self::AuthorizationFailed,
            14 => Self::NotConnected,
            15 => Self::DeviceError,
            16 => Self::CalibrationNotRunning,
            17 => Self::HistogramNotRunning,
            18 => Self::ListModeNotRunning,
            19 => Self::StaleCalibration,
            20 => Self::NoCalibrationData,
            21 => Self::StartupBaselineFailed,
            22 => Self::HistogramFpgaBadData,
            23 => Self::InvalidFpgaVersion,
            24 => Self::FpgaFailure,
            25 => Self::CardHasBeenReset,
            26 => Self::NonGatedHistogramDisabled,
            _ => Self::CommandFailed,
        }
    }

    /// Inverse of [`PslError::from_card_code`], used by the card side of the
    /// loopback transport in tests and by the codec round trip.
    pub fn card_code(self) -> i32 {
        match self {
            Self::BadParameters => 1,
            Self::CommandFailed => 2,
            Self::InvalidRequest => 3,
            Self::ReadFailed => 4,
            Self::WriteFailed => 5,
            Self::SocketClosed => 6,
            Self::Timeout => 7,
            Self::OutOfMemory => 8,
            Self::NotFound => 9,
            Self::TooBig => 10,
            Self::TooMany => 11,
            Self::MultipleThreadWait => 12,
            Self::AuthorizationFailed => 13,
            Self::NotConnected => 14,
            Self::DeviceError => 15,
            Self::CalibrationNotRunning => 16,
            Self::HistogramNotRunning => 17,
            Self::ListModeNotRunning => 18,
            Self::StaleCalibration => 19,
            Self::NoCalibrationData => 20,
            Self::StartupBaselineFailed => 21,
            Self::HistogramFpgaBadData => 22,
            Self::InvalidFpgaVersion => 23,
            Self::FpgaFailure => 24,
            Self::CardHasBeenReset => 25,
            Self::NonGatedHistogramDisabled => 26,
            _ => 2,
        }
    }
}

pub type PslResult<T> = Result<T, PslError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_i32() {
        for err in [
            PslError::ConnectFailed,
            PslError::NonGatedHistogramDisabled,
            PslError::CardHasBeenReset,
            PslError::BadChannel,
            PslError::TooMany,
        ] {
            assert_eq!(PslError::from(err.code()), err);
        }
        assert_eq!(PslError::from(-7), PslError::Unknown);
    }

    #[test]
    fn kinds_follow_code_ranges() {
        assert_eq!(PslError::Timeout.kind(), ErrorKind::Transport);
        assert_eq!(PslError::NotConnected.kind(), ErrorKind::Protocol);
        assert_eq!(PslError::StaleCalibration.kind(), ErrorKind::Device);
        assert_eq!(PslError::ReadOnly.kind(), ErrorKind::Validation);
        assert_eq!(PslError::NotFound.kind(), ErrorKind::Resource);
        assert!(PslError::SocketClosed.is_fatal());
        assert!(!PslError::Timeout.is_fatal());
    }

    #[test]
    fn card_codes_map_both_ways() {
        for code in 1..=26 {
            assert_eq!(PslError::from_card_code(code).card_code(), code);
        }
        assert_eq!(PslError::from_card_code(99), PslError::CommandFailed);
    }
}
