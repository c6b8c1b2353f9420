//! Error type shared by all UHS-II protocol operations.

/// Errors reported by the UHS-II host engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uhs2Error {
    /// No UHS-II interface detected (IF_DETECT or LANE_SYNC never asserted)
    LinkNotFound,
    /// A bounded wait expired
    Timeout,
    /// Link-layer protocol violation (bad echo, header error, framing error)
    SequenceError,
    /// Data transfer deadlock timer expired
    DeadlockTimeout,
    /// DMA descriptor engine error
    AdmaError,
    /// Device rejected or failed an operation
    Io,
    /// Card removed while an operation was in flight
    NoCard,
    /// Capability registers failed validation
    MalformedCaps,
    /// Device or host lacks a required feature
    NotSupported,
    /// Caller passed an out-of-range value
    InvalidParameter,
    /// Software reset never self-cleared
    ResetFailed,
}

pub type Result<T> = core::result::Result<T, Uhs2Error>;
