use thiserror::Error;

/// Errors surfaced by the timekeeping core.
///
/// Data errors never abort the process: callers count them and carry on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// No edges on a reference input within its timeout.
    #[error("signal lost on {0}")]
    SignalLost(&'static str),
    /// PPS period outside 1 s ± 100 µs.
    #[error("PPS edge out of window (period {period_us} µs)")]
    OutOfWindowEdge { period_us: u64 },
    /// Allocation or socket send failure on a time response.
    #[error("transmit failed: {0}")]
    TransientTransmitFailure(String),
    /// Operator command refused; core state is unchanged.
    #[error("operator input refused: {0}")]
    OperatorInputInvalid(String),
}

/// NMEA 0183 ingest failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NmeaError {
    #[error("sentence framing invalid")]
    Framing,
    #[error("checksum mismatch: computed {computed:02X}, sentence says {declared:02X}")]
    Checksum { computed: u8, declared: u8 },
    #[error("field {index} of {sentence} invalid")]
    Field { sentence: &'static str, index: usize },
    #[error("unsupported sentence {0}")]
    Unsupported(String),
    #[error("sentence exceeds {0} bytes")]
    BufferOverflow(usize),
}
