//! Error and warning types.
//!
//! Recoverable bus events and fatal device events are deliberately kept as
//! two separate enums rather than one: a [`Warning`] is logged and the state
//! machine compensates on its own; an [`ErrorKind`] ends a cycle (or the
//! whole driver) and must be surfaced to the caller.

/// A recoverable bus event. Logged via [`log::warn!`] and never returned to
/// the caller; the handler retries or otherwise compensates on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Warning {
    /// A byte read back after a write did not match the byte written.
    #[error("written/read byte difference")]
    ByteDiff,
    /// Arbitration was lost outright (no priority-class tie).
    #[error("arbitration lost")]
    ArbitrationLost,
    /// Arbitration tied on priority class; a retry is in progress.
    #[error("priority class fit -> retry")]
    PriorityClassFitRetry,
    /// Received a NAK where an ACK/NAK was expected; one retry remains.
    #[error("received acknowledge byte is negative -> retry")]
    AckNegativeRetry,
    /// The received response telegram was invalid; one retry remains.
    #[error("received response is invalid -> retry")]
    ResponseInvalidRetry,
    /// A telegram addressed to us failed validation outright.
    #[error("message addressed to us is invalid")]
    MessageInvalid,
}

/// A terminal, per-cycle or driver-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// User-supplied master bytes failed the telegram classifier.
    #[error("the passed sequence contains an error")]
    Sequence,
    /// Our own address is not a valid master address; cannot transmit.
    #[error("active sending is only possible as a valid master address")]
    Master,
    /// A cycle failed on the wire (NAK/NAK, wrong echo, wrong ACK, NN out of range).
    #[error("an ebus error occurred while sending this sequence")]
    Transmit,
    /// The underlying device failed.
    #[error("device I/O failure: {0}")]
    Device(String),
    /// The driver is not open.
    #[error("driver is not open")]
    Offline,
}

impl ErrorKind {
    /// Builds a [`ErrorKind::Device`] from any displayable device failure,
    /// without requiring the device error type to implement
    /// [`std::error::Error`] (embedded device errors often don't).
    pub fn device<E: core::fmt::Display>(err: E) -> Self {
        ErrorKind::Device(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_messages_are_stable() {
        assert_eq!(Warning::ByteDiff.to_string(), "written/read byte difference");
        assert_eq!(Warning::ArbitrationLost.to_string(), "arbitration lost");
    }

    #[test]
    fn error_kind_messages_are_stable() {
        assert_eq!(ErrorKind::Offline.to_string(), "driver is not open");
        assert_eq!(
            ErrorKind::Master.to_string(),
            "active sending is only possible as a valid master address"
        );
    }

    #[test]
    fn device_error_carries_message() {
        let err = ErrorKind::device("broken pipe");
        assert_eq!(err.to_string(), "device I/O failure: broken pipe");
    }
}
