//! Error types for iSCSI target operations

use thiserror::Error;

/// Errors produced while decoding a PDU from the wire.
///
/// These are recoverable: the connection answers with a REJECT PDU carrying
/// the appropriate reason code and keeps running. Everything else (protocol
/// violations, negotiation failures, socket errors) is an [`IscsiError`] and
/// usually terminates the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("PDU too short: {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },

    #[error("header digest mismatch: computed 0x{computed:08x}, received 0x{received:08x}")]
    HeaderDigestMismatch {
        computed: u32,
        received: u32,
        /// The untrusted BHS, echoed back in the Reject PDU
        header: Box<[u8; 48]>,
    },

    #[error("data digest mismatch: computed 0x{computed:08x}, received 0x{received:08x}")]
    DataDigestMismatch {
        computed: u32,
        received: u32,
        /// The BHS of the offending PDU, echoed back in the Reject PDU
        header: Box<[u8; 48]>,
    },

    #[error("expected opcode 0x{expected:02x}, got 0x{actual:02x}")]
    UnexpectedOpcode { expected: u8, actual: u8 },

    #[error("data segment of {length} bytes exceeds negotiated limit of {limit}")]
    OversizedDataSegment {
        length: u32,
        limit: u32,
        /// The BHS of the offending PDU, echoed back in the Reject PDU
        header: Box<[u8; 48]>,
    },

    #[error("malformed text parameter: {0}")]
    MalformedText(String),
}

/// iSCSI target errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for target operations
pub type ScsiResult<T> = Result<T, IscsiError>;
