use thiserror::Error;

/// Errors while encoding or decoding a single frame.
///
/// `Truncated` is special: it reports that the buffer ends before the frame does, which
///  is the signal for the frame reader to fetch more bytes rather than a wire violation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown head byte {0:#04x}")]
    UnknownHeadByte(u8),

    #[error("varint exceeds the value range of its field")]
    VarintTooBig,

    #[error("data payload of {declared} bytes exceeds the configured maximum of {max}")]
    DataTooBig { declared: u64, max: u32 },

    #[error("frame is incomplete")]
    Truncated,
}

impl From<bytes_varint::VarIntError> for CodecError {
    fn from(e: bytes_varint::VarIntError) -> Self {
        match e {
            bytes_varint::VarIntError::NumericOverflow => CodecError::VarintTooBig,
            bytes_varint::VarIntError::BufferUnderflow => CodecError::Truncated,
        }
    }
}

/// Errors local to one underlying stream. They end that stream's life but not the
///  session's: unacknowledged packets are redistributed across surviving connections.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream closed by peer")]
    Closed,

    #[error("reading timed out")]
    ReadTimeout,

    #[error("stream writer is closed")]
    WriterClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Violations of the per-connection protocol. The offending stream is torn down, the
///  session continues on its other connections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("received a second finish for connection {connection_id}")]
    AlreadyReceivedFinish { connection_id: u32 },

    #[error("payload decryption failed")]
    DecryptFailed,
}

/// Violations that cannot be attributed to a single connection. They interrupt the
///  whole session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionViolation {
    #[error("connection id {connection_id} regresses behind {last_connection_id}")]
    ConnectionIdRegression {
        connection_id: u32,
        last_connection_id: u32,
    },

    #[error("connection id space is exhausted")]
    ConnectionIdOverflow,

    #[error("session would track more than {max} connections")]
    TooManyConnections { max: usize },

    #[error("more than {max} packets buffered while no connection is attached")]
    OfflineBufferOverflow { max: usize },
}

#[derive(Debug, Error)]
pub enum BcpError {
    #[error("session is already shut down")]
    SessionClosed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionViolation),
}
