/// Errors raised while decoding or transporting Pylontech CAN frames.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A field reaches past the end of the frame payload.
    #[error("field at offset {offset} with width {width} exceeds payload length {len}")]
    Truncated {
        offset: usize,
        width: usize,
        len: usize,
    },
    /// Only 1 to 4 byte wide integers exist in the protocol.
    #[error("unsupported field width {0}")]
    UnsupportedWidth(usize),
    /// A value does not fit into the requested field when encoding.
    #[error("Value out of range")]
    OutOfRange,
    /// Text fields carry plain ASCII only.
    #[error("non-ASCII byte at position {position}")]
    NotAscii { position: usize },
    /// A classic CAN frame carries at most 8 data bytes.
    #[error("payload length {0} exceeds 8 bytes")]
    PayloadLength(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for the decoder.
pub type Result<T> = std::result::Result<T, Error>;
