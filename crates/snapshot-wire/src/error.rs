use thiserror::Error;

/// Per-frame decode failure. None of these are fatal to a stream; callers drop
/// the frame and keep the last good snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("snapshot payload truncated")]
    Truncated,
    #[error("invalid snapshot magic: {0:#06x}")]
    InvalidMagic(u16),
    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u8),
    #[error("invalid snapshot dimensions: {cols}x{rows}")]
    InvalidDimensions { cols: u32, rows: u32 },
    #[error("malformed snapshot document: {0}")]
    Malformed(String),
}
