use thiserror::Error;

/// DecodeError is the taxonomy shared by the framing scanner and the
/// packet decoders. Only `TooBig` and `Io` are fatal for a stream; the
/// skip class (`ShortBuffer`, `Skip`, `UnsupportedKind`) reduces the
/// emitted set, and `Invalid` marks a record that is still usable.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("need more bytes")]
    ShortBuffer,

    #[error("skip")]
    Skip,

    #[error("unsupported kind: {0:#04x}")]
    UnsupportedKind(u8),

    #[error("invalid checksum: expected {expected:#010x}, computed {computed:#010x}")]
    Invalid { expected: u32, computed: u32 },

    #[error("record too big: {0} bytes")]
    TooBig(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// is_skip reports whether the error only drops the current record
    /// and lets the stream continue.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            DecodeError::ShortBuffer | DecodeError::Skip | DecodeError::UnsupportedKind(_)
        )
    }
}
