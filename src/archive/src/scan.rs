use std::io::ErrorKind;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use hrdp_common::error::DecodeError;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard ceiling on one record; a larger size prefix means the stream is
/// not an RT file.
pub const MAX_RECORD_SIZE: usize = 32 << 20;

/// FrameScanner extracts one length-prefixed record at a time from a
/// byte source. Emitted frames include the 4-byte little-endian size
/// prefix and share the scanner's buffer, so they stay cheap to clone
/// and to hand across task boundaries.
pub struct FrameScanner<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameScanner<R> {
    pub fn new(reader: R) -> FrameScanner<R> {
        FrameScanner { reader, buffer: BytesMut::with_capacity(1 << 20) }
    }

    /// reset rebinds the scanner to a new source, keeping its buffer.
    pub fn reset(&mut self, reader: R) {
        self.reader = reader;
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// next_frame returns the next full record, or None on a clean end
    /// of stream. A source that ends before the 4-byte prefix is a clean
    /// end; one that ends inside the record body is a short buffer, which
    /// walking layers treat as a silent end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let mut prefix = [0u8; 4];
        match self.reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let size = u32::from_le_bytes(prefix) as usize;
        if size > MAX_RECORD_SIZE {
            return Err(DecodeError::TooBig(size));
        }

        self.buffer.clear();
        self.buffer.reserve(size + 4);
        self.buffer.extend_from_slice(&prefix);
        self.buffer.resize(size + 4, 0);
        match self.reader.read_exact(&mut self.buffer[4..]).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(DecodeError::ShortBuffer),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(self.buffer.split().freeze()))
    }
}

/// scan_file opens a file and binds a scanner to it.
pub async fn scan_file<P: AsRef<Path>>(path: P) -> Result<FrameScanner<File>, DecodeError> {
    let file = File::open(path).await?;
    Ok(FrameScanner::new(file))
}
