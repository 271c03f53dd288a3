use std::hash::Hasher;

use chrono::{DateTime, Utc};
use hrdp_common::error::DecodeError;
use hrdp_common::iterator::AsyncIterator;
use tokio::io::AsyncRead;
use twox_hash::XxHash64;

use crate::packet::{Decoder, Packet};
use crate::scan::FrameScanner;

/// IndexEntry locates one record inside a seekable source, along with
/// the fields the derived streams sort on. `digest` identifies the
/// source in multi-source joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: u64,
    pub offset: u64,
    pub size: usize,
    pub sequence: u32,
    pub timestamp: DateTime<Utc>,
    pub digest: u64,
}

/// RtReader couples a frame scanner with a packet decoder and keeps a
/// running 64-bit digest over every frame it reads.
pub struct RtReader<R> {
    scan: FrameScanner<R>,
    decoder: Decoder,
    digest: XxHash64,
}

impl<R: AsyncRead + Unpin> RtReader<R> {
    pub fn new(reader: R, decoder: Decoder) -> RtReader<R> {
        RtReader {
            scan: FrameScanner::new(reader),
            decoder,
            digest: XxHash64::with_seed(0),
        }
    }

    /// reset rebinds the reader to a new source and restarts the digest.
    pub fn reset(&mut self, reader: R) {
        self.scan.reset(reader);
        self.digest = XxHash64::with_seed(0);
    }

    /// digest returns the hash of everything read so far.
    pub fn digest(&self) -> u64 {
        self.digest.finish()
    }

    /// next returns the next decoded packet; decode failures for one
    /// record surface as errors the caller may skip. A truncated record
    /// at the tail of the source is a silent end of stream.
    pub async fn next(&mut self) -> Result<Option<Packet>, DecodeError> {
        let frame = match self.scan.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(DecodeError::ShortBuffer) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.digest.write(&frame);
        self.decoder.decode(frame).map(Some)
    }

    /// next_packet drops skip-class decode failures and only surfaces
    /// packets or fatal errors.
    pub async fn next_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        loop {
            match self.next().await {
                Ok(p) => return Ok(p),
                Err(e) if e.is_skip() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// index runs through the whole source and records one entry per
    /// decodable packet. Offsets and sizes are those of the raw frames,
    /// so entries stay valid for seek-back reads whatever the decoder.
    pub async fn index(&mut self) -> anyhow::Result<Vec<IndexEntry>> {
        let (ix, _) = self.index_sum().await?;
        Ok(ix)
    }

    /// index_sum is index plus the source digest, stamped on every entry.
    pub async fn index_sum(&mut self) -> anyhow::Result<(Vec<IndexEntry>, u64)> {
        let mut is = Vec::new();
        let mut curr = 0u64;
        loop {
            let frame = match self.scan.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(DecodeError::ShortBuffer) => break,
                Err(e) => return Err(e.into()),
            };
            self.digest.write(&frame);
            let size = frame.len();
            match self.decoder.decode(frame) {
                Ok(p) => {
                    let (id, _) = p.id();
                    is.push(IndexEntry {
                        id,
                        offset: curr,
                        size,
                        sequence: p.sequence(),
                        timestamp: p.timestamp(),
                        digest: 0,
                    });
                }
                Err(e) if e.is_skip() => {}
                Err(e) => return Err(e.into()),
            }
            curr += size as u64;
        }
        let sum = self.digest();
        for i in is.iter_mut() {
            i.digest = sum;
        }
        Ok((is, sum))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> AsyncIterator for RtReader<R> {
    type Item = Packet;

    async fn try_next(&mut self) -> anyhow::Result<Option<Packet>> {
        self.next_packet().await
    }
}
