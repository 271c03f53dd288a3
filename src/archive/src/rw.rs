use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use hrdp_common::error::DecodeError;
use md5::{Digest, Md5};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

use crate::packet::Decoder;
use crate::reader::{IndexEntry, RtReader};
use crate::scan::FrameScanner;

/// SortFn reorders an index before a cursor serves it.
pub type SortFn = fn(&mut [IndexEntry]);

/// sort_index is the default order: ascending timestamp, sequence as the
/// tie-breaker. Stable, so equal keys keep their file order.
pub fn sort_index(ix: &mut [IndexEntry]) {
    ix.sort_by(|a, b| (a.timestamp, a.sequence).cmp(&(b.timestamp, b.sequence)));
}

/// sort_tm_index orders telemetry: timestamp, then sequence.
pub fn sort_tm_index(ix: &mut [IndexEntry]) {
    ix.sort_by(|a, b| (a.timestamp, a.sequence).cmp(&(b.timestamp, b.sequence)));
}

/// sort_hrd_index orders high-rate records: on equal timestamps, size
/// decides across different ids, sequence within one id.
pub fn sort_hrd_index(ix: &mut [IndexEntry]) {
    ix.sort_by(|a, b| {
        if a.timestamp == b.timestamp {
            if a.id != b.id {
                return a.size.cmp(&b.size);
            }
            return a.sequence.cmp(&b.sequence);
        }
        a.timestamp.cmp(&b.timestamp)
    });
}

async fn read_at<R>(reader: &mut R, entry: &IndexEntry, buf: &mut [u8]) -> anyhow::Result<usize>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    if buf.len() < entry.size {
        return Err(DecodeError::ShortBuffer.into());
    }
    reader.seek(SeekFrom::Start(entry.offset)).await?;
    reader.read_exact(&mut buf[..entry.size]).await?;
    Ok(entry.size)
}

/// RecordCursor serves the records of one seekable source in index
/// order, one record per read call.
pub struct RecordCursor<R> {
    reader: R,
    index: Vec<IndexEntry>,
    pos: usize,
}

impl<R> RecordCursor<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    /// read_record copies the next record into buf and returns its size,
    /// or None once the index is drained. A buffer smaller than the
    /// record is a short-buffer error and does not advance the cursor.
    pub async fn read_record(&mut self, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        let entry = match self.index.get(self.pos) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        let n = read_at(&mut self.reader, &entry, buf).await?;
        self.pos += 1;
        Ok(Some(n))
    }

    /// copy_to drains the cursor into a writer and returns the bytes
    /// moved.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> anyhow::Result<u64> {
        let mut buf = vec![0u8; 1 << 20];
        let mut total = 0u64;
        loop {
            if let Some(entry) = self.index.get(self.pos) {
                if buf.len() < entry.size {
                    buf.resize(entry.size, 0);
                }
            }
            match self.read_record(&mut buf).await? {
                Some(n) => {
                    w.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                None => return Ok(total),
            }
        }
    }
}

/// sort indexes the source and serves its records in default time order.
pub async fn sort<R>(reader: R, decoder: Decoder) -> anyhow::Result<RecordCursor<R>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    sort_with(reader, decoder, None).await
}

/// sort_with is sort with a caller-provided index order.
pub async fn sort_with<R>(
    reader: R,
    decoder: Decoder,
    f: Option<SortFn>,
) -> anyhow::Result<RecordCursor<R>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let mut reader = reader;
    let mut index = {
        let mut rt = RtReader::new(&mut reader, decoder);
        rt.index().await?
    };
    f.unwrap_or(sort_index)(&mut index);
    Ok(RecordCursor { reader, index, pos: 0 })
}

/// shuffle serves the records of the source in a uniformly random
/// permutation, seeded from the OS.
pub async fn shuffle<R>(reader: R, decoder: Decoder) -> anyhow::Result<RecordCursor<R>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    shuffle_with(reader, decoder, StdRng::from_entropy()).await
}

/// shuffle_with is shuffle with an injected generator, for deterministic
/// tests.
pub async fn shuffle_with<R>(
    reader: R,
    decoder: Decoder,
    mut rng: StdRng,
) -> anyhow::Result<RecordCursor<R>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let mut reader = reader;
    let mut index = {
        let mut rt = RtReader::new(&mut reader, decoder);
        rt.index().await?
    };
    for i in (1..index.len()).rev() {
        index.swap(i, rng.gen_range(0..=i));
    }
    Ok(RecordCursor { reader, index, pos: 0 })
}

/// Joiner serves the records of several sources as one stream; each read
/// goes back to the originating source through its digest.
pub struct Joiner<R> {
    sources: HashMap<u64, R>,
    index: Vec<IndexEntry>,
    pos: usize,
}

/// join indexes all sources in parallel and merges their indexes in
/// default time order.
pub async fn join<R>(decoder: Decoder, sources: Vec<R>) -> anyhow::Result<Joiner<R>>
where
    R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
{
    join_with(decoder, None, sources).await
}

pub async fn join_with<R>(
    decoder: Decoder,
    f: Option<SortFn>,
    sources: Vec<R>,
) -> anyhow::Result<Joiner<R>>
where
    R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for source in sources {
        let decoder = decoder.clone();
        tasks.spawn(async move {
            let mut source = source;
            let mut rt = RtReader::new(&mut source, decoder);
            let out = rt.index_sum().await;
            out.map(|(ix, sum)| (ix, sum, source))
        });
    }

    let mut index = Vec::new();
    let mut ms = HashMap::new();
    while let Some(res) = tasks.join_next().await {
        let (ix, sum, source) = res??;
        index.extend(ix);
        ms.insert(sum, source);
    }
    f.unwrap_or(sort_index)(&mut index);
    Ok(Joiner { sources: ms, index, pos: 0 })
}

impl<R> Joiner<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    pub async fn read_record(&mut self, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        let entry = match self.index.get(self.pos) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        let reader = self
            .sources
            .get_mut(&entry.digest)
            .ok_or_else(|| anyhow!("no source for digest {:#018x}", entry.digest))?;
        let n = read_at(reader, &entry, buf).await?;
        self.pos += 1;
        Ok(Some(n))
    }

    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> anyhow::Result<u64> {
        let mut buf = vec![0u8; 1 << 20];
        let mut total = 0u64;
        loop {
            if let Some(entry) = self.index.get(self.pos) {
                if buf.len() < entry.size {
                    buf.resize(entry.size, 0);
                }
            }
            match self.read_record(&mut buf).await? {
                Some(n) => {
                    w.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                None => return Ok(total),
            }
        }
    }
}

/// NoDuplicate drops records already written through it, keyed by their
/// MD5 digest. The set grows with input cardinality; repeats silently
/// succeed.
pub struct NoDuplicate<W> {
    sums: HashSet<[u8; 16]>,
    inner: W,
}

impl<W: AsyncWrite + Unpin> NoDuplicate<W> {
    pub fn new(inner: W) -> NoDuplicate<W> {
        NoDuplicate { sums: HashSet::new(), inner }
    }

    pub async fn write_record(&mut self, bs: &[u8]) -> anyhow::Result<usize> {
        let sum: [u8; 16] = Md5::digest(bs).into();
        if !self.sums.insert(sum) {
            return Ok(bs.len());
        }
        self.inner.write_all(bs).await?;
        Ok(bs.len())
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// SplitWriter fans records out to n sibling files `<base>.0001` to
/// `<base>.NNNN`, each record routed to a uniformly random sibling.
pub struct SplitWriter {
    writers: Vec<File>,
    rng: StdRng,
}

fn split_path(base: &Path, i: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{:04}", i + 1));
    PathBuf::from(name)
}

/// split_writer opens the n siblings up front; if any open fails, the
/// ones already created are closed and removed.
pub async fn split_writer(base: &Path, n: usize) -> anyhow::Result<SplitWriter> {
    split_writer_seeded(base, n, StdRng::from_entropy()).await
}

pub async fn split_writer_seeded(base: &Path, n: usize, rng: StdRng) -> anyhow::Result<SplitWriter> {
    if n < 2 {
        return Err(anyhow!("split needs at least 2 outputs, got {}", n));
    }
    if let Some(dir) = base.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir).await?;
        }
    }
    let mut writers = Vec::with_capacity(n);
    for i in 0..n {
        match File::create(split_path(base, i)).await {
            Ok(w) => writers.push(w),
            Err(e) => {
                drop(writers);
                for j in 0..i {
                    let _ = tokio::fs::remove_file(split_path(base, j)).await;
                }
                return Err(e.into());
            }
        }
    }
    Ok(SplitWriter { writers, rng })
}

impl SplitWriter {
    pub async fn write_record(&mut self, bs: &[u8]) -> anyhow::Result<usize> {
        let ix = self.rng.gen_range(0..self.writers.len());
        self.writers[ix].write_all(bs).await?;
        Ok(bs.len())
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        for w in self.writers.iter_mut() {
            w.flush().await?;
        }
        Ok(())
    }
}

/// MixReader interleaves several scanners at random; an exhausted
/// scanner is dropped, end of stream comes when none remain.
pub struct MixReader<R> {
    scanners: Vec<FrameScanner<R>>,
    rng: StdRng,
}

pub fn mix<R>(scanners: Vec<FrameScanner<R>>) -> MixReader<R> {
    mix_seeded(scanners, StdRng::from_entropy())
}

pub fn mix_seeded<R>(scanners: Vec<FrameScanner<R>>, rng: StdRng) -> MixReader<R> {
    MixReader { scanners, rng }
}

impl<R: AsyncRead + Unpin> MixReader<R> {
    pub async fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        loop {
            if self.scanners.is_empty() {
                return Ok(None);
            }
            let ix = self.rng.gen_range(0..self.scanners.len());
            match self.scanners[ix].next_frame().await {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) | Err(DecodeError::ShortBuffer) => {
                    self.scanners.remove(ix);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> anyhow::Result<u64> {
        let mut total = 0u64;
        while let Some(frame) = self.next_frame().await? {
            w.write_all(&frame).await?;
            total += frame.len() as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tm::tests::tm_frame;
    use std::io::Cursor;

    fn frames() -> (Vec<Vec<u8>>, Vec<u8>) {
        let records = vec![
            tm_frame(0x1A2, 3, 7, 102),
            tm_frame(0x1A2, 1, 7, 100),
            tm_frame(0x1A2, 2, 7, 101),
        ];
        let mut bs = Vec::new();
        for r in &records {
            bs.extend_from_slice(r);
        }
        (records, bs)
    }

    #[tokio::test]
    async fn test_sort_by_time() {
        let (_, data) = frames();
        let mut cur = sort(Cursor::new(data), Decoder::Tm).await.unwrap();
        let seqs: Vec<u32> = cur.index().iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let mut buf = vec![0u8; 256];
        let n = cur.read_record(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], &tm_frame(0x1A2, 1, 7, 100)[..]);
    }

    #[tokio::test]
    async fn test_read_record_short_buffer() {
        let (_, data) = frames();
        let mut cur = sort(Cursor::new(data), Decoder::Tm).await.unwrap();
        let mut buf = vec![0u8; 4];
        let err = cur.read_record(&mut buf).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::ShortBuffer)
        ));
        // the cursor did not advance
        let mut buf = vec![0u8; 256];
        assert!(cur.read_record(&mut buf).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sort_hrd_index_order() {
        use chrono::{TimeZone, Utc};
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = |id, seq, size| IndexEntry {
            id,
            offset: 0,
            size,
            sequence: seq,
            timestamp: t,
            digest: 0,
        };
        let mut ix = vec![entry(2, 5, 100), entry(1, 9, 50), entry(1, 2, 70)];
        sort_hrd_index(&mut ix);
        // different ids on equal time: smaller size first; same id: sequence
        assert_eq!(ix[0].size, 50);
        assert_eq!(ix[1].size, 70);
        assert_eq!(ix[2].id, 2);
    }

    #[tokio::test]
    async fn test_shuffle_preserves_records() {
        let (records, data) = frames();
        let mut cur = shuffle_with(Cursor::new(data), Decoder::Tm, StdRng::seed_from_u64(7))
            .await
            .unwrap();
        let mut out = Vec::new();
        let total = cur.copy_to(&mut out).await.unwrap();
        assert_eq!(total as usize, records.iter().map(|r| r.len()).sum::<usize>());
        // every record survives the permutation intact
        for r in &records {
            assert!(out.windows(r.len()).any(|w| w == &r[..]));
        }
    }

    #[tokio::test]
    async fn test_join_two_sources() {
        let a: Vec<u8> = [tm_frame(0x1A2, 1, 7, 100), tm_frame(0x1A2, 3, 7, 104)].concat();
        let b: Vec<u8> = [tm_frame(0x1A2, 2, 7, 102), tm_frame(0x1A2, 4, 7, 106)].concat();

        let mut j = join(Decoder::Tm, vec![Cursor::new(a), Cursor::new(b)])
            .await
            .unwrap();
        let seqs: Vec<u32> = j.index().iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        let mut out = Vec::new();
        j.copy_to(&mut out).await.unwrap();
        assert_eq!(&out[..26], &tm_frame(0x1A2, 1, 7, 100)[..26]);
    }

    #[tokio::test]
    async fn test_no_duplicate_idempotent() {
        let record = tm_frame(0x1A2, 1, 7, 100);
        let mut once = NoDuplicate::new(Vec::new());
        once.write_record(&record).await.unwrap();

        let mut twice = NoDuplicate::new(Vec::new());
        assert_eq!(twice.write_record(&record).await.unwrap(), record.len());
        assert_eq!(twice.write_record(&record).await.unwrap(), record.len());

        assert_eq!(once.get_ref(), twice.get_ref());
    }

    #[tokio::test]
    async fn test_split_writer_fairness() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out").join("split.dat");
        let mut sw = split_writer_seeded(&base, 4, StdRng::seed_from_u64(11))
            .await
            .unwrap();

        let record = tm_frame(0x1A2, 1, 7, 100);
        let mut total = 0usize;
        for _ in 0..200 {
            total += sw.write_record(&record).await.unwrap();
        }
        sw.close().await.unwrap();

        let mut written = 0usize;
        for i in 0..4 {
            let meta = tokio::fs::metadata(split_path(&base, i)).await.unwrap();
            assert!(meta.len() > 0, "sibling {} is empty", i);
            written += meta.len() as usize;
        }
        assert_eq!(written, total);
    }

    #[tokio::test]
    async fn test_split_writer_rejects_small_n() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("split.dat");
        assert!(split_writer(&base, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_mix_no_loss() {
        let a: Vec<u8> = [tm_frame(1, 1, 7, 100), tm_frame(1, 2, 7, 101)].concat();
        let b: Vec<u8> = [tm_frame(2, 1, 7, 100)].concat();

        let mut m = mix_seeded(
            vec![FrameScanner::new(&a[..]), FrameScanner::new(&b[..])],
            StdRng::seed_from_u64(3),
        );
        let mut out = Vec::new();
        let total = m.copy_to(&mut out).await.unwrap();
        assert_eq!(total as usize, a.len() + b.len());
        assert!(m.next_frame().await.unwrap().is_none());
    }
}
