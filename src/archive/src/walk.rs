use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hrdp_common::error::DecodeError;
use hrdp_common::iterator::AsyncIterator;
use hrdp_common::time::{truncate, DAY};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::packet::{Coze, Decoder, Gap, Info, Packet};
use crate::reader::RtReader;

/// PacketStream is the consuming end of a walk pipeline. Dropping it
/// cancels the producing task: its next send fails and it unwinds,
/// releasing whatever file it was reading.
pub struct PacketStream {
    rx: mpsc::Receiver<Packet>,
}

#[async_trait]
impl AsyncIterator for PacketStream {
    type Item = Packet;

    async fn try_next(&mut self) -> anyhow::Result<Option<Packet>> {
        Ok(self.rx.recv().await)
    }
}

/// walk emits every decodable packet under the given paths, in
/// lexicographic path order and file order within each file. Skip-class
/// decode failures are dropped silently; a filesystem error ends the
/// stream.
pub fn walk(paths: Vec<PathBuf>, decoder: Decoder) -> PacketStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut paths = paths;
        paths.sort();
        for p in paths {
            if let Err(e) = walk_path(&p, &decoder, &tx).await {
                if e.downcast_ref::<Closed>().is_none() {
                    warn!("walk {}: {}", p.display(), e);
                }
                return;
            }
        }
    });
    PacketStream { rx }
}

/// Closed marks the normal cancellation path: the consumer dropped its
/// end of the stream.
#[derive(Debug)]
struct Closed;

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("packet stream closed")
    }
}

impl std::error::Error for Closed {}

async fn walk_path(
    path: &Path,
    decoder: &Decoder,
    tx: &mpsc::Sender<Packet>,
) -> anyhow::Result<()> {
    let mut stack = vec![path.to_path_buf()];
    while let Some(p) = stack.pop() {
        let meta = tokio::fs::metadata(&p).await?;
        if meta.is_dir() {
            let mut entries = Vec::new();
            let mut rd = tokio::fs::read_dir(&p).await?;
            while let Some(e) = rd.next_entry().await? {
                entries.push(e.path());
            }
            entries.sort();
            // depth-first, lexicographic: push in reverse so the
            // smallest name pops first
            for e in entries.into_iter().rev() {
                stack.push(e);
            }
        } else if meta.is_file() {
            walk_file(&p, decoder, tx).await?;
        }
    }
    Ok(())
}

async fn walk_file(
    path: &Path,
    decoder: &Decoder,
    tx: &mpsc::Sender<Packet>,
) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut rt = RtReader::new(file, decoder.clone());
    loop {
        match rt.next().await {
            Ok(Some(p)) => {
                if tx.send(p).await.is_err() {
                    return Err(anyhow::Error::new(Closed));
                }
            }
            Ok(None) => return Ok(()),
            Err(e) if e.is_skip() => continue,
            Err(DecodeError::Io(e)) => return Err(e.into()),
            Err(e) => {
                // a broken record ends this file, not the whole walk
                warn!("{}: {}", path.display(), e);
                return Ok(());
            }
        }
    }
}

/// ErrFilter drops errored packets unless `with_invalid` is set; the
/// flag includes them, it never excludes valid ones.
pub struct ErrFilter<S> {
    inner: S,
    with_invalid: bool,
}

pub fn filter_errors<S>(inner: S, with_invalid: bool) -> ErrFilter<S>
where
    S: AsyncIterator<Item = Packet> + Send,
{
    ErrFilter { inner, with_invalid }
}

#[async_trait]
impl<S> AsyncIterator for ErrFilter<S>
where
    S: AsyncIterator<Item = Packet> + Send,
{
    type Item = Packet;

    async fn try_next(&mut self) -> anyhow::Result<Option<Packet>> {
        loop {
            match self.inner.try_next().await? {
                Some(p) if !self.with_invalid && p.is_error() => continue,
                other => return Ok(other),
            }
        }
    }
}

pub struct InfoStream {
    rx: mpsc::Receiver<Info>,
}

#[async_trait]
impl AsyncIterator for InfoStream {
    type Item = Info;

    async fn try_next(&mut self) -> anyhow::Result<Option<Info>> {
        Ok(self.rx.recv().await)
    }
}

/// infos walks the paths and emits the portable summary of every packet.
pub fn infos(paths: Vec<PathBuf>, decoder: Decoder) -> InfoStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut w = walk(paths, decoder);
        while let Ok(Some(p)) = w.try_next().await {
            if tx.send(p.info()).await.is_err() {
                return;
            }
        }
    });
    InfoStream { rx }
}

/// KeyGap is a gap tagged with the stringified identity it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGap {
    pub key: String,
    #[serde(flatten)]
    pub gap: Gap,
}

pub struct GapStream {
    rx: mpsc::Receiver<KeyGap>,
}

#[async_trait]
impl AsyncIterator for GapStream {
    type Item = KeyGap;

    async fn try_next(&mut self) -> anyhow::Result<Option<KeyGap>> {
        Ok(self.rx.recv().await)
    }
}

/// gaps drives the per-identity continuity tracking over a walk and
/// yields every detected gap.
pub fn gaps(paths: Vec<PathBuf>, decoder: Decoder) -> GapStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut w = walk(paths, decoder);
        let mut gs: HashMap<String, Packet> = HashMap::new();
        while let Ok(Some(p)) = w.try_next().await {
            let key = packet_key(&p);
            if let Some(prev) = gs.get(&key) {
                if let Some(gap) = p.diff(prev) {
                    if tx.send(KeyGap { key: key.clone(), gap }).await.is_err() {
                        return;
                    }
                }
            }
            gs.insert(key, p);
        }
    });
    GapStream { rx }
}

/// KeyTimeCoze is one identity's counters inside one day bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTimeCoze {
    pub key: String,
    pub when: DateTime<Utc>,
    #[serde(flatten)]
    pub coze: Coze,
}

pub struct CozeStream {
    rx: mpsc::Receiver<KeyTimeCoze>,
}

#[async_trait]
impl AsyncIterator for CozeStream {
    type Item = KeyTimeCoze;

    async fn try_next(&mut self) -> anyhow::Result<Option<KeyTimeCoze>> {
        Ok(self.rx.recv().await)
    }
}

/// count_by_day partitions a walk by identity and day-aligned bucket.
/// A bucket is flushed as soon as a packet lands a day or more past its
/// start; whatever remains is emitted at end of stream.
pub fn count_by_day(paths: Vec<PathBuf>, decoder: Decoder) -> CozeStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut w = walk(paths, decoder);
        let mut gs: HashMap<String, KeyTimeCoze> = HashMap::new();
        let mut ps: HashMap<String, Packet> = HashMap::new();
        while let Ok(Some(p)) = w.try_next().await {
            let key = packet_key(&p);
            if let Some(c) = gs.get(&key) {
                if p.timestamp() - c.when >= *DAY {
                    let c = gs.remove(&key).unwrap();
                    if tx.send(c).await.is_err() {
                        return;
                    }
                }
            }
            let c = gs.entry(key.clone()).or_insert_with(|| KeyTimeCoze {
                key: key.clone(),
                when: truncate(p.timestamp(), *DAY),
                coze: Coze { id: p.id().0, ..Coze::default() },
            });
            c.coze.count += 1;
            c.coze.size += p.len() as u64;
            if let Some(prev) = ps.get(&key) {
                if let Some(g) = p.diff(prev) {
                    c.coze.missing += g.missing();
                }
            }
            if p.is_error() {
                c.coze.error += 1;
            }
            ps.insert(key, p);
        }
        for (_, c) in gs.drain() {
            if tx.send(c).await.is_err() {
                return;
            }
        }
    });
    CozeStream { rx }
}

/// packet_key renders the identity the aggregators group on: apid for
/// TM, the hex code for PD, the channel name for VMU and
/// origin/type/upi for the high-rate units.
pub fn packet_key(p: &Packet) -> String {
    match p {
        Packet::Tm(t) => t.ccsds.apid().to_string(),
        Packet::Pd(d) => format!("0x{:012x}", d.umi.code_value()),
        Packet::Vmu(v) => v.vmu.channel.to_string(),
        Packet::Hrd(h) => format!(
            "{:x}/{}/{}",
            h.common.origin,
            h.common.data_type(),
            h.common.upi_string()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::pd::tests::pd_frame;
    use crate::packet::tm::tests::tm_frame;
    use crate::packet::vmu::tests::{table_unit, vmu_frame};
    use hrdp_common::iterator::collect;

    async fn write_tree(dir: &Path) {
        // two nested files plus one at the root; walk order is
        // lexicographic: a.dat, sub/b.dat, sub/c.dat
        tokio::fs::create_dir_all(dir.join("sub")).await.unwrap();
        tokio::fs::write(
            dir.join("a.dat"),
            [tm_frame(0x1A2, 1, 7, 100), tm_frame(0x1A2, 2, 7, 101)].concat(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("sub/b.dat"), tm_frame(0x1A2, 3, 7, 102))
            .await
            .unwrap();
        tokio::fs::write(dir.join("sub/c.dat"), tm_frame(0x1A2, 6, 7, 110))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_walk_order() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path()).await;

        let mut w = walk(vec![dir.path().to_path_buf()], Decoder::Tm);
        let ps = collect(&mut w).await.unwrap();
        let seqs: Vec<u32> = ps.iter().map(|p| p.sequence()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 6]);
    }

    #[tokio::test]
    async fn test_walk_skips_foreign_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = tm_frame(0x1A2, 1, 7, 100);
        data.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0xAB, 0xCD]); // too short to decode
        data.extend_from_slice(&tm_frame(0x1A2, 2, 7, 101));
        tokio::fs::write(dir.path().join("a.dat"), data).await.unwrap();

        let mut w = walk(vec![dir.path().to_path_buf()], Decoder::Tm);
        let ps = collect(&mut w).await.unwrap();
        assert_eq!(ps.len(), 2);
    }

    #[tokio::test]
    async fn test_gaps_stream() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("a.dat"),
            [
                tm_frame(0x1A2, 1, 7, 100),
                tm_frame(0x1A2, 5, 7, 104),
                tm_frame(0x1A2, 6, 7, 105),
            ]
            .concat(),
        )
        .await
        .unwrap();

        let mut g = gaps(vec![dir.path().to_path_buf()], Decoder::Tm);
        let gs = collect(&mut g).await.unwrap();
        assert_eq!(gs.len(), 1);
        assert_eq!(gs[0].key, "418");
        assert_eq!(gs[0].gap.missing(), 3);
    }

    #[tokio::test]
    async fn test_count_by_day_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let day = 86_400u32;
        tokio::fs::write(
            dir.path().join("a.dat"),
            [
                tm_frame(0x1A2, 1, 7, 1_000),
                tm_frame(0x1A2, 2, 7, 2_000),
                tm_frame(0x1A2, 3, 7, day + 1_000),
            ]
            .concat(),
        )
        .await
        .unwrap();

        let mut c = count_by_day(vec![dir.path().to_path_buf()], Decoder::Tm);
        let mut cs = collect(&mut c).await.unwrap();
        cs.sort_by_key(|c| c.when);
        assert_eq!(cs.len(), 2);
        assert_eq!(cs[0].coze.count, 2);
        assert_eq!(cs[0].when.timestamp(), 0);
        assert_eq!(cs[1].coze.count, 1);
        assert_eq!(cs[1].when.timestamp(), day as i64);
        assert_eq!(cs[0].key, "418");
    }

    #[tokio::test]
    async fn test_filter_errors_polarity() {
        let dir = tempfile::tempdir().unwrap();
        let code = [1, 2, 3, 4, 5, 6];
        tokio::fs::write(
            dir.path().join("a.dat"),
            [pd_frame(code, 0, 100), pd_frame(code, 9, 101)].concat(),
        )
        .await
        .unwrap();

        let w = walk(vec![dir.path().to_path_buf()], Decoder::Pd);
        let mut only_valid = filter_errors(w, false);
        assert_eq!(collect(&mut only_valid).await.unwrap().len(), 1);

        let w = walk(vec![dir.path().to_path_buf()], Decoder::Pd);
        let mut all = filter_errors(w, true);
        assert_eq!(collect(&mut all).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_packet_keys() {
        let dir = tempfile::tempdir().unwrap();
        let inner = table_unit(0x11, 4, b"SCIENCE-RUN");
        tokio::fs::write(
            dir.path().join("a.dat"),
            vmu_frame(3, 0x11, 4, 1_000, &inner, false),
        )
        .await
        .unwrap();

        let mut w = walk(vec![dir.path().to_path_buf()], Decoder::Vmu);
        let ps = collect(&mut w).await.unwrap();
        assert_eq!(packet_key(&ps[0]), "lrsd");

        let mut w = walk(vec![dir.path().to_path_buf()], Decoder::Hrd);
        let ps = collect(&mut w).await.unwrap();
        assert_eq!(packet_key(&ps[0]), "11/SCC/SCIENCE-RUN");
    }

    #[tokio::test]
    async fn test_infos_stream() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.dat"), tm_frame(0x1A2, 1, 7, 100))
            .await
            .unwrap();
        let mut is = infos(vec![dir.path().to_path_buf()], Decoder::Tm);
        let all = collect(&mut is).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 0x1A2);
    }
}
