use std::cmp::Ordering;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use hrdp_common::iterator::AsyncIterator;
use hrdp_common::time::{gps_delta, time_format, truncate, FIVE};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWrite;

use crate::packet::{Decoder, Packet};
use crate::reader::RtReader;
use crate::rw::NoDuplicate;

/// MergeStats summarizes one merge window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub rogue: u64,
    pub count: u64,
    pub size: u64,
    #[serde(rename = "dtstart")]
    pub starts: DateTime<Utc>,
    #[serde(rename = "dtend")]
    pub ends: DateTime<Utc>,
}

/// Merger interleaves two time-sorted packet streams inside one span
/// window, dropping rogue packets and deduplicating its output.
pub struct Merger<W> {
    writer: NoDuplicate<W>,
}

fn is_rogue(t: DateTime<Utc>, low: DateTime<Utc>, high: DateTime<Utc>) -> bool {
    t < low || t >= high
}

impl<W: AsyncWrite + Unpin> Merger<W> {
    pub fn new(w: W) -> Merger<W> {
        Merger { writer: NoDuplicate::new(w) }
    }

    /// merge consumes both streams until they drain. The window is
    /// anchored on the first target packet (first source packet when the
    /// target is empty); packets outside it count as rogue and are
    /// skipped. Timestamp ties gather the whole equal-time run from both
    /// sides and order it by the family's natural order.
    pub async fn merge<S, T>(
        &mut self,
        src: &mut S,
        tgt: &mut T,
        span: Duration,
    ) -> anyhow::Result<Option<MergeStats>>
    where
        S: AsyncIterator<Item = Packet> + Send,
        T: AsyncIterator<Item = Packet> + Send,
    {
        let span = if span > Duration::zero() { span } else { *FIVE };

        let mut p0 = src.try_next().await?;
        let mut p1 = tgt.try_next().await?;
        let anchor = match (&p0, &p1) {
            (_, Some(p)) => p.timestamp(),
            (Some(p), None) => p.timestamp(),
            (None, None) => return Ok(None),
        };
        let low = truncate(anchor, span);
        let high = low + span;

        let mut ms = MergeStats { rogue: 0, count: 0, size: 0, starts: low, ends: high };
        loop {
            match (p0.take(), p1.take()) {
                (None, None) => return Ok(Some(ms)),
                (Some(p), None) => {
                    self.write(&p, &mut ms).await?;
                    self.drain(src, &mut ms).await?;
                    return Ok(Some(ms));
                }
                (None, Some(p)) => {
                    self.write(&p, &mut ms).await?;
                    self.drain(tgt, &mut ms).await?;
                    return Ok(Some(ms));
                }
                (Some(a), Some(b)) => {
                    let (t0, t1) = (a.timestamp(), b.timestamp());
                    if is_rogue(t0, low, high) {
                        ms.rogue += 1;
                        p0 = src.try_next().await?;
                        p1 = Some(b);
                        continue;
                    }
                    if is_rogue(t1, low, high) {
                        ms.rogue += 1;
                        p0 = Some(a);
                        p1 = tgt.try_next().await?;
                        continue;
                    }
                    match t0.cmp(&t1) {
                        Ordering::Equal => {
                            let mut ps = vec![a, b];
                            let (more, next) = scan_until(src, t0).await?;
                            ps.extend(more);
                            p0 = next;
                            let (more, next) = scan_until(tgt, t1).await?;
                            ps.extend(more);
                            p1 = next;

                            ps.sort_by(|x, y| {
                                if x.less(y) {
                                    Ordering::Less
                                } else if y.less(x) {
                                    Ordering::Greater
                                } else {
                                    Ordering::Equal
                                }
                            });
                            for p in &ps {
                                self.write(p, &mut ms).await?;
                            }
                        }
                        Ordering::Less => {
                            self.write(&a, &mut ms).await?;
                            p0 = src.try_next().await?;
                            p1 = Some(b);
                        }
                        Ordering::Greater => {
                            self.write(&b, &mut ms).await?;
                            p0 = Some(a);
                            p1 = tgt.try_next().await?;
                        }
                    }
                }
            }
        }
    }

    /// finish flushes whatever sits below the deduplicator.
    pub async fn finish(mut self) -> anyhow::Result<()> {
        self.writer.flush().await
    }

    async fn write(&mut self, p: &Packet, ms: &mut MergeStats) -> anyhow::Result<()> {
        let n = self.writer.write_record(p.bytes()).await?;
        ms.count += 1;
        ms.size += n as u64;
        Ok(())
    }

    async fn drain<S>(&mut self, stream: &mut S, ms: &mut MergeStats) -> anyhow::Result<()>
    where
        S: AsyncIterator<Item = Packet> + Send,
    {
        while let Some(p) = stream.try_next().await? {
            self.write(&p, ms).await?;
        }
        Ok(())
    }
}

async fn scan_until<S>(
    stream: &mut S,
    t: DateTime<Utc>,
) -> anyhow::Result<(Vec<Packet>, Option<Packet>)>
where
    S: AsyncIterator<Item = Packet> + Send,
{
    let mut ps = Vec::new();
    loop {
        match stream.try_next().await? {
            Some(p) if p.timestamp() == t => ps.push(p),
            next => return Ok((ps, next)),
        }
    }
}

/// merge_files merges two RT files into a target file and logs the
/// outcome with GPS-rendered window bounds.
pub async fn merge_files(
    src: &Path,
    dst: &Path,
    target: &Path,
    decoder: Decoder,
    span: Duration,
) -> anyhow::Result<Option<MergeStats>> {
    let source = File::open(src).await?;
    let dest = File::open(dst).await?;
    if let Some(dir) = target.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir).await?;
        }
    }
    let out = File::create(target).await?;

    let mut merger = Merger::new(out);
    let mut a = RtReader::new(source, decoder.clone());
    let mut b = RtReader::new(dest, decoder);
    let stats = merger.merge(&mut a, &mut b, span).await?;
    merger.finish().await?;

    if let Some(s) = &stats {
        let delta = gps_delta();
        info!(
            "{} packets in range {}/{} merged ({}MB) - rogue packet(s): {}",
            s.count,
            time_format(s.starts + delta),
            time_format(s.ends + delta),
            s.size >> 20,
            s.rogue,
        );
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tm::tests::tm_frame;
    use chrono::TimeZone;

    fn reader(frames: Vec<Vec<u8>>) -> RtReader<std::io::Cursor<Vec<u8>>> {
        let mut bs = Vec::new();
        for f in frames {
            bs.extend_from_slice(&f);
        }
        RtReader::new(std::io::Cursor::new(bs), Decoder::Tm)
    }

    fn at(min: u32, sec: u32) -> u32 {
        // seconds after 2024-01-01T00:00:00Z
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        base.timestamp() as u32 + min * 60 + sec
    }

    #[tokio::test]
    async fn test_rogue_outside_window() {
        // target anchors the window at 2024-01-01T00:00/00:05
        let mut src = reader(vec![
            tm_frame(0x1A2, 1, 7, at(7, 0)), // rogue
            tm_frame(0x1A2, 2, 7, at(3, 0)),
        ]);
        let mut tgt = reader(vec![tm_frame(0x1A2, 10, 7, at(0, 30))]);

        let mut out = Vec::new();
        let mut m = Merger::new(&mut out);
        let s = m.merge(&mut src, &mut tgt, *FIVE).await.unwrap().unwrap();
        assert_eq!(s.rogue, 1);
        assert_eq!(s.count, 2);
        assert_eq!(s.starts, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(s.ends, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());

        // the rogue record never reaches the output
        let rogue = tm_frame(0x1A2, 1, 7, at(7, 0));
        assert!(!out.windows(rogue.len()).any(|w| w == &rogue[..]));
    }

    #[tokio::test]
    async fn test_no_loss_accounting() {
        let mut src = reader(vec![
            tm_frame(0x1A2, 1, 7, at(0, 10)),
            tm_frame(0x1A2, 2, 7, at(0, 20)),
            tm_frame(0x1A2, 3, 7, at(9, 0)), // rogue
        ]);
        let mut tgt = reader(vec![
            tm_frame(0x1A2, 5, 7, at(0, 15)),
            tm_frame(0x1A2, 6, 7, at(0, 25)),
        ]);

        let mut out = Vec::new();
        let mut m = Merger::new(&mut out);
        let s = m.merge(&mut src, &mut tgt, *FIVE).await.unwrap().unwrap();
        assert_eq!(s.rogue + s.count, 5);
        assert_eq!(s.size as usize, out.len());
    }

    #[tokio::test]
    async fn test_tie_sorted_by_sequence() {
        let mut src = reader(vec![
            tm_frame(0x1A2, 4, 7, at(1, 0)),
            tm_frame(0x1A2, 5, 7, at(1, 0)),
        ]);
        let mut tgt = reader(vec![tm_frame(0x1A2, 2, 7, at(1, 0))]);

        let mut out = Vec::new();
        let mut m = Merger::new(&mut out);
        let s = m.merge(&mut src, &mut tgt, *FIVE).await.unwrap().unwrap();
        assert_eq!(s.count, 3);

        // output order follows the TM sequence order
        let mut sc = crate::scan::FrameScanner::new(&out[..]);
        let mut seqs = Vec::new();
        while let Some(frame) = sc.next_frame().await.unwrap() {
            let p = Decoder::Tm.decode(frame).unwrap();
            seqs.push(p.sequence());
        }
        assert_eq!(seqs, vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn test_duplicates_written_once() {
        let dup = tm_frame(0x1A2, 1, 7, at(0, 10));
        let mut src = reader(vec![dup.clone()]);
        let mut tgt = reader(vec![dup.clone()]);

        let mut out = Vec::new();
        let mut m = Merger::new(&mut out);
        let s = m.merge(&mut src, &mut tgt, *FIVE).await.unwrap().unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(out.len(), dup.len());
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let mut src = reader(vec![]);
        let mut tgt = reader(vec![]);
        let mut out = Vec::new();
        let mut m = Merger::new(&mut out);
        assert!(m.merge(&mut src, &mut tgt, *FIVE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.dat");
        let b = dir.path().join("b.dat");
        let t = dir.path().join("out/merged.dat");

        tokio::fs::write(&a, tm_frame(0x1A2, 1, 7, at(0, 10))).await.unwrap();
        tokio::fs::write(&b, tm_frame(0x1A2, 2, 7, at(0, 20))).await.unwrap();

        let s = merge_files(&a, &b, &t, Decoder::Tm, *FIVE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.count, 2);
        let merged = tokio::fs::read(&t).await.unwrap();
        assert_eq!(s.size as usize, merged.len());
    }
}
