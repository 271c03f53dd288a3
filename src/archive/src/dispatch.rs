use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hrdp_common::iterator::AsyncIterator;
use hrdp_common::time::{gps_delta, truncate, FIVE};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::layout::ensure_time_path;
use crate::packet::Packet;

const DEFAULT_HANDLES: usize = 8;

/// Dispatcher routes packets into per-5-minute archive files keyed by
/// their GPS-adjusted timestamp. Handles are cached in a small LRU; the
/// first packet of a bucket names its file.
pub struct Dispatcher {
    root: PathBuf,
    cache: VecDeque<(DateTime<Utc>, File)>,
    cap: usize,
}

impl Dispatcher {
    pub fn new(root: PathBuf) -> Dispatcher {
        Dispatcher::with_capacity(root, DEFAULT_HANDLES)
    }

    pub fn with_capacity(root: PathBuf, cap: usize) -> Dispatcher {
        Dispatcher { root, cache: VecDeque::new(), cap: cap.max(1) }
    }

    /// dispatch drains a packet stream into the archive and returns how
    /// many records it appended.
    pub async fn dispatch<S>(&mut self, stream: &mut S) -> anyhow::Result<u64>
    where
        S: AsyncIterator<Item = Packet> + Send,
    {
        let mut count = 0u64;
        while let Some(p) = stream.try_next().await? {
            self.write(&p).await?;
            count += 1;
        }
        Ok(count)
    }

    /// write appends one record to the bucket its timestamp falls in.
    pub async fn write(&mut self, p: &Packet) -> anyhow::Result<()> {
        let when = p.timestamp() + gps_delta();
        let key = truncate(when, *FIVE);
        let file = self.writer_for(key, when).await?;
        file.write_all(p.bytes()).await?;
        Ok(())
    }

    async fn writer_for(&mut self, key: DateTime<Utc>, when: DateTime<Utc>) -> anyhow::Result<&mut File> {
        if let Some(ix) = self.cache.iter().position(|(k, _)| *k == key) {
            // move the hit to the back so eviction stays least-recent
            let entry = self.cache.remove(ix).unwrap();
            self.cache.push_back(entry);
        } else {
            let path = ensure_time_path(&self.root, when).await?;
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .await?;
            self.cache.push_back((key, file));
            if self.cache.len() > self.cap {
                if let Some((_, mut old)) = self.cache.pop_front() {
                    old.flush().await?;
                }
            }
        }
        Ok(&mut self.cache.back_mut().unwrap().1)
    }

    /// close flushes every cached handle, reporting the first failure.
    pub async fn close(mut self) -> anyhow::Result<()> {
        let mut first = None;
        while let Some((_, mut file)) = self.cache.pop_front() {
            if let Err(e) = file.flush().await {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
