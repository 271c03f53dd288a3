use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::fs::File;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::packet::{Decoder, Packet};
use crate::reader::RtReader;
use crate::rw::NoDuplicate;

/// Upper bound on files extracted in parallel.
pub const MAX_EXTRACTORS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Keep only packets whose first identity component matches, when
    /// nonzero.
    pub id: u64,
    /// Strip this many leading bytes from every record written (the
    /// transport header, prefix included).
    pub cut: usize,
    /// Keep only packets received at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Keep only packets that took longer than this between acquisition
    /// and reception.
    pub min_latency: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub total: u64,
    pub written: u64,
    pub size: u64,
}

/// extract filters every source file into `<datadir>/<source path>`,
/// running at most four files at a time. A failing file removes its
/// output and fails the whole operation once the others are done.
pub async fn extract(
    files: Vec<PathBuf>,
    datadir: &Path,
    decoder: Decoder,
    opts: ExtractOptions,
) -> anyhow::Result<Vec<(PathBuf, ExtractStats)>> {
    tokio::fs::create_dir_all(datadir).await?;
    let decoder = Decoder::by_id(opts.id, decoder);
    let sema = Arc::new(Semaphore::new(MAX_EXTRACTORS));

    let mut tasks = JoinSet::new();
    for src in files {
        let sema = sema.clone();
        let decoder = decoder.clone();
        let opts = opts.clone();
        let dst = datadir.join(relative(&src));
        tasks.spawn(async move {
            let _permit = sema.acquire_owned().await.expect("semaphore closed");
            match extract_file(&src, &dst, &decoder, &opts).await {
                Ok(stats) => {
                    info!(
                        "{}/{} packets extracted ({}MB) from {}",
                        stats.written,
                        stats.total,
                        stats.size >> 20,
                        src.display(),
                    );
                    Ok((dst, stats))
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&dst).await;
                    Err(e.context(format!("extract {}", src.display())))
                }
            }
        });
    }

    let mut out = Vec::new();
    let mut first_err = None;
    while let Some(res) = tasks.join_next().await {
        match res? {
            Ok(v) => out.push(v),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn relative(p: &Path) -> &Path {
    p.strip_prefix("/").unwrap_or(p)
}

async fn extract_file(
    src: &Path,
    dst: &Path,
    decoder: &Decoder,
    opts: &ExtractOptions,
) -> anyhow::Result<ExtractStats> {
    let r = File::open(src).await?;
    if let Some(dir) = dst.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let w = File::create(dst).await?;

    let mut rt = RtReader::new(r, decoder.clone());
    let mut ws = NoDuplicate::new(w);
    let mut stats = ExtractStats::default();
    let now = Utc::now();
    while let Some(p) = rt.next_packet().await? {
        stats.total += 1;
        if !should_keep(&p, opts, now) {
            continue;
        }
        let bs = p.bytes();
        let cut = opts.cut.min(bs.len());
        let n = ws.write_record(&bs[cut..]).await?;
        stats.written += 1;
        stats.size += n as u64;
    }
    ws.flush().await?;
    Ok(stats)
}

fn should_keep(p: &Packet, opts: &ExtractOptions, now: DateTime<Utc>) -> bool {
    if opts.since.is_none() && opts.min_latency.is_none() {
        return true;
    }
    if p.reception() > now {
        return false;
    }
    if let Some(since) = opts.since {
        if p.reception() < since {
            return false;
        }
    }
    if let Some(lat) = opts.min_latency {
        if p.reception() - p.timestamp() <= lat {
            return false;
        }
    }
    true
}
