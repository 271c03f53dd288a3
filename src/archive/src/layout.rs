use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use hrdp_common::time::FIVE;

/// time_path maps an instant to its archive location:
/// `<root>/<YYYY>/<DDD>/<HH>/rt_<MM>_<MM+4>.dat`. The minute is taken
/// as-is, not aligned to a bucket boundary; readers enumerate by minute
/// steps for that reason.
pub fn time_path(root: &Path, t: DateTime<Utc>) -> PathBuf {
    let min = t.minute();
    root.join(format!("{:04}", t.year()))
        .join(format!("{:03}", t.ordinal()))
        .join(format!("{:02}", t.hour()))
        .join(format!("rt_{:02}_{:02}.dat", min, min + 4))
}

/// ensure_time_path is time_path with the directory chain created.
pub async fn ensure_time_path(root: &Path, t: DateTime<Utc>) -> anyhow::Result<PathBuf> {
    let path = time_path(root, t);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(path)
}

/// list_paths enumerates the archive files for each 5-minute step in
/// `[from, to)`, keeping only paths that exist as regular files. An
/// inverted range is an argument error.
pub async fn list_paths(
    root: &Path,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> anyhow::Result<Vec<PathBuf>> {
    if to < from {
        return Err(anyhow!("invalid time range: {} is before {}", to, from));
    }
    let mut ds = Vec::new();
    let mut fd = from;
    while fd < to {
        let p = time_path(root, fd);
        if let Ok(meta) = tokio::fs::metadata(&p).await {
            if meta.is_file() {
                ds.push(p);
            }
        }
        fd = fd + *FIVE;
    }
    Ok(ds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_path() {
        let root = Path::new("/archive");
        let t = Utc.with_ymd_and_hms(2024, 3, 12, 13, 47, 2).unwrap();
        assert_eq!(
            time_path(root, t),
            PathBuf::from("/archive/2024/072/13/rt_47_51.dat")
        );

        // day-of-year handles the leap year
        let t = Utc.with_ymd_and_hms(2023, 3, 12, 0, 0, 0).unwrap();
        assert_eq!(
            time_path(root, t),
            PathBuf::from("/archive/2023/071/00/rt_00_04.dat")
        );
    }

    #[tokio::test]
    async fn test_list_paths_finds_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 12, 13, 47, 0).unwrap();
        let p = ensure_time_path(dir.path(), t).await.unwrap();
        tokio::fs::write(&p, b"x").await.unwrap();

        // a range just past the bucket boundary still includes it
        let ds = list_paths(dir.path(), t, t + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(ds, vec![p]);
    }

    #[tokio::test]
    async fn test_list_paths_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 12, 13, 0, 0).unwrap();
        let ds = list_paths(dir.path(), t, t + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(ds.is_empty());
    }

    #[tokio::test]
    async fn test_list_paths_inverted_range() {
        let dir = tempfile::tempdir().unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 12, 13, 0, 0).unwrap();
        assert!(list_paths(dir.path(), t, t - chrono::Duration::minutes(5))
            .await
            .is_err());
    }
}
