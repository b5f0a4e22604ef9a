//! Rotated-log discovery and tailing.
//!
//! The tracer appends one JSON record per line to a log file that may be
//! rotated: older segments share the configured file's stem prefix and
//! extension and sort lexicographically before it. The feed reads every
//! segment in order, emits a consumed marker after finishing each rotated
//! one (so the checkpoint can skip it on the next run), and tails the live
//! file indefinitely.
//!
//! Lines may land in the file partially; the tail accumulates bytes until
//! the terminating newline arrives before decoding.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::record::SupplyRecord;

/// One message from the log feed.
#[derive(Debug)]
pub enum FeedEvent {
    /// A decoded per-block supply record.
    Record(SupplyRecord),
    /// A rotated file was read to its end; its name is safe to checkpoint.
    FileConsumed(String),
}

/// List log files in `dir` that belong to the rotation family of `base`:
/// names sharing its stem prefix and extension suffix, sorted
/// lexicographically.
pub fn find_rotated_files(dir: &Path, base: &str) -> Result<Vec<String>> {
    let extension = Path::new(base)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let stem = base.strip_suffix(&extension).unwrap_or(base);

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing log dir {dir:?}"))? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with(stem) && name.ends_with(&extension) {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

/// Stream records from `path` and its rotated predecessors into `tx`.
///
/// Files up to and including `skip_until` (the checkpointed last-consumed
/// file) are skipped. The live file, the one named exactly like `path`, is
/// tailed forever, so this function only returns on error or when the
/// receiving side of `tx` is gone.
pub async fn run_feed(
    path: PathBuf,
    skip_until: Option<String>,
    poll_interval: Duration,
    tx: mpsc::Sender<FeedEvent>,
) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if parent != Path::new("") => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("supply file path {path:?} has no file name"))?;

    let files = find_rotated_files(&dir, &base)?;
    info!("Found {} log file(s) for {:?}", files.len(), base);

    let mut skipping = skip_until.is_some();
    let mut saw_live = false;
    for name in files {
        if skipping {
            if Some(&name) == skip_until.as_ref() {
                skipping = false;
            }
            // A checkpoint naming the live file means it was consumed too;
            // do not re-read it from the start below.
            saw_live = saw_live || name == base;
            debug!("Skipping already-consumed log file {}", name);
            continue;
        }

        let live = name == base;
        saw_live = saw_live || live;
        process_log_file(&dir.join(&name), live, poll_interval, &tx)
            .await
            .with_context(|| format!("processing log file {name}"))?;

        if !live && tx.send(FeedEvent::FileConsumed(name)).await.is_err() {
            return Ok(());
        }
    }

    // The live file may not exist yet (e.g. a fresh tracer): wait for it,
    // then tail as usual.
    if !saw_live {
        let live_path = dir.join(&base);
        info!("Waiting for {:?} to appear", live_path);
        while !live_path.exists() {
            sleep(poll_interval).await;
        }
        process_log_file(&live_path, true, poll_interval, &tx)
            .await
            .with_context(|| format!("processing log file {base}"))?;
    }

    Ok(())
}

/// Read one log file line by line, decoding each into a record.
///
/// When `tail` is set, EOF means "wait for more": sleep and retry from the
/// current position instead of returning.
async fn process_log_file(
    path: &Path,
    tail: bool,
    poll_interval: Duration,
    tx: &mpsc::Sender<FeedEvent>,
) -> Result<()> {
    let file = File::open(path)
        .await
        .with_context(|| format!("opening {path:?}"))?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            if tail {
                sleep(poll_interval).await;
                continue;
            }
            // A trailing line without a newline still counts.
            deliver(&line, tx).await?;
            return Ok(());
        }

        if line.ends_with('\n') {
            deliver(&line, tx).await?;
            line.clear();
        }
        // Otherwise the line is incomplete; keep accumulating until the
        // newline lands.
    }
}

async fn deliver(line: &str, tx: &mpsc::Sender<FeedEvent>) -> Result<()> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(());
    }

    let record: SupplyRecord =
        serde_json::from_str(trimmed).context("decoding supply record line")?;
    if tx.send(FeedEvent::Record(record)).await.is_err() {
        bail!("record feed receiver dropped");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn record_line(number: u64, hash_byte: u8, parent_byte: u8, reward: u64) -> String {
        let mut hash = [0u8; 32];
        hash[0] = hash_byte;
        let mut parent = [0u8; 32];
        parent[0] = parent_byte;
        format!(
            r#"{{"blockNumber":{number},"hash":"0x{}","parentHash":"0x{}","issuance":{{"reward":"{:#x}"}},"burn":{{}}}}"#,
            hex::encode(hash),
            hex::encode(parent),
            reward,
        )
    }

    #[test]
    fn test_find_rotated_files_sorts_and_filters() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "supply.jsonl", "");
        write_file(dir.path(), "supply-2024-02.jsonl", "");
        write_file(dir.path(), "supply-2024-01.jsonl", "");
        write_file(dir.path(), "other.jsonl", "");
        write_file(dir.path(), "supply.log", "");

        let files = find_rotated_files(dir.path(), "supply.jsonl").unwrap();
        assert_eq!(
            files,
            vec![
                "supply-2024-01.jsonl".to_string(),
                "supply-2024-02.jsonl".to_string(),
                "supply.jsonl".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_feed_consumes_rotated_files_then_tails() {
        let dir = tempdir().unwrap();
        write_file(
            dir.path(),
            "supply-001.jsonl",
            &format!("{}\n{}\n", record_line(0, 1, 0, 1), record_line(1, 2, 1, 1)),
        );
        write_file(
            dir.path(),
            "supply.jsonl",
            &format!("{}\n", record_line(2, 3, 2, 1)),
        );

        let (tx, mut rx) = mpsc::channel(16);
        let path = dir.path().join("supply.jsonl");
        let feed = tokio::spawn(run_feed(path, None, Duration::from_millis(10), tx));

        let mut numbers = Vec::new();
        let mut consumed = Vec::new();
        for _ in 0..4 {
            match rx.recv().await.unwrap() {
                FeedEvent::Record(record) => numbers.push(record.number),
                FeedEvent::FileConsumed(name) => consumed.push(name),
            }
        }

        assert_eq!(numbers, vec![0, 1, 2]);
        assert_eq!(consumed, vec!["supply-001.jsonl".to_string()]);

        // The live file is still being tailed.
        assert!(!feed.is_finished());
        feed.abort();
    }

    #[tokio::test]
    async fn test_feed_skips_until_checkpointed_file() {
        let dir = tempdir().unwrap();
        write_file(
            dir.path(),
            "supply-001.jsonl",
            &format!("{}\n", record_line(0, 1, 0, 1)),
        );
        write_file(
            dir.path(),
            "supply-002.jsonl",
            &format!("{}\n", record_line(1, 2, 1, 1)),
        );
        write_file(dir.path(), "supply.jsonl", "");

        let (tx, mut rx) = mpsc::channel(16);
        let path = dir.path().join("supply.jsonl");
        let feed = tokio::spawn(run_feed(
            path,
            Some("supply-001.jsonl".to_string()),
            Duration::from_millis(10),
            tx,
        ));

        match rx.recv().await.unwrap() {
            FeedEvent::Record(record) => assert_eq!(record.number, 1),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            FeedEvent::FileConsumed(name) => assert_eq!(name, "supply-002.jsonl"),
            other => panic!("unexpected event {other:?}"),
        }

        feed.abort();
    }

    #[tokio::test]
    async fn test_tail_picks_up_appended_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("supply.jsonl");
        std::fs::write(&path, format!("{}\n", record_line(0, 1, 0, 1))).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let feed = tokio::spawn(run_feed(
            path.clone(),
            None,
            Duration::from_millis(10),
            tx,
        ));

        match rx.recv().await.unwrap() {
            FeedEvent::Record(record) => assert_eq!(record.number, 0),
            other => panic!("unexpected event {other:?}"),
        }

        // Append while the feed is at EOF.
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", record_line(1, 2, 1, 1)).unwrap();
        drop(file);

        match rx.recv().await.unwrap() {
            FeedEvent::Record(record) => assert_eq!(record.number, 1),
            other => panic!("unexpected event {other:?}"),
        }

        feed.abort();
    }

    #[tokio::test]
    async fn test_malformed_line_is_an_error() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "supply-001.jsonl", "not json\n");
        write_file(dir.path(), "supply.jsonl", "");

        let (tx, _rx) = mpsc::channel(16);
        let path = dir.path().join("supply.jsonl");
        let result = run_feed(path, None, Duration::from_millis(10), tx).await;
        assert!(result.is_err());
    }
}
