//! Snapshot sources.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, warn};

use super::MarketSnapshot;

/// Pull boundary for market/portfolio snapshots.
///
/// `Ok(None)` means the source is exhausted and the decision loop should stop.
#[async_trait]
pub trait SnapshotSource: Send {
    async fn next_snapshot(&mut self) -> Result<Option<MarketSnapshot>>;
}

/// Replays snapshots from a JSON-lines file, one snapshot per line.
pub struct JsonlFeed {
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl JsonlFeed {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .await
            .with_context(|| format!("Failed to open snapshot feed {}", path.as_ref().display()))?;

        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

#[async_trait]
impl SnapshotSource for JsonlFeed {
    async fn next_snapshot(&mut self) -> Result<Option<MarketSnapshot>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            return match serde_json::from_str::<MarketSnapshot>(&line) {
                Ok(snapshot) => {
                    debug!(line = self.line_no, ts = %snapshot.timestamp, "Read snapshot");
                    Ok(Some(snapshot))
                }
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "Malformed snapshot line");
                    Err(e).with_context(|| format!("Malformed snapshot at line {}", self.line_no))
                }
            };
        }

        Ok(None)
    }
}

/// In-memory source used by tests and offline tooling.
pub struct VecFeed {
    items: std::collections::VecDeque<Result<MarketSnapshot>>,
}

impl VecFeed {
    pub fn new(items: Vec<Result<MarketSnapshot>>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for VecFeed {
    async fn next_snapshot(&mut self) -> Result<Option<MarketSnapshot>> {
        match self.items.pop_front() {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::fixtures;
    use std::io::Write;

    #[tokio::test]
    async fn test_jsonl_feed_reads_snapshots() {
        let snapshot = fixtures::complete_snapshot(fixtures::monday_midday());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", serde_json::to_string(&snapshot).unwrap()).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{}", serde_json::to_string(&snapshot).unwrap()).unwrap();
        file.flush().unwrap();

        let mut feed = JsonlFeed::open(file.path()).await.unwrap();
        assert_eq!(feed.next_snapshot().await.unwrap(), Some(snapshot.clone()));
        assert_eq!(feed.next_snapshot().await.unwrap(), Some(snapshot));
        assert!(feed.next_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_jsonl_feed_reports_malformed_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{not json").unwrap();
        file.flush().unwrap();

        let mut feed = JsonlFeed::open(file.path()).await.unwrap();
        assert!(feed.next_snapshot().await.is_err());
    }

    #[test]
    fn test_vec_feed_yields_in_order_then_ends() {
        let first = fixtures::complete_snapshot(fixtures::monday_midday());
        let mut feed = VecFeed::new(vec![
            Ok(first.clone()),
            Err(anyhow::anyhow!("gap")),
        ]);

        tokio_test::block_on(async {
            assert_eq!(feed.next_snapshot().await.unwrap(), Some(first));
            assert!(feed.next_snapshot().await.is_err());
            assert!(feed.next_snapshot().await.unwrap().is_none());
        });
    }
}
