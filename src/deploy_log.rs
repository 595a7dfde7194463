//! Append-only deploy log kept under the project root.

use chrono::Utc;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::error;

/// Bytes read per step when scanning the log backwards
const TAIL_CHUNK_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DeployLog {
    path: PathBuf,
}

impl DeployLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line per input line, each with its own timestamp and tag.
    /// Every line goes out in a single write so readers never see half a line.
    pub async fn append(&self, tag: &str, message: &str) {
        if let Err(e) = self.try_append(tag, message).await {
            error!("Failed to write deploy log {}: {}", self.path.display(), e);
        }
    }

    async fn try_append(&self, tag: &str, message: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let timestamp = Utc::now().to_rfc3339();
        for line in message.lines() {
            let entry = format!("{} [{}] {}\n", timestamp, tag, line);
            file.write_all(entry.as_bytes()).await?;
        }
        file.flush().await
    }

    /// Last `n` lines of the log. A missing log yields an empty list.
    ///
    /// Reads backwards from the end in chunks until `n` whole lines are
    /// buffered, so the cost does not grow with the log's history.
    pub async fn tail(&self, n: usize) -> std::io::Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut start = file.metadata().await?.len();
        let mut buf: Vec<u8> = Vec::new();
        while start > 0 {
            let from = start.saturating_sub(TAIL_CHUNK_BYTES);
            let mut chunk = vec![0u8; (start - from) as usize];
            file.seek(SeekFrom::Start(from)).await?;
            file.read_exact(&mut chunk).await?;
            chunk.extend_from_slice(&buf);
            buf = chunk;
            start = from;

            // one extra newline guarantees the first kept line is whole
            if buf.iter().filter(|&&b| b == b'\n').count() > n {
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let mut lines: Vec<&str> = text.lines().collect();
        if start > 0 && !lines.is_empty() {
            // partial line cut by the chunk boundary
            lines.remove(0);
        }
        lines.retain(|l| !l.is_empty());
        let skip = lines.len().saturating_sub(n);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_log_tails_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeployLog::new(dir.path().join("deploy.log"));
        assert!(log.tail(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tail_returns_last_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeployLog::new(dir.path().join("nested/deploy.log"));
        for i in 0..60 {
            log.append("job", &format!("line {}", i)).await;
        }
        log.append("job", "multi\nline").await;

        let tail = log.tail(50).await.unwrap();
        assert_eq!(tail.len(), 50);
        assert!(tail[47].ends_with("[job] line 59"));
        assert!(tail[48].ends_with("[job] multi"));
        assert!(tail[49].ends_with("[job] line"));
    }

    #[tokio::test]
    async fn tail_of_a_large_log_reads_only_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.log");
        let mut content = String::new();
        for i in 0..5000 {
            content.push_str(&format!("2025-01-01T00:00:00+00:00 [job] line {:05} é\n", i));
        }
        assert!(content.len() as u64 > 3 * TAIL_CHUNK_BYTES);
        std::fs::write(&path, content).unwrap();
        let log = DeployLog::new(&path);

        let tail = log.tail(3).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with("line 04997 é"));
        assert!(tail[2].ends_with("line 04999 é"));

        // more lines than fit in one chunk
        let tail = log.tail(4000).await.unwrap();
        assert_eq!(tail.len(), 4000);
        assert!(tail[0].ends_with("line 01000 é"));

        let all = log.tail(10_000).await.unwrap();
        assert_eq!(all.len(), 5000);
        assert!(all[0].ends_with("line 00000 é"));
        assert!(log.tail(0).await.unwrap().is_empty());
    }
}
