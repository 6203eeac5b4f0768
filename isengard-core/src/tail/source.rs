//! Following a single file
//!
//! A [`TailSource`] owns one open descriptor and reads it line by line. At end
//! of file it sleeps for one poll interval, then checks whether the path was
//! rotated (now names a different file), truncated, or removed before reading
//! again. A removed file's descriptor is drained and released; the path is
//! then polled until it reappears.

use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{LogLine, StartAt};

/// Device and inode of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn file_id(meta: &Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some(FileId {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn file_id(_meta: &Metadata) -> Option<FileId> {
    None
}

/// What a poll at end of file found at the watched path.
#[derive(Debug, PartialEq, Eq)]
enum PathCheck {
    Unchanged,
    Truncated,
    Rotated,
    Missing,
}

/// One followed file.
///
/// `reader` is `None` while the path is missing; the old descriptor is
/// released as soon as the removal is noticed.
#[derive(Debug)]
pub struct TailSource {
    path: Arc<Path>,
    reader: Option<BufReader<File>>,
    id: Option<FileId>,
    pos: u64,
    poll: Duration,
    missing_since: Option<Instant>,
    missing_timeout: Option<Duration>,
}

impl TailSource {
    /// Open `path` and position it according to `start`.
    ///
    /// The file must exist. Errors here are reported to the caller so that a
    /// single unreadable file can be skipped.
    pub async fn open(path: impl AsRef<Path>, start: StartAt, poll: Duration) -> Result<Self> {
        let path: Arc<Path> = Arc::from(path.as_ref());
        let mut file = File::open(&path)
            .await
            .map_err(|e| Error::tail(&*path, e))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| Error::tail(&*path, e))?;
        if !meta.is_file() {
            return Err(Error::tail(
                &*path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let pos = match start {
            StartAt::Beginning => 0,
            StartAt::End => file
                .seek(SeekFrom::End(0))
                .await
                .map_err(|e| Error::tail(&*path, e))?,
        };

        tracing::debug!(path = %path.display(), offset = pos, "Opened tail source");

        Ok(Self {
            path,
            reader: Some(BufReader::new(file)),
            id: file_id(&meta),
            pos,
            poll,
            missing_since: None,
            missing_timeout: None,
        })
    }

    /// End the tail once its path has been missing for `timeout`.
    /// `None` waits for the path to return indefinitely.
    pub fn with_missing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.missing_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    /// Current read offset in bytes.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read lines into `tx` until `cancel` fires, the receiver goes away, the
    /// path stays missing past the missing timeout, or an unrecoverable error
    /// occurs.
    ///
    /// An unrecoverable error is reported as one final [`LogLine::failed`].
    pub async fn follow(mut self, tx: mpsc::Sender<LogLine>, cancel: CancellationToken) {
        let mut buf = Vec::new();

        loop {
            let Some(reader) = self.reader.as_mut() else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll) => {}
                }
                match self.reopen().await {
                    Ok(()) => {
                        tracing::info!(path = %self.path.display(), "File reappeared, reading from start");
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        if self.missing_expired() {
                            tracing::warn!(path = %self.path.display(), "File did not reappear, ending tail");
                            break;
                        }
                    }
                    Err(e) => {
                        self.fail(&tx, &cancel, e).await;
                        break;
                    }
                }
                continue;
            };

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll) => {}
                    }
                    match self.check_path().await {
                        PathCheck::Unchanged => {}
                        PathCheck::Truncated => {
                            tracing::info!(path = %self.path.display(), "File truncated, reading from start");
                            buf.clear();
                            if let Err(e) = self.rewind().await {
                                self.fail(&tx, &cancel, e).await;
                                break;
                            }
                        }
                        PathCheck::Missing => {
                            if !self.finish_descriptor(&mut buf, &tx, &cancel).await {
                                break;
                            }
                            tracing::warn!(path = %self.path.display(), "Tailed file disappeared, waiting for it to return");
                            self.close();
                        }
                        PathCheck::Rotated => {
                            if !self.finish_descriptor(&mut buf, &tx, &cancel).await {
                                break;
                            }
                            match self.reopen().await {
                                Ok(()) => {
                                    tracing::info!(path = %self.path.display(), "File rotated, following new file");
                                }
                                Err(e) if e.kind() == io::ErrorKind::NotFound => self.close(),
                                Err(e) => {
                                    self.fail(&tx, &cancel, e).await;
                                    break;
                                }
                            }
                        }
                    }
                }
                Ok(n) => {
                    self.pos += n as u64;
                    if buf.last() == Some(&b'\n') {
                        let line = self.decode(&buf);
                        buf.clear();
                        if !emit(&tx, &cancel, line).await {
                            break;
                        }
                    }
                    // Otherwise a partial line; keep it until the terminator arrives.
                }
                Err(e) => {
                    self.fail(&tx, &cancel, e).await;
                    break;
                }
            }
        }

        tracing::debug!(path = %self.path.display(), offset = self.pos, "Tail source stopped");
    }

    /// Read whatever is left in the current descriptor, then emit a dangling
    /// partial line, which can no longer be completed.
    ///
    /// Returns false if the follower should stop.
    async fn finish_descriptor(
        &mut self,
        buf: &mut Vec<u8>,
        tx: &mpsc::Sender<LogLine>,
        cancel: &CancellationToken,
    ) -> bool {
        if !self.drain(buf, tx, cancel).await {
            return false;
        }
        if buf.is_empty() {
            return true;
        }
        let line = self.decode(buf);
        buf.clear();
        emit(tx, cancel, line).await
    }

    async fn drain(
        &mut self,
        buf: &mut Vec<u8>,
        tx: &mpsc::Sender<LogLine>,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return true;
        };
        loop {
            match reader.read_until(b'\n', buf).await {
                Ok(0) => return true,
                Ok(n) => {
                    self.pos += n as u64;
                    if buf.last() == Some(&b'\n') {
                        let line = decode(&self.path, buf);
                        buf.clear();
                        if !emit(tx, cancel, line).await {
                            return false;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed draining old descriptor");
                    return true;
                }
            }
        }
    }

    async fn check_path(&self) -> PathCheck {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "Tailed path not found");
                return PathCheck::Missing;
            }
        };

        if file_id(&meta) != self.id {
            return PathCheck::Rotated;
        }
        if meta.len() < self.pos {
            return PathCheck::Truncated;
        }
        PathCheck::Unchanged
    }

    async fn rewind(&mut self) -> io::Result<()> {
        if let Some(reader) = self.reader.as_mut() {
            reader.seek(SeekFrom::Start(0)).await?;
        }
        self.pos = 0;
        Ok(())
    }

    async fn reopen(&mut self) -> io::Result<()> {
        let file = File::open(&self.path).await?;
        let meta = file.metadata().await?;
        self.reader = Some(BufReader::new(file));
        self.id = file_id(&meta);
        self.pos = 0;
        self.missing_since = None;
        Ok(())
    }

    /// Drop the descriptor and start the missing clock.
    fn close(&mut self) {
        self.reader = None;
        self.id = None;
        self.pos = 0;
        self.missing_since.get_or_insert_with(Instant::now);
    }

    fn missing_expired(&self) -> bool {
        match (self.missing_timeout, self.missing_since) {
            (Some(timeout), Some(since)) => since.elapsed() >= timeout,
            _ => false,
        }
    }

    async fn fail(&self, tx: &mpsc::Sender<LogLine>, cancel: &CancellationToken, e: io::Error) {
        tracing::error!(path = %self.path.display(), error = %e, "Tail failed");
        let event = LogLine::failed(Arc::clone(&self.path), e.to_string());
        emit(tx, cancel, event).await;
    }

    fn decode(&self, raw: &[u8]) -> LogLine {
        decode(&self.path, raw)
    }
}

/// Strip the terminator and decode lossily.
fn decode(path: &Arc<Path>, raw: &[u8]) -> LogLine {
    let mut end = raw.len();
    if raw[..end].ends_with(b"\n") {
        end -= 1;
    }
    if raw[..end].ends_with(b"\r") {
        end -= 1;
    }
    let text = String::from_utf8_lossy(&raw[..end]).into_owned();
    LogLine::new(Arc::clone(path), text)
}

/// Hand one line downstream; false once the follower should stop.
async fn emit(tx: &mpsc::Sender<LogLine>, cancel: &CancellationToken, line: LogLine) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(line) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(5);

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    async fn next(rx: &mut mpsc::Receiver<LogLine>) -> LogLine {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for line")
            .expect("channel closed")
    }

    type Running = (mpsc::Receiver<LogLine>, CancellationToken, tokio::task::JoinHandle<()>);

    async fn start(path: &Path, at: StartAt) -> Running {
        start_with(path, at, POLL, None).await
    }

    async fn start_with(path: &Path, at: StartAt, poll: Duration, missing: Option<Duration>) -> Running {
        let source = TailSource::open(path, at, poll)
            .await
            .unwrap()
            .with_missing_timeout(missing);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(source.follow(tx, cancel.clone()));
        (rx, cancel, task)
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = TailSource::open(dir.path().join("nope.log"), StartAt::End, POLL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tail { .. }));
    }

    #[tokio::test]
    async fn test_open_at_end_skips_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old line\n").unwrap();

        let source = TailSource::open(&path, StartAt::End, POLL).await.unwrap();
        assert_eq!(source.position(), 9);

        let (mut rx, cancel, task) = start(&path, StartAt::End).await;
        append(&path, "new line\n");
        assert_eq!(next(&mut rx).await.text, "new line");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_at_beginning_reads_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\r\n").unwrap();

        let (mut rx, cancel, task) = start(&path, StartAt::Beginning).await;
        assert_eq!(next(&mut rx).await.text, "one");
        assert_eq!(next(&mut rx).await.text, "two");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_terminator() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let (mut rx, cancel, task) = start(&path, StartAt::End).await;
        append(&path, "hel");
        tokio::time::sleep(POLL * 5).await;
        assert!(rx.try_recv().is_err());

        append(&path, "lo\n");
        assert_eq!(next(&mut rx).await.text, "hello");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"ok \xff\n").unwrap();

        let (mut rx, cancel, task) = start(&path, StartAt::Beginning).await;
        assert_eq!(next(&mut rx).await.text, "ok \u{fffd}");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let (mut rx, cancel, task) = start(&path, StartAt::End).await;
        append(&path, "a fairly long first line\n");
        assert_eq!(next(&mut rx).await.text, "a fairly long first line");

        std::fs::write(&path, "short\n").unwrap();
        assert_eq!(next(&mut rx).await.text, "short");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_follows_new_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let (mut rx, cancel, task) = start(&path, StartAt::End).await;
        append(&path, "before\n");
        assert_eq!(next(&mut rx).await.text, "before");

        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, "after\n").unwrap();
        assert_eq!(next(&mut rx).await.text, "after");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_picked_up_again() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let (mut rx, cancel, task) = start(&path, StartAt::End).await;
        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(POLL * 5).await;
        assert!(!task.is_finished());

        std::fs::write(&path, "back\n").unwrap();
        assert_eq!(next(&mut rx).await.text, "back");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_drains_old_file_and_flushes_partial_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        // Slow poll: everything below happens while the follower sleeps at EOF.
        let (mut rx, cancel, task) =
            start_with(&path, StartAt::End, Duration::from_millis(400), None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&path, "one\ntwo\npart");
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, "after\n").unwrap();

        assert_eq!(next(&mut rx).await.text, "one");
        assert_eq!(next(&mut rx).await.text, "two");
        assert_eq!(next(&mut rx).await.text, "part");
        assert_eq!(next(&mut rx).await.text, "after");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lines_written_before_removal_are_delivered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let (mut rx, cancel, task) =
            start_with(&path, StartAt::End, Duration::from_millis(400), None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&path, "last\nunfinished");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(next(&mut rx).await.text, "last");
        assert_eq!(next(&mut rx).await.text, "unfinished");

        cancel.cancel();
        task.await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_removed_file_descriptor_is_released() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.log");
        std::fs::write(&path, "").unwrap();

        let held = path.canonicalize().unwrap().to_string_lossy().into_owned();

        let (_rx, cancel, task) = start(&path, StartAt::End).await;
        tokio::time::sleep(POLL * 3).await;
        assert!(holds_fd_for(&held));

        std::fs::remove_file(&path).unwrap();
        let deadline = tokio::time::Instant::now() + WAIT;
        while holds_fd_for(&held) {
            assert!(tokio::time::Instant::now() < deadline, "descriptor still held");
            tokio::time::sleep(POLL).await;
        }
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap();
    }

    #[cfg(target_os = "linux")]
    fn holds_fd_for(path: &str) -> bool {
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
            .any(|target| target.to_string_lossy().starts_with(path))
    }

    #[tokio::test]
    async fn test_missing_timeout_ends_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let (mut rx, _cancel, task) =
            start_with(&path, StartAt::End, POLL, Some(Duration::from_millis(100))).await;
        std::fs::remove_file(&path).unwrap();

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_follower() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let (mut rx, cancel, task) = start(&path, StartAt::End).await;
        cancel.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }
}
