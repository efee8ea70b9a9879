// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Kernel OOM kill detection.
//!
//! The detector re-opens the kernel log on every tick instead of holding a
//! handle, so rotation or truncation of the source never leaves it reading a
//! stale file. Each distinct log line carrying [`OOM_MARKER`] is reported once
//! per process lifetime; the raw line bytes are the deduplication key.
//!
//! Reading happens on the blocking pool. Deduplication and enqueueing stay on
//! the async side, where the cancellation token can interrupt them.

use crate::config::{Identity, OOM_MARKER};
use crate::event::{encode, EncodedEvent, EventKind};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Log lines that have already produced an `oom` event.
#[derive(Debug, Default)]
pub struct ReportedOoms {
    lines: HashSet<Vec<u8>>,
}

impl ReportedOoms {
    pub fn is_reported(&self, line: &[u8]) -> bool {
        self.lines.contains(line)
    }

    /// Returns false if the line was already recorded.
    pub fn record(&mut self, line: Vec<u8>) -> bool {
        self.lines.insert(line)
    }
}

#[cfg(test)]
impl ReportedOoms {
    fn len(&self) -> usize {
        self.lines.len()
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Outcome of a single pass over the kernel log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub lines_read: usize,
    pub reported: usize,
}

/// Lines carrying the marker, in log order, as read by one pass.
#[derive(Debug, Default)]
struct LogPass {
    lines_read: usize,
    marked: Vec<Vec<u8>>,
    /// Read error that cut the pass short
    error: Option<io::Error>,
}

pub struct OomDetector {
    source: PathBuf,
    scan_interval: Duration,
    identity: Arc<Identity>,
    events: mpsc::Sender<EncodedEvent>,
    cancel_token: CancellationToken,
    reported: ReportedOoms,
}

impl OomDetector {
    pub fn new(
        source: PathBuf,
        scan_interval: Duration,
        identity: Arc<Identity>,
        events: mpsc::Sender<EncodedEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        OomDetector {
            source,
            scan_interval,
            identity,
            events,
            cancel_token,
            reported: ReportedOoms::default(),
        }
    }

    /// Scan the kernel log every interval until the cancellation token fires.
    ///
    /// Cancellation is checked between ticks; a scan in progress runs to the
    /// end unless it is blocked on a full queue.
    pub async fn run(mut self) {
        debug!(path = %self.source.display(), "OOM detector started");

        let mut ticker = interval(self.scan_interval);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => {
                    debug!("OOM detector stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.scan().await;
                    debug!(
                        "Scanned {} kernel log lines, reported {} new OOM kills",
                        report.lines_read, report.reported
                    );
                }
            }
        }
    }

    /// Open the kernel log, report unseen OOM lines and close it again.
    pub async fn scan(&mut self) -> ScanReport {
        let source = self.source.clone();
        // the handle is dropped at the end of the pass, whatever the outcome
        let pass = match task::spawn_blocking(move || read_log_source(&source)).await {
            Ok(Ok(pass)) => pass,
            Ok(Err(e)) => {
                error!(path = %self.source.display(), "failed to open kernel log: {e}");
                return ScanReport::default();
            }
            Err(e) => {
                error!(path = %self.source.display(), "kernel log reader failed: {e}");
                return ScanReport::default();
            }
        };
        self.report(pass).await
    }

    /// Enqueue an event for every marked line not reported yet.
    async fn report(&mut self, pass: LogPass) -> ScanReport {
        let mut report = ScanReport {
            lines_read: pass.lines_read,
            reported: 0,
        };
        if let Some(e) = &pass.error {
            error!(path = %self.source.display(), "failed to scan kernel log: {e}");
        }

        for line in pass.marked {
            if self.reported.is_reported(&line) {
                continue;
            }
            if !self.emit(encode(EventKind::Oom, &self.identity)).await {
                break;
            }
            self.reported.record(line);
            report.reported += 1;
        }

        report
    }

    /// Enqueue an event unless shutdown wins the race against a full queue.
    async fn emit(&self, event: EncodedEvent) -> bool {
        tokio::select! {
            biased;
            result = self.events.send(event) => match result {
                Ok(()) => true,
                Err(_) => {
                    warn!(event_type = %EventKind::Oom, "event queue closed, dropping event");
                    false
                }
            },
            () = self.cancel_token.cancelled() => {
                debug!(event_type = %EventKind::Oom, "shutdown requested while queue is full, dropping event");
                false
            }
        }
    }
}

fn read_log_source(path: &Path) -> io::Result<LogPass> {
    let file = open_log_source(path)?;
    Ok(read_marked_lines(BufReader::new(file)))
}

fn open_log_source(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NONBLOCK);
    }
    options.open(path)
}

fn read_marked_lines<R: BufRead>(mut reader: R) -> LogPass {
    let mut pass = LogPass::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            // non-blocking character devices signal the end of the buffer this way
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                pass.error = Some(e);
                break;
            }
        }
        pass.lines_read += 1;

        let line = trim_line_end(&buf);
        if contains_marker(line) {
            pass.marked.push(line.to_vec());
        }
    }

    pass
}

/// Drop the trailing newline, then at most one carriage return.
fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn contains_marker(line: &[u8]) -> bool {
    let marker = OOM_MARKER.as_bytes();
    line.windows(marker.len()).any(|window| window == marker)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::{Read, Write};
    use tempfile::NamedTempFile;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    const OOM_LINE: &str =
        "3,1057,2233445,-;Out of memory: Killed process 1234 (foo) total-vm:102400kB";

    fn detector(
        source: PathBuf,
        capacity: usize,
    ) -> (OomDetector, mpsc::Receiver<EncodedEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel_token = CancellationToken::new();
        let detector = OomDetector::new(
            source,
            Duration::from_millis(20),
            Arc::new(Identity::default()),
            tx,
            cancel_token.clone(),
        );
        (detector, rx, cancel_token)
    }

    fn kernel_log(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn drain(rx: &mut mpsc::Receiver<EncodedEvent>) -> Vec<EncodedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_same_line_reported_once_across_scans() {
        let log = kernel_log(&["6,1,100,-;eth0: link up", OOM_LINE]);
        let (mut detector, mut rx, _) = detector(log.path().to_path_buf(), 5);

        let first = detector.scan().await;
        assert_eq!(first, ScanReport { lines_read: 2, reported: 1 });
        let second = detector.scan().await;
        assert_eq!(second, ScanReport { lines_read: 2, reported: 0 });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Oom);
        assert!(detector.reported.is_reported(OOM_LINE.as_bytes()));
    }

    #[tokio::test]
    async fn test_distinct_lines_are_distinct_keys() {
        let log = kernel_log(&[
            "3,1057,2233445,-;Out of memory: Killed process 1234 (foo)",
            "3,1090,2299001,-;Out of memory: Killed process 1234 (foo)",
            "3,1101,2300000,-;Out of memory: Killed process 1240 (foo)",
            "6,1102,2300001,-;systemd: started foo.service",
        ]);
        let (mut detector, mut rx, _) = detector(log.path().to_path_buf(), 5);

        let report = detector.scan().await;
        assert_eq!(report.reported, 3);
        assert_eq!(drain(&mut rx).len(), 3);
        assert_eq!(detector.reported.len(), 3);
    }

    #[tokio::test]
    async fn test_lines_differing_in_invalid_utf8_are_distinct() {
        let mut log = NamedTempFile::new().unwrap();
        log.write_all(b"Killed process 1 (\xff)\nKilled process 1 (\xfe)\n")
            .unwrap();
        log.flush().unwrap();
        let (mut detector, mut rx, _) = detector(log.path().to_path_buf(), 5);

        let report = detector.scan().await;
        assert_eq!(report, ScanReport { lines_read: 2, reported: 2 });
        assert_eq!(drain(&mut rx).len(), 2);
        assert!(detector.reported.is_reported(b"Killed process 1 (\xff)"));
        assert!(detector.reported.is_reported(b"Killed process 1 (\xfe)"));
    }

    #[test]
    fn test_line_end_trimmed_once() {
        assert_eq!(trim_line_end(b"oom\n"), b"oom");
        assert_eq!(trim_line_end(b"oom\r\n"), b"oom");
        assert_eq!(trim_line_end(b"oom\r\r\n"), b"oom\r");
        // last line without a newline
        assert_eq!(trim_line_end(b"oom\r"), b"oom");
        assert_eq!(trim_line_end(b"oom"), b"oom");
    }

    #[test]
    fn test_marker_matched_on_raw_bytes() {
        assert!(contains_marker(b"\xff\xfe;Killed process 9 (x)"));
        assert!(!contains_marker(b"Killed proc\xffess 9 (x)"));
        assert!(!contains_marker(b""));
    }

    #[tokio::test]
    async fn test_duplicate_lines_in_one_scan() {
        let log = kernel_log(&[OOM_LINE, OOM_LINE]);
        let (mut detector, mut rx, _) = detector(log.path().to_path_buf(), 5);

        assert_eq!(detector.scan().await.reported, 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_lines_without_marker_are_ignored() {
        let log = kernel_log(&["6,1,1,-;Out of memory in UB 1234", "4,2,2,-;killed process"]);
        let (mut detector, mut rx, _) = detector(log.path().to_path_buf(), 5);

        let report = detector.scan().await;
        assert_eq!(report, ScanReport { lines_read: 2, reported: 0 });
        assert!(drain(&mut rx).is_empty());
        assert!(detector.reported.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_source_skips_scan() {
        let dir = tempfile::tempdir().unwrap();
        let (mut detector, mut rx, _) = detector(dir.path().join("kmsg"), 5);

        assert_eq!(detector.scan().await, ScanReport::default());
        assert!(drain(&mut rx).is_empty());
        assert!(logs_contain("failed to open kernel log"));
    }

    #[tokio::test]
    async fn test_rewritten_source_is_read_again() {
        let mut log = kernel_log(&[OOM_LINE]);
        let (mut detector, mut rx, _) = detector(log.path().to_path_buf(), 5);
        assert_eq!(detector.scan().await.reported, 1);

        writeln!(log, "3,2000,9000000,-;Out of memory: Killed process 77 (bar)").unwrap();
        log.flush().unwrap();

        let report = detector.scan().await;
        assert_eq!(report, ScanReport { lines_read: 2, reported: 1 });
        assert_eq!(drain(&mut rx).len(), 2);
    }

    /// Yields its data once, then fails every later read.
    struct FailingReader {
        data: io::Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.read(buf)?;
            if n == 0 {
                return Err(io::Error::other("device went away"));
            }
            Ok(n)
        }
    }

    #[test]
    fn test_read_error_keeps_lines_read_so_far() {
        let reader = BufReader::new(FailingReader {
            data: io::Cursor::new(format!("6,1,1,-;eth0: up\n{OOM_LINE}\n").into_bytes()),
        });

        let pass = read_marked_lines(reader);
        assert_eq!(pass.lines_read, 2);
        assert_eq!(pass.marked, vec![OOM_LINE.as_bytes().to_vec()]);
        assert!(pass.error.is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_scan_error_keeps_emitted_events() {
        let (mut detector, mut rx, _) = detector(PathBuf::from("/dev/kmsg"), 5);
        let pass = read_marked_lines(BufReader::new(FailingReader {
            data: io::Cursor::new(format!("{OOM_LINE}\n").into_bytes()),
        }));

        let report = detector.report(pass).await;
        assert_eq!(report, ScanReport { lines_read: 1, reported: 1 });
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(detector.reported.is_reported(OOM_LINE.as_bytes()));
        assert!(logs_contain("failed to scan kernel log"));
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_shutdown() {
        let log = kernel_log(&[OOM_LINE]);
        let (mut detector, _rx, cancel_token) = detector(log.path().to_path_buf(), 1);
        detector
            .events
            .send(encode(EventKind::MachineStarted, &Identity::default()))
            .await
            .unwrap();

        cancel_token.cancel();
        let report = timeout(Duration::from_secs(1), detector.scan())
            .await
            .expect("scan blocked on a full queue");

        assert_eq!(report.reported, 0);
        // not recorded, so it is not lost for good if scanning resumed
        assert!(!detector.reported.is_reported(OOM_LINE.as_bytes()));
    }

    #[tokio::test]
    async fn test_run_reports_once_and_stops_on_cancel() {
        let log = kernel_log(&[OOM_LINE]);
        let (detector, mut rx, cancel_token) = detector(log.path().to_path_buf(), 5);
        let handle = tokio::spawn(detector.run());

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind(), EventKind::Oom);

        // several more ticks over the same content
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(drain(&mut rx).is_empty());

        cancel_token.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("detector did not stop")
            .unwrap();
    }

    proptest! {
        #[test]
        fn test_each_distinct_line_recorded_once(
            // bytes that are never valid UTF-8 on their own
            lines in proptest::collection::vec(
                proptest::collection::vec(0xfdu8..=0xff, 1..4),
                0..40,
            )
        ) {
            let mut reported = ReportedOoms::default();
            let first_sightings = lines
                .iter()
                .filter(|line| reported.record((*line).clone()))
                .count();
            let distinct: HashSet<&Vec<u8>> = lines.iter().collect();
            prop_assert_eq!(first_sightings, distinct.len());
            prop_assert_eq!(reported.len(), distinct.len());
        }
    }
}
