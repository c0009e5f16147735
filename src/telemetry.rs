//! Decision log: one JSON object per line, size-rotated, with an optional
//! separate audit stream for decisions suppressed by audit-only mode.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::RotationConfig;

pub const SCHEMA_VERSION: u32 = 1;

/// Append-only line writer that rolls `<path>` over to `<path>.1 .. <path>.N`
/// once it reaches `max_bytes`. With `compress`, backups are gzipped
/// (`<path>.1.gz ..`).
pub struct RotatingWriter {
    path: PathBuf,
    file: File,
    rotation: RotationConfig,
}

impl RotatingWriter {
    pub fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            rotation,
        })
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.size() >= limit {
                if let Err(e) = self.rotate() {
                    tracing::warn!(path = %self.path.display(), error = %e, "log rotation failed");
                }
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn size(&self) -> u64 {
        self.path.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn backup(&self, idx: usize) -> PathBuf {
        self.path.with_extension(idx.to_string())
    }

    fn gz_backup(&self, idx: usize) -> PathBuf {
        self.path.with_extension(format!("{}.gz", idx))
    }

    fn rotate(&mut self) -> io::Result<()> {
        let keep = self.rotation.keep;
        if keep > 0 {
            for idx in (1..keep).rev() {
                for (from, to) in [
                    (self.backup(idx), self.backup(idx + 1)),
                    (self.gz_backup(idx), self.gz_backup(idx + 1)),
                ] {
                    if from.exists() {
                        fs::rename(&from, to)?;
                    }
                }
            }
            fs::rename(&self.path, self.backup(1))?;
            if self.rotation.compress {
                gzip_into(&self.backup(1), &self.gz_backup(1))?;
            }
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }
}

fn gzip_into(src: &Path, dst: &Path) -> io::Result<()> {
    let data = fs::read(src)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&data)?;
    fs::write(dst, gz.finish()?)?;
    fs::remove_file(src)
}

pub type SharedWriter = Arc<Mutex<RotatingWriter>>;

/// Open a writer for `path`, logging and disabling the stream on failure.
pub fn open_shared(path: Option<&str>, rotation: &RotationConfig, what: &str) -> Option<SharedWriter> {
    let path = path?;
    match RotatingWriter::open(path, rotation.clone()) {
        Ok(w) => Some(Arc::new(Mutex::new(w))),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, stream = what, "could not open log file, stream disabled");
            None
        }
    }
}

/// Summary of a decision mirrored to tracing.
pub struct DecisionLogFields<'a> {
    pub outcome: &'a str,
    pub allow_event: bool,
    pub mode: &'a str,
    pub external_count: usize,
    pub latency_ms: u64,
    pub audit_suppressed: bool,
}

pub struct AuditLogFields<'a> {
    pub outcome: &'a str,
    pub external_count: usize,
}

#[derive(Clone, Copy)]
enum Stream {
    Decision,
    Audit,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Decision => "decision",
            Stream::Audit => "audit",
        }
    }
}

#[derive(Clone, Default)]
pub struct TelemetrySink {
    decisions: Option<SharedWriter>,
    audit: Option<SharedWriter>,
    log_stdout: bool,
    sample_n: Option<u64>,
    sample_counter: Arc<AtomicU64>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    file_size_bytes: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(
        decisions: Option<SharedWriter>,
        audit: Option<SharedWriter>,
        log_stdout: bool,
        sample_n: Option<u64>,
    ) -> Self {
        Self {
            decisions,
            audit,
            log_stdout,
            sample_n,
            ..Default::default()
        }
    }

    pub fn emit_decision(&self, record: &serde_json::Value, log: &DecisionLogFields<'_>) {
        let writer = self.decisions.as_ref();
        let wrote = self.write(record, writer, Stream::Decision);
        if (wrote || writer.is_none()) && self.sampled() {
            tracing::info!(
                target: "telemetry",
                outcome = log.outcome,
                allowEvent = log.allow_event,
                mode = log.mode,
                externalCount = log.external_count,
                latencyMs = log.latency_ms,
                auditSuppressed = log.audit_suppressed,
                "decision"
            );
        }
    }

    /// Audit records go to the audit stream, or the decision stream when no
    /// audit file is configured.
    pub fn emit_audit(&self, record: &serde_json::Value, log: &AuditLogFields<'_>) {
        let writer = self.audit.as_ref().or(self.decisions.as_ref());
        if writer.is_none() {
            tracing::warn!(outcome = log.outcome, "audit record dropped: no log file configured");
        }
        let wrote = self.write(record, writer, Stream::Audit);
        if (wrote || writer.is_none()) && self.sampled() {
            tracing::info!(
                target: "telemetry",
                wouldBlock = true,
                outcome = log.outcome,
                externalCount = log.external_count,
                "audit"
            );
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes.load(Ordering::Relaxed)
    }

    fn write(&self, record: &serde_json::Value, writer: Option<&SharedWriter>, stream: Stream) -> bool {
        let Some(writer) = writer else {
            return false;
        };
        let Ok(mut guard) = writer.lock() else {
            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match guard.write_line(&record.to_string()) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                self.file_size_bytes.store(guard.size(), Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(stream = stream.as_str(), error = %e, "failed to write log line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn sampled(&self) -> bool {
        if !self.log_stdout {
            return false;
        }
        match self.sample_n {
            Some(n) => self.sample_counter.fetch_add(1, Ordering::Relaxed) % n == 0,
            None => true,
        }
    }
}
