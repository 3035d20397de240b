//! Rotating file output.
//!
//! One file is open at a time under the configured directory. Rotation
//! fires on size (checked after each write) and on age (timer); either
//! trigger can be disabled with a zero limit. Rotated files are streamed
//! through the configured compressor into `<name>.out`.

use crate::compress::Compressor;
use crate::WriterError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::fs::{self, File};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Header line at the start of every log file.
pub const VERSION_HEADER: &str = "#PBTC Log Version 1\n";

/// Ingest queue capacity; senders block when it is full.
const QUEUE: usize = 1;

#[derive(Debug)]
enum Entry {
    Line(String),
    Raw(Vec<u8>),
}

/// Settings for a [`FileWriter`].
pub struct FileWriterOptions {
    /// Directory the log files are created in.
    pub path: PathBuf,
    /// Rotate once this many bytes are in the current file; 0 disables.
    pub size_limit: u64,
    /// Rotate once the current file is this old; zero disables.
    pub age_limit: Duration,
    /// Compressor applied to rotated files; `None` skips compression.
    pub compressor: Option<Box<dyn Compressor>>,
}

impl std::fmt::Debug for FileWriterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriterOptions")
            .field("path", &self.path)
            .field("size_limit", &self.size_limit)
            .field("age_limit", &self.age_limit)
            .field("compressed", &self.compressor.is_some())
            .finish()
    }
}

pub struct FileWriter {
    tx: mpsc::Sender<Entry>,
    sig: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    done: AtomicBool,
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter").finish_non_exhaustive()
    }
}

impl FileWriter {
    /// Create the output directory, open the first log file and launch
    /// the write loop.
    pub fn open(options: FileWriterOptions) -> Result<Self, WriterError> {
        let FileWriterOptions {
            path,
            size_limit,
            age_limit,
            compressor,
        } = options;
        fs::create_dir_all(&path)?;

        let mut log = LogFile {
            dir: path,
            size_limit,
            compressor,
            current: None,
        };
        log.rotate()?;

        let (tx, rx) = mpsc::channel(QUEUE);
        let (sig, sig_rx) = watch::channel(false);
        let task = tokio::spawn(write_loop(log, rx, sig_rx, age_limit));

        Ok(Self {
            tx,
            sig,
            task: Mutex::new(Some(task)),
            done: AtomicBool::new(false),
        })
    }

    /// Stop the write loop and close the current file.
    pub async fn stop(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sig.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl pbtc_recorder::Writer for FileWriter {
    async fn line(&self, line: String) {
        let _ = self.tx.send(Entry::Line(line)).await;
    }

    async fn bytes(&self, payload: Vec<u8>) {
        let _ = self.tx.send(Entry::Raw(payload)).await;
    }
}

// ---------------------------------------------------------------------------
// Write loop
// ---------------------------------------------------------------------------

async fn write_loop(
    mut log: LogFile,
    mut rx: mpsc::Receiver<Entry>,
    mut sig: watch::Receiver<bool>,
    age_limit: Duration,
) {
    let timed = age_limit > Duration::ZERO;
    let sleep = tokio::time::sleep(if timed {
        age_limit
    } else {
        Duration::from_secs(u64::MAX / 4)
    });
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = sig.changed() => {
                // Drain anything already queued before closing.
                while let Ok(entry) = rx.try_recv() {
                    if let Err(e) = log.write(&entry) {
                        tracing::error!("could not write log file: {}", e);
                    }
                }
                break;
            }

            _ = &mut sleep, if timed => {
                if let Err(e) = log.rotate() {
                    tracing::warn!("could not rotate log file: {}", e);
                }
                sleep.as_mut().reset(Instant::now() + age_limit);
            }

            entry = rx.recv() => {
                let Some(entry) = entry else { break };
                if let Err(e) = log.write(&entry) {
                    tracing::error!("could not write log file: {}", e);
                }
            }
        }
    }

    log.close();
    tracing::debug!("file writer stopped");
}

// ---------------------------------------------------------------------------
// The file itself
// ---------------------------------------------------------------------------

struct LogFile {
    dir: PathBuf,
    size_limit: u64,
    compressor: Option<Box<dyn Compressor>>,
    current: Option<Active>,
}

struct Active {
    file: File,
    path: PathBuf,
    written: u64,
}

impl LogFile {
    fn write(&mut self, entry: &Entry) -> std::io::Result<()> {
        let active = match self.current.as_mut() {
            Some(active) => active,
            None => return Ok(()), // rotation failed earlier; drop quietly
        };

        match entry {
            Entry::Line(line) => {
                active.file.write_all(line.as_bytes())?;
                active.file.write_all(b"\n")?;
                active.written += line.len() as u64 + 1;
            }
            Entry::Raw(payload) => {
                active.file.write_all(payload)?;
                active.written += payload.len() as u64;
            }
        }

        if self.size_limit > 0 && self.current.as_ref().map_or(0, |a| a.written) >= self.size_limit
        {
            self.rotate()?;
        }
        Ok(())
    }

    /// Open a fresh file with the version header, compress and close the
    /// previous one, then swap.
    fn rotate(&mut self) -> std::io::Result<()> {
        // Nanosecond stamp: size rotation can fire more than once per
        // second, and every rotation needs a distinct file name.
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let path = self.dir.join(format!("{}.txt", stamp));
        let mut file = File::create(&path)?;
        file.write_all(VERSION_HEADER.as_bytes())?;

        if let Some(old) = self.current.take() {
            self.retire(old);
        }

        self.current = Some(Active {
            file,
            path,
            written: VERSION_HEADER.len() as u64,
        });
        Ok(())
    }

    fn retire(&mut self, mut old: Active) {
        if let Err(e) = old.file.flush() {
            tracing::warn!("could not flush {} on rotate: {}", old.path.display(), e);
        }
        drop(old.file);

        let Some(comp) = self.compressor.as_ref() else {
            return;
        };

        let result = (|| -> std::io::Result<()> {
            let mut input = File::open(&old.path)?;
            let mut out_path = old.path.clone().into_os_string();
            out_path.push(".out");
            let mut output = File::create(PathBuf::from(out_path))?;
            comp.compress(&mut input, &mut output)?;
            Ok(())
        })();

        if let Err(e) = result {
            tracing::warn!("could not compress {}: {}", old.path.display(), e);
        }
    }

    /// Flush and close the current file without compressing it; only
    /// rotation hands files to the compressor.
    fn close(&mut self) {
        if let Some(mut old) = self.current.take() {
            if let Err(e) = old.file.flush() {
                tracing::warn!("could not flush {} on close: {}", old.path.display(), e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Lz4Compressor;
    use pbtc_recorder::Writer as _;
    use std::io::Read;
    use tempfile::TempDir;

    fn txt_files(dir: &TempDir) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "txt"))
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_size_rotation() {
        let dir = TempDir::new().unwrap();
        let writer = FileWriter::open(FileWriterOptions {
            path: dir.path().to_path_buf(),
            size_limit: 1024,
            age_limit: Duration::ZERO,
            compressor: None,
        })
        .unwrap();

        // 100 lines of 49 chars + newline = 5000 bytes.
        for i in 0..100 {
            writer.line(format!("{:049}", i)).await;
        }
        writer.stop().await;

        let files = txt_files(&dir);
        assert!(
            files.len() >= 5,
            "expected >= 4 rotated files plus the current one, got {}",
            files.len()
        );

        let mut total = 0u64;
        for path in &files {
            let contents = fs::read_to_string(path).unwrap();
            assert!(
                contents.starts_with(VERSION_HEADER),
                "{} lacks the version header",
                path.display()
            );
            let len = contents.len() as u64;
            assert!(
                len <= 1024 + 64,
                "{} grew past the size limit: {} bytes",
                path.display(),
                len
            );
            total += len - VERSION_HEADER.len() as u64;
        }
        assert_eq!(total, 5000, "no payload bytes lost across rotations");
    }

    #[tokio::test]
    async fn test_age_rotation() {
        let dir = TempDir::new().unwrap();
        let writer = FileWriter::open(FileWriterOptions {
            path: dir.path().to_path_buf(),
            size_limit: 0,
            age_limit: Duration::from_millis(50),
            compressor: None,
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        writer.stop().await;

        let files = txt_files(&dir);
        assert!(files.len() >= 3, "age timer should have rotated, got {}", files.len());
        for path in &files {
            assert_eq!(fs::read_to_string(path).unwrap(), VERSION_HEADER);
        }
    }

    #[tokio::test]
    async fn test_rotation_compresses_old_file() {
        let dir = TempDir::new().unwrap();
        let writer = FileWriter::open(FileWriterOptions {
            path: dir.path().to_path_buf(),
            size_limit: 256,
            age_limit: Duration::ZERO,
            compressor: Some(Box::new(Lz4Compressor)),
        })
        .unwrap();

        for i in 0..20 {
            writer.line(format!("record number {:040}", i)).await;
        }
        writer.stop().await;

        let outs: Vec<PathBuf> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".txt.out"))
            .collect();
        assert!(!outs.is_empty(), "rotation should produce .out files");

        for out in outs {
            let txt = PathBuf::from(out.to_string_lossy().trim_end_matches(".out").to_string());
            let plain = fs::read(&txt).unwrap();

            let mut decoder = lz4_flex::frame::FrameDecoder::new(File::open(&out).unwrap());
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed).unwrap();
            assert_eq!(decompressed, plain, "{} is not verbatim", out.display());
        }
    }

    #[tokio::test]
    async fn test_zero_limits_never_rotate() {
        let dir = TempDir::new().unwrap();
        let writer = FileWriter::open(FileWriterOptions {
            path: dir.path().to_path_buf(),
            size_limit: 0,
            age_limit: Duration::ZERO,
            compressor: None,
        })
        .unwrap();

        for i in 0..50 {
            writer.line(format!("line {}", i)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.stop().await;

        assert_eq!(txt_files(&dir).len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let writer = FileWriter::open(FileWriterOptions {
            path: dir.path().to_path_buf(),
            size_limit: 0,
            age_limit: Duration::ZERO,
            compressor: None,
        })
        .unwrap();

        writer.stop().await;
        writer.stop().await;
    }
}
