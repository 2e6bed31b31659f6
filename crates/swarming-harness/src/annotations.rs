//! Annotation stream for the task: a file headed by the LogDog URL that
//! collects the engine's annotations and the worker's own step markers.

use anyhow::{anyhow, Context, Result};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const FIFO_MODE: libc::mode_t = 0o666;
const CLOSE_POKE_INTERVAL: Duration = Duration::from_millis(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AnnotationSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl AnnotationSink {
    pub fn create(path: &Path, url: &str) -> Result<Self> {
        let mut file = File::create(path)
            .with_context(|| format!("create annotation sink {}", path.display()))?;
        writeln!(file, "# {}", url)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.trim_end_matches('\n').as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn build_step(&self, name: &str) -> Result<()> {
        self.write_line(&format!("@@@SEED_STEP {}@@@", name))?;
        self.write_line(&format!("@@@STEP_CURSOR {}@@@", name))?;
        self.write_line("@@@STEP_STARTED@@@")
    }

    pub fn step_link(&self, label: &str, url: &str) -> Result<()> {
        self.write_line(&format!("@@@STEP_LINK@{}@{}@@@", label, url))
    }

    pub fn step_closed(&self) -> Result<()> {
        self.write_line("@@@STEP_CLOSED@@@")
    }

    /// Closing step emitted after all engine runs.
    pub fn epilog(&self, task_url: Option<&str>) -> Result<()> {
        self.build_step("Epilog")?;
        if let Some(url) = task_url {
            self.step_link("Task results", url)?;
        }
        self.step_closed()
    }
}

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| anyhow!("fifo path contains a NUL byte: {}", path.display()))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("mkfifo {}", path.display()));
    }
    Ok(())
}

/// Drains a named pipe into an annotation sink. The pipe is reopened after
/// each writer goes away so that several engine runs can share it.
pub struct FifoCopier {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FifoCopier {
    pub fn start(sink: AnnotationSink, path: &Path) -> Result<Self> {
        mkfifo(path)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_seen = stop.clone();
        let fifo = path.to_path_buf();
        let handle = thread::spawn(move || {
            while !stop_seen.load(Ordering::SeqCst) {
                let file = match File::open(&fifo) {
                    Ok(file) => file,
                    Err(err) => {
                        tracing::warn!(path = %fifo.display(), error = %err, "cannot open annotation fifo");
                        return;
                    }
                };
                for line in BufReader::new(file).lines() {
                    match line {
                        Ok(line) => {
                            if let Err(err) = sink.write_line(&line) {
                                tracing::warn!(error = %err, "failed to copy annotation line");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(path = %fifo.display(), error = %err, "annotation fifo read failed");
                            break;
                        }
                    }
                }
            }
        });
        tracing::info!(path = %path.display(), "started annotation fifo copier");
        Ok(Self {
            path: path.to_path_buf(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the copier. A reader parked in `open` is woken by briefly
    /// opening the pipe for writing.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        let started = Instant::now();
        while !handle.is_finished() && started.elapsed() < CLOSE_TIMEOUT {
            let _ = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path);
            thread::sleep(CLOSE_POKE_INTERVAL);
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            tracing::warn!(path = %self.path.display(), "annotation fifo copier did not stop");
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for FifoCopier {
    fn drop(&mut self) {
        self.close();
    }
}
