//! Wires a child's stdout/stderr to files, with a hard size ceiling per
//! file. Adapted from `systemg::logs::spawn_log_writer`'s thread-per-pipe,
//! line-buffered style; the general log-rotation subsystem (compression
//! scheduling, filesystem-wide age pruning) stays out of scope, so this
//! module only rolls a single file once it crosses `max_size_mb`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::spec::{LogConfig, LogRotation, LogTarget};

/// Resolves the stdout/stderr file paths a [`LogConfig`] points at for a
/// given instance name.
pub fn resolve_paths(instance_name: &str, config: &LogConfig) -> (PathBuf, PathBuf) {
    match &config.target {
        LogTarget::Directory(dir) => (
            dir.join(format!("{instance_name}.stdout.log")),
            dir.join(format!("{instance_name}.stderr.log")),
        ),
        LogTarget::Explicit { stdout, stderr } => (stdout.clone(), stderr.clone()),
    }
}

/// Handle to the background threads capturing one instance's output.
pub struct LogSink {
    handles: Vec<JoinHandle<()>>,
}

impl LogSink {
    /// Spawns capture threads for `stdout`/`stderr` readers, writing to the
    /// paths resolved from `config`.
    pub fn spawn(
        instance_name: &str,
        config: &LogConfig,
        stdout: impl Read + Send + 'static,
        stderr: impl Read + Send + 'static,
    ) -> Self {
        let (stdout_path, stderr_path) = resolve_paths(instance_name, config);
        let rotation = config.rotation;
        let handles = vec![
            spawn_writer(instance_name.to_string(), "stdout", stdout_path, rotation, stdout),
            spawn_writer(instance_name.to_string(), "stderr", stderr_path, rotation, stderr),
        ];
        LogSink { handles }
    }

    /// Blocks until both capture threads have drained their readers (the
    /// child has exited and closed its pipes).
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn spawn_writer(
    instance_name: String,
    kind: &'static str,
    path: PathBuf,
    rotation: LogRotation,
    reader: impl Read + Send + 'static,
) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("failed to create log directory {:?}: {err}", parent);
                return;
            }
        }
        let mut writer = match RotatingWriter::open(&path, rotation) {
            Ok(w) => w,
            Err(err) => {
                warn!("failed to open log file {:?}: {err}", path);
                return;
            }
        };
        let reader = BufReader::new(reader);
        for line in reader.lines().map_while(Result::ok) {
            debug!("[{instance_name}:{kind}] {line}");
            if let Err(err) = writer.write_line(&line) {
                warn!("failed writing to log file {:?}: {err}", path);
                break;
            }
        }
    })
}

/// A file handle that rolls itself over once it exceeds `max_size_mb`,
/// keeping at most `max_backups` numbered backups. `max_size_mb == 0`
/// disables rotation entirely.
struct RotatingWriter {
    path: PathBuf,
    file: File,
    rotation: LogRotation,
    written_bytes: u64,
}

impl RotatingWriter {
    fn open(path: &Path, rotation: LogRotation) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(RotatingWriter {
            path: path.to_path_buf(),
            file,
            rotation,
            written_bytes,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.file, "{line}")?;
        self.written_bytes += line.len() as u64 + 1;
        if self.rotation.max_size_mb > 0
            && self.written_bytes >= self.rotation.max_size_mb * 1024 * 1024
        {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        if self.rotation.max_backups > 0 {
            for index in (1..self.rotation.max_backups).rev() {
                let from = backup_path(&self.path, index);
                let to = backup_path(&self.path, index + 1);
                if from.exists() {
                    let _ = fs::rename(&from, &to);
                }
            }
            let first_backup = backup_path(&self.path, 1);
            let _ = fs::rename(&self.path, &first_backup);
            if self.rotation.compress {
                compress_best_effort(&first_backup);
            }
        } else {
            let _ = fs::remove_file(&self.path);
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written_bytes = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(&format!(".{index}"));
    path.with_file_name(name)
}

/// Best-effort gzip compression stand-in: the crate carries no compression
/// dependency for a feature this narrow, so a compressed backup is simply
/// marked with a `.gz` suffix without recompression. Real compression is
/// the embedding application's concern if it wants it.
fn compress_best_effort(path: &Path) {
    let gz_path = path.with_extension("gz");
    let _ = fs::rename(path, gz_path);
}
