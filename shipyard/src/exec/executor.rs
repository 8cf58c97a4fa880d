//! Running build commands inside a merged root.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use shipyard_shared::errors::{ShipyardError, ShipyardResult};

use super::log_tail::{LogTail, strip_ansi_codes};
use super::tokenize::split_command;
use crate::util::process::exit_code_of;

pub const STDOUT_LOG: &str = "out.log";
pub const STDERR_LOG: &str = "err.log";

/// Where a command's output goes besides the tracing system.
#[derive(Clone)]
pub struct OutputSink {
    /// Directory receiving `out.log` and `err.log` (appended).
    pub log_dir: PathBuf,
    pub tail: Arc<Mutex<LogTail>>,
}

impl OutputSink {
    pub fn new(log_dir: PathBuf, tail: LogTail) -> Self {
        Self {
            log_dir,
            tail: Arc::new(Mutex::new(tail)),
        }
    }
}

/// Working directory (inside the root) and extra environment for a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootEnv {
    pub workdir: String,
    pub vars: BTreeMap<String, String>,
}

impl RootEnv {
    pub fn new(workdir: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            vars: BTreeMap::new(),
        }
    }

    pub fn with_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.vars = vars;
        self
    }

    /// Whether the process must change directory after entering the root.
    pub fn needs_cd(&self) -> bool {
        let workdir = self.workdir.trim();
        !workdir.is_empty() && workdir != "/"
    }
}

impl Default for RootEnv {
    fn default() -> Self {
        Self::new("/")
    }
}

/// Runs one command line inside a root filesystem.
///
/// Returns the exit code for any exit, zero or not; only a failure to start
/// the process is an error.
pub trait RootExecutor: Send + Sync {
    fn run_in_root(
        &self,
        root: &Path,
        env: &RootEnv,
        command: &str,
        sink: &OutputSink,
    ) -> ShipyardResult<i32>;
}

/// `chroot <root> <tokens...>`, the production executor (requires root).
#[derive(Clone, Copy, Debug, Default)]
pub struct ChrootExecutor;

impl RootExecutor for ChrootExecutor {
    fn run_in_root(
        &self,
        root: &Path,
        env: &RootEnv,
        command: &str,
        sink: &OutputSink,
    ) -> ShipyardResult<i32> {
        let tokens = tokens_of(command)?;
        run_streaming(chroot_command(root, env, &tokens), command, sink)
    }
}

pub(crate) fn tokens_of(command: &str) -> ShipyardResult<Vec<String>> {
    let tokens = split_command(command)?;
    if tokens.is_empty() {
        return Err(ShipyardError::Config("empty command".into()));
    }
    Ok(tokens)
}

/// Build the `chroot` invocation.
///
/// chroot(1) always starts in `/`, so a non-root working directory goes
/// through the root's `/bin/sh` to `cd` before exec'ing the command.
/// Environment variables pass through chroot to the command.
pub fn chroot_command(root: &Path, env: &RootEnv, tokens: &[String]) -> Command {
    let mut cmd = Command::new("chroot");
    cmd.arg(root).args(chroot_args(env, tokens)).envs(&env.vars);
    cmd
}

/// Arguments following the root in a `chroot` invocation.
pub fn chroot_args(env: &RootEnv, tokens: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(tokens.len() + 4);
    if env.needs_cd() {
        args.extend(
            ["/bin/sh", "-c", "cd \"$0\" && exec \"$@\"", env.workdir.trim()].map(String::from),
        );
    }
    args.extend(tokens.iter().cloned());
    args
}

/// Spawn `cmd` with piped output, stream both pipes into `sink`, and wait.
pub fn run_streaming(mut cmd: Command, label: &str, sink: &OutputSink) -> ShipyardResult<i32> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    tracing::info!(command = %label, "Running command");
    let mut child = cmd
        .spawn()
        .map_err(|e| ShipyardError::Spawn(format!("{}: {}", label, e)))?;

    let streams = OutputStreams::attach(&mut child, sink)?;
    let status = child.wait();
    streams.join();

    let status = status.map_err(|e| ShipyardError::Spawn(format!("wait for {}: {}", label, e)))?;
    let code = exit_code_of(&status);
    tracing::info!(command = %label, code, "Command finished");
    Ok(code)
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            Stream::Stdout => STDOUT_LOG,
            Stream::Stderr => STDERR_LOG,
        }
    }
}

/// Reader threads copying a child's stdout/stderr into the sink.
struct OutputStreams {
    threads: Vec<JoinHandle<()>>,
}

impl OutputStreams {
    fn attach(child: &mut Child, sink: &OutputSink) -> ShipyardResult<Self> {
        std::fs::create_dir_all(&sink.log_dir)?;
        let mut threads = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            threads.push(Self::spawn_reader(BufReader::new(stdout), Stream::Stdout, sink)?);
        }
        if let Some(stderr) = child.stderr.take() {
            threads.push(Self::spawn_reader(BufReader::new(stderr), Stream::Stderr, sink)?);
        }
        Ok(Self { threads })
    }

    fn open_log(sink: &OutputSink, stream: Stream) -> ShipyardResult<File> {
        let path = sink.log_dir.join(stream.file_name());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ShipyardError::Storage(format!("open {}: {}", path.display(), e)))
    }

    fn spawn_reader<R: BufRead + Send + 'static>(
        mut reader: R,
        stream: Stream,
        sink: &OutputSink,
    ) -> ShipyardResult<JoinHandle<()>> {
        let mut file = Self::open_log(sink, stream)?;
        let tail = Arc::clone(&sink.tail);

        thread::Builder::new()
            .name(format!("shipyard-build-{}", stream.name()))
            .spawn(move || {
                // a non-UTF-8 line must not stop the drain
                let mut buf = Vec::with_capacity(256);
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::error!(stream = stream.name(), "Failed to read from pipe: {}", e);
                            break;
                        }
                    }

                    if let Err(e) = file.write_all(&buf) {
                        tracing::warn!(stream = stream.name(), "Failed to append to log: {}", e);
                    }

                    let raw = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                    let line = String::from_utf8_lossy(raw);

                    let clean = strip_ansi_codes(&line);
                    match stream {
                        Stream::Stdout => tracing::debug!(target: "build:stdout", "{}", clean),
                        Stream::Stderr => tracing::warn!(target: "build:stderr", "{}", clean),
                    }
                    tail.lock().push(&clean);
                }
            })
            .map_err(|e| {
                ShipyardError::Internal(format!(
                    "Failed to spawn {} reader thread: {}",
                    stream.name(),
                    e
                ))
            })
    }

    fn join(self) {
        for handle in self.threads {
            if let Err(e) = handle.join() {
                tracing::warn!("output reader thread panicked: {:?}", e);
            }
        }
    }
}
