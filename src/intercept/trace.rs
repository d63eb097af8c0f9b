use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::intercept::classify::{classify, TraceLine};
use crate::intercept::dispatch::{print_summary, Dispatch, WorkerPool};
use crate::intercept::options::Options;
use crate::intercept::process::ProcessState;
use crate::intercept::tracker::Tracker;

#[derive(Error, Debug)]
pub enum InterceptError {
    #[error("The trace is empty")]
    EmptyTrace,
    #[error("The first traced syscall is not an execve: {0:?}")]
    FirstSyscallNotExec(String),
    #[error("Interrupted")]
    Interrupted,
    #[error("No command given")]
    NoCommandGiven,
    #[error("Error reading the trace: {0}")]
    Io(#[from] std::io::Error)
}

/// The syscalls strace is asked to report
pub const TRACED_SYSCALLS : &str = "trace=vfork,fork,clone,execve,chdir,chroot";

/// Arguments for running `command` under strace, writing the trace to `output`
pub fn strace_arguments(output : &Path, command : &[String]) -> Vec<OsString> {
    let mut args : Vec<OsString> = vec!["-f", "-v", "-s", "1000000", "-o"].into_iter().map(OsString::from).collect();
    args.push(output.as_os_str().to_owned());
    args.push(OsString::from("-e"));
    args.push(OsString::from(TRACED_SYSCALLS));
    args.push(OsString::from("-e"));
    args.push(OsString::from("signal="));
    args.extend(command.iter().map(OsString::from));
    args
}

/// Where trace lines come from
enum TraceSource {
    /// A trace recorded earlier (or being written by someone else)
    Recorded(PathBuf),
    /// strace running the build, writing into a named pipe in a private
    /// temporary directory (removed on drop)
    Live { fifo_dir : tempfile::TempDir, fifo : PathBuf, strace : Child }
}

impl TraceSource {
    fn start(opts : &Options) -> anyhow::Result<TraceSource> {
        if let Some(path) = &opts.trace_file {
            return Ok(TraceSource::Recorded(path.clone()));
        }
        if opts.command.is_empty() {
            return Err(anyhow::Error::new(InterceptError::NoCommandGiven));
        }

        let fifo_dir = tempfile::Builder::new().prefix("strace").tempdir()?;
        let fifo = fifo_dir.path().join("trace");
        mkfifo(fifo.as_path(), Mode::S_IRUSR | Mode::S_IWUSR)?;

        let strace_path = match &opts.strace_path {
            Some(p) => { p.clone() }
            None => { which::which("strace")? }
        };
        debug!("Tracing {:?} with {:?}", opts.command, strace_path);
        let strace = Command::new(strace_path)
            .args(strace_arguments(&fifo, &opts.command))
            .spawn()?;
        Ok(TraceSource::Live { fifo_dir, fifo, strace })
    }

    fn path(&self) -> &Path {
        match self {
            TraceSource::Recorded(p) => { p }
            TraceSource::Live { fifo, .. } => { fifo }
        }
    }

    /// Wait for the traced build and return its exit code
    fn finish(self) -> anyhow::Result<i32> {
        match self {
            TraceSource::Recorded(_) => { Ok(0) }
            TraceSource::Live { fifo_dir, mut strace, .. } => {
                let status = strace.wait()?;
                fifo_dir.close()?;
                Ok(status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
            }
        }
    }

    /// Stop the traced build (if we started it) and clean up
    fn abort(self) {
        if let TraceSource::Live { fifo_dir, mut strace, .. } = self {
            let _ = strace.kill();
            let _ = strace.wait();
            let _ = fifo_dir.close();
        }
    }
}

/// How often the ingestion loop checks for an interrupt while waiting for
/// trace output
const INTERRUPT_POLL : Duration = Duration::from_millis(100);

/// Read lines on a separate thread so that a blocked read (strace is quiet, or
/// the fifo is still open) never hides an interrupt from the ingestion loop
///
/// The thread stops at EOF, on the first read error, or once the receiving
/// side is gone.
fn spawn_line_reader<R>(mut reader : R) -> Receiver<std::io::Result<String>>
    where R : BufRead + Send + 'static
{
    let (sender, receiver) = bounded(1024);
    thread::spawn(move || {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let next = match reader.read_until(b'\n', &mut buf) {
                Ok(0) => { return }
                Ok(_) => { Ok(String::from_utf8_lossy(&buf).into_owned()) }
                Err(e) => { Err(e) }
            };
            let failed = next.is_err();
            if sender.send(next).is_err() || failed {
                return;
            }
        }
    });
    receiver
}

/// Feed a trace to the tracker
///
/// The first line must report the exec of the root process; that process
/// starts out with `/` as its root and `cwd` as its working directory.  The
/// `interrupted` flag is checked while waiting for each line and once more at
/// the end of the trace, since an interrupt from the terminal also ends the
/// traced build.
pub fn ingest<R, D>(reader : R,
                    tracker : &mut Tracker<D>,
                    cwd : &str,
                    interrupted : &AtomicBool) -> Result<usize, InterceptError>
    where R : BufRead + Send + 'static,
          D : Dispatch
{
    let lines = spawn_line_reader(reader);
    let mut num_lines = 0;
    loop {
        if interrupted.load(Ordering::SeqCst) {
            return Err(InterceptError::Interrupted);
        }
        let line = match lines.recv_timeout(INTERRUPT_POLL) {
            Err(RecvTimeoutError::Timeout) => { continue }
            Err(RecvTimeoutError::Disconnected) => { break }
            Ok(line) => { line? }
        };
        if num_lines == 0 {
            match classify(&line) {
                TraceLine::Call { pid, syscall : "execve", .. } => {
                    tracker.register_process(pid, ProcessState::new("/", cwd));
                }
                _ => {
                    return Err(InterceptError::FirstSyscallNotExec(line.trim_end().to_owned()));
                }
            }
        }
        tracker.handle_line(&line);
        num_lines += 1;
    }
    if interrupted.load(Ordering::SeqCst) {
        return Err(InterceptError::Interrupted);
    }
    if num_lines == 0 {
        return Err(InterceptError::EmptyTrace);
    }
    Ok(num_lines)
}

pub fn trace_entrypoint(opts : &Options) -> anyhow::Result<i32> {
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupted))?;

    let cwd = std::env::current_dir()?.to_string_lossy().into_owned();
    let analyzer = opts.analyzer();
    let source = TraceSource::start(opts)?;

    // Opening a fifo blocks until strace opens it for writing
    let trace_file = match File::open(source.path()) {
        Err(e) => {
            source.abort();
            return Err(anyhow::Error::new(e));
        }
        Ok(f) => { f }
    };

    let pool = WorkerPool::new(opts.worker_count());
    info!("Running analyzer {:?} with {} workers", analyzer, pool.size());
    let mut tracker = Tracker::new(opts.compiler_regexp.clone(), &analyzer, pool);
    let res = ingest(BufReader::new(trace_file), &mut tracker, &cwd, &interrupted);
    let pool = tracker.into_dispatcher();

    match res {
        Ok(num_lines) => {
            debug!("Processed {} trace lines", num_lines);
            let summary = pool.close_and_join();
            print_summary(&summary);
            source.finish()
        }
        Err(err) => {
            match &err {
                InterceptError::Interrupted => { warn!("Interrupted; stopping analyzers") }
                other => { debug!("Stopping analyzers after error: {}", other) }
            }
            pool.terminate();
            source.abort();
            Err(anyhow::Error::new(err))
        }
    }
}
