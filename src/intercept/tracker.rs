// Process tracking
// ================
//
// The tracker consumes `strace -f` output one line at a time and keeps a
// model of every live traced process: where its root is (chroot) and what its
// working directory is (chdir).  Each successful exec of a compiler is turned
// into an analyzer invocation that runs in the same (rerooted) directory with
// the same arguments and environment.
//
// strace output for concurrent processes is interleaved, which shows up in
// two ways:
//
// * A syscall may be split over two lines: `PID name(args <unfinished ...>`
//   and, later, `PID <... name resumed> rest) = RET`.  The first half is kept
//   in `interrupted` until the second half tells us whether it succeeded.
//
// * The first line of a new child can appear before the line reporting the
//   fork/clone that created it (the parent's syscall has not returned yet).
//   Lines for pids we have never seen are queued in `pending` and replayed, in
//   order, as soon as the creating syscall is reported.
//
// Pending lines for a pid that is never created (e.g., a truncated trace) are
// simply never replayed.

use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::intercept::classify::{classify, CallStatus, TraceLine};
use crate::intercept::command::{analyzer_command, parse_execve, CONFIGURE_PROBE_MARKER};
use crate::intercept::dispatch::{AnalysisCommand, Dispatch};
use crate::intercept::process::ProcessState;

/// Syscalls that create a new traced process; their return value is the child pid
static FORK_SYSCALLS : &'static [&str] = &["fork", "vfork", "clone", "clone3"];

fn is_fork(syscall : &str) -> bool {
    FORK_SYSCALLS.contains(&syscall)
}

pub struct Tracker<D> {
    processes : HashMap<String, ProcessState>,
    pending : HashMap<String, Vec<String>>,
    interrupted : HashMap<String, String>,
    compiler_re : Regex,
    analyzer : PathBuf,
    dispatcher : D
}

impl<D : Dispatch> Tracker<D> {
    pub fn new(compiler_re : Regex, analyzer : &Path, dispatcher : D) -> Tracker<D> {
        Tracker { processes : HashMap::new(),
                  pending : HashMap::new(),
                  interrupted : HashMap::new(),
                  compiler_re,
                  analyzer : analyzer.to_path_buf(),
                  dispatcher }
    }

    /// Start tracking a process that was not announced by a fork (i.e., the
    /// root of the traced tree)
    pub fn register_process(&mut self, pid : &str, state : ProcessState) {
        self.processes.insert(pid.to_owned(), state);
    }

    pub fn process(&self, pid : &str) -> Option<&ProcessState> {
        self.processes.get(pid)
    }

    pub fn num_processes(&self) -> usize {
        self.processes.len()
    }

    /// The lines waiting for `pid` to be created, in arrival order
    pub fn pending_lines(&self, pid : &str) -> Option<&[String]> {
        self.pending.get(pid).map(|v| v.as_slice())
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn into_dispatcher(self) -> D {
        self.dispatcher
    }

    /// Apply one line of trace output
    pub fn handle_line(&mut self, line : &str) {
        let trace_line = classify(line);
        let pid = match trace_line.pid() {
            None => { return }
            Some(pid) => { pid }
        };

        if !self.processes.contains_key(pid) {
            self.pending.entry(pid.to_owned()).or_default().push(line.to_owned());
            return;
        }

        match trace_line {
            TraceLine::Unrecognized => {}
            TraceLine::Exited { pid } => {
                self.processes.remove(pid);
                self.interrupted.remove(pid);
            }
            TraceLine::Resumed { pid, syscall, retval } => {
                self.handle_resumed(pid, syscall, retval);
            }
            TraceLine::Call { pid, syscall, status } => {
                match status {
                    CallStatus::Unfinished => {
                        if !is_fork(syscall) {
                            self.interrupted.insert(pid.to_owned(), line.to_owned());
                        }
                    }
                    CallStatus::Completed(retval) => {
                        self.handle_completed(pid, syscall, retval, line);
                    }
                }
            }
        }
    }

    fn handle_completed(&mut self, pid : &str, syscall : &str, retval : Option<i64>, line : &str) {
        if is_fork(syscall) {
            if let Some(child) = retval.filter(|r| *r >= 0) {
                self.create_child(pid, &child.to_string());
            }
            return;
        }
        if retval != Some(0) {
            return;
        }
        match syscall {
            "execve" => { self.handle_exec(pid, line) }
            "chdir" => {
                if let Some(path) = path_argument(line) {
                    self.update(pid, |st| st.chdir(&path));
                }
            }
            "chroot" => {
                if let Some(path) = path_argument(line) {
                    self.update(pid, |st| st.chroot(&path));
                }
            }
            _ => {}
        }
    }

    /// Finish a syscall whose first half was reported earlier
    ///
    /// Forks carry everything we need on the resumed line.  For the other
    /// syscalls the stored first half is re-applied as a completed call if the
    /// call succeeded.  A failed exec of something that is not a compiler also
    /// ends tracking of the process.
    fn handle_resumed(&mut self, pid : &str, syscall : &str, retval : i64) {
        if is_fork(syscall) {
            if retval >= 0 {
                self.create_child(pid, &retval.to_string());
            }
            return;
        }
        let first_half = match self.interrupted.remove(pid) {
            None => { return }
            Some(line) => { line }
        };
        if retval == 0 {
            self.handle_completed(pid, syscall, Some(0), &first_half);
        } else if syscall == "execve" {
            let is_compiler = parse_execve(&first_half)
                .map_or(false, |call| self.is_compiler(&call.executable));
            if !is_compiler {
                self.processes.remove(pid);
            }
        }
    }

    fn create_child(&mut self, parent : &str, child : &str) {
        let state = match self.processes.get(parent) {
            None => { return }
            Some(st) => { st.clone() }
        };
        self.processes.insert(child.to_owned(), state);
        if let Some(lines) = self.pending.remove(child) {
            debug!("Replaying {} buffered lines for process {}", lines.len(), child);
            for line in lines {
                self.handle_line(&line);
            }
        }
    }

    fn handle_exec(&mut self, pid : &str, line : &str) {
        let call = match parse_execve(line) {
            None => { return }
            Some(call) => { call }
        };
        if !self.is_compiler(&call.executable) {
            return;
        }
        let state = match self.processes.get(pid) {
            None => { return }
            Some(st) => { st }
        };

        let environment = call.environment();
        debug!("Environment: {:?}", environment);
        match analyzer_command(&self.analyzer, state, &call) {
            None => {
                debug!("Compiler command {} is a script", call.executable);
            }
            Some(command) => {
                debug!("Command: {}", command);
                if command.contains(CONFIGURE_PROBE_MARKER) {
                    debug!("conftest found, omitting analysis");
                } else {
                    self.dispatcher.submit(AnalysisCommand { command, environment });
                }
            }
        }
    }

    /// Compiler patterns are written against the executable as strace prints
    /// it, i.e. in double quotes
    fn is_compiler(&self, executable : &str) -> bool {
        self.compiler_re.is_match(&format!("\"{}\"", executable))
    }

    fn update<F : FnOnce(&mut ProcessState)>(&mut self, pid : &str, f : F) {
        if let Some(st) = self.processes.get_mut(pid) {
            f(st);
        }
    }
}

lazy_static::lazy_static! {
    static ref PATH_ARGUMENT_RE : Regex = Regex::new(r#"^\d+ +\w+\("((?:[^"\\]|\\.)*)""#).unwrap();
}

/// The (first) string argument of a `chdir`/`chroot` line
fn path_argument(line : &str) -> Option<String> {
    PATH_ARGUMENT_RE.captures(line).map(|c| unescape(&c[1]))
}

fn unescape(s : &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
            }
        } else {
            out.push(c);
        }
    }
    out
}
