use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashSet};
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// One unit of analysis work: a shell command and the environment it expects
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct AnalysisCommand {
    pub command : String,
    pub environment : BTreeMap<String, String>
}

/// Something that accepts analysis work
///
/// Submission is fire-and-forget: implementations must not make the caller
/// wait for earlier units to finish.
pub trait Dispatch {
    fn submit(&mut self, cmd : AnalysisCommand);
}

/// Collects the submitted commands instead of running them
impl Dispatch for Vec<AnalysisCommand> {
    fn submit(&mut self, cmd : AnalysisCommand) {
        self.push(cmd);
    }
}

#[derive(Debug,Default,Clone,Copy,PartialEq,Eq)]
pub struct PoolSummary {
    pub submitted : usize,
    pub succeeded : usize,
    pub failed : usize
}

#[derive(Default)]
struct PoolCounters {
    succeeded : AtomicUsize,
    failed : AtomicUsize
}

/// State shared between the pool handle and its workers
#[derive(Default)]
struct Shared {
    cancelled : AtomicBool,
    /// Process group ids of the analyzer commands currently running
    running : Mutex<HashSet<u32>>,
    counters : PoolCounters
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A fixed number of worker threads running analysis commands from a queue
pub struct WorkerPool {
    sender : Option<Sender<AnalysisCommand>>,
    workers : Vec<thread::JoinHandle<()>>,
    shared : Arc<Shared>,
    submitted : usize
}

impl WorkerPool {
    pub fn new(size : usize) -> WorkerPool {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared::default());
        let workers = (0..size.max(1)).map(|id| {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("analyzer-{}", id))
                .spawn(move || { worker_loop(receiver, shared) })
        })
        .filter_map(|res| match res {
            Err(e) => { warn!("Unable to start analyzer worker: {}", e); None }
            Ok(handle) => { Some(handle) }
        })
        .collect();
        WorkerPool { sender : Some(sender), workers, shared, submitted : 0 }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work and wait for everything already queued to finish
    pub fn close_and_join(mut self) -> PoolSummary {
        self.shutdown(false);
        self.summary()
    }

    /// Drop queued work, kill the running analyzers and wait for the workers
    pub fn terminate(mut self) -> PoolSummary {
        self.shutdown(true);
        self.summary()
    }

    fn summary(&self) -> PoolSummary {
        PoolSummary { submitted : self.submitted,
                      succeeded : self.shared.counters.succeeded.load(Ordering::SeqCst),
                      failed : self.shared.counters.failed.load(Ordering::SeqCst) }
    }

    fn shutdown(&mut self, cancel : bool) {
        if cancel {
            self.shared.cancelled.store(true, Ordering::SeqCst);
            for pgid in self.shared.running().iter() {
                // The group may already be gone
                let _ = killpg(Pid::from_raw(*pgid as i32), Signal::SIGKILL);
            }
        }
        // Closing the channel lets the workers run dry and exit
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Analyzer worker panicked");
            }
        }
    }
}

impl Dispatch for WorkerPool {
    fn submit(&mut self, cmd : AnalysisCommand) {
        match &self.sender {
            None => { warn!("Analysis submitted to a closed pool: {}", cmd.command) }
            Some(sender) => {
                if sender.send(cmd).is_ok() {
                    self.submitted += 1;
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.shutdown(true);
        }
    }
}

fn worker_loop(receiver : Receiver<AnalysisCommand>, shared : Arc<Shared>) {
    for unit in receiver.iter() {
        if shared.cancelled.load(Ordering::SeqCst) {
            continue;
        }
        match run_analysis(&unit, &shared) {
            Err(e) => {
                shared.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!("Unable to run analyzer command '{}': {}", unit.command, e);
            }
            Ok(status) => {
                if status.success() {
                    shared.counters.succeeded.fetch_add(1, Ordering::SeqCst);
                } else {
                    shared.counters.failed.fetch_add(1, Ordering::SeqCst);
                    debug!("Analyzer command '{}' failed with {}", unit.command, status);
                }
            }
        }
    }
}

/// Run one command through `sh` in its own process group so that it can be
/// killed together with everything it spawned
fn run_analysis(unit : &AnalysisCommand, shared : &Shared) -> std::io::Result<ExitStatus> {
    let mut child = {
        let mut running = shared.running();
        let child = Command::new("sh")
            .arg("-c")
            .arg(&unit.command)
            .envs(&unit.environment)
            .process_group(0)
            .spawn()?;
        running.insert(child.id());
        child
    };
    if shared.cancelled.load(Ordering::SeqCst) {
        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    }
    let status = child.wait();
    shared.running().remove(&child.id());
    status
}

/// Log the outcome of a pool run
pub fn print_summary(summary : &PoolSummary) {
    info!("Analysis summary");
    info!(" {} analyzer commands submitted", summary.submitted);
    info!(" {} analyzer commands succeeded", summary.succeeded);
    info!(" {} analyzer commands failed", summary.failed);
}
