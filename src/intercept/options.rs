use clap::{ArgAction, Parser};
use clap::builder::FalseyValueParser;
use regex::Regex;
use std::path::PathBuf;

/// The compiler pattern used when `COMPILER_REGEXP` is not set.
///
/// Patterns are matched against the executable path as strace prints it,
/// including the surrounding double quotes. Matches `cc`, `gcc`/`g++` (optionally with a target triple prefix such as
/// `arm-linux-gnueabi-gcc`), `clang`/`clang++`, each with an optional version
/// suffix like `-9` or `-10.0`.
pub const DEFAULT_COMPILER_REGEXP : &str =
    r#"^"(?:.*/)?(?:cc|(?:\S+-)?(?:gcc|g\+\+)|clang(?:\+\+)?)(?:-[\d\.]+)?"$"#;

#[derive(Debug,Parser)]
#[command(version, about)]
#[command(after_long_help="Logging is controlled with the RUST_LOG/RUST_LOG_STYLE variables as described in\nhttps://docs.rs/env_logger, or forced to debug level with INTERCEPTOR_DEBUG.")]
pub struct Options {
    /// Read a pre-recorded strace log instead of running the build under strace
    #[arg(long="trace-file", env="TRACE_FILE", value_hint=clap::ValueHint::FilePath)]
    pub trace_file : Option<PathBuf>,
    /// Enable debug output (any value other than empty, 0, false, no or off
    /// in the environment enables it too)
    #[arg(long="debug", env="INTERCEPTOR_DEBUG", action=ArgAction::SetTrue, value_parser=FalseyValueParser::new())]
    pub debug : bool,
    /// Append debug output to this file instead of stderr
    #[arg(long="debug-file", env="INTERCEPTOR_DEBUG_FILE")]
    pub debug_file : Option<PathBuf>,
    /// Regular expression selecting the executables that are compiler invocations
    #[arg(long="compiler-regexp", env="COMPILER_REGEXP", default_value=DEFAULT_COMPILER_REGEXP)]
    pub compiler_regexp : Regex,
    /// Number of analyzer processes to run concurrently (default: number of CPUs)
    #[arg(short='j', long="jobs", env="NUM_PROCESSES")]
    pub num_processes : Option<usize>,
    /// The analyzer wrapper to run for each compiler invocation (default:
    /// `ccc-analyzer` next to this executable)
    #[arg(long="analyzer", value_hint=clap::ValueHint::FilePath)]
    pub analyzer_path : Option<PathBuf>,
    /// The strace binary to trace the build with (default: `strace` from PATH)
    #[arg(long="strace")]
    pub strace_path : Option<PathBuf>,
    /// The build command to run
    #[arg(last = true)]
    pub command : Vec<String>
}

impl Options {
    /// The number of analyzer workers to start
    pub fn worker_count(&self) -> usize {
        match self.num_processes {
            Some(n) if n > 0 => { n }
            _ => { std::thread::available_parallelism().map_or(1, |n| n.get()) }
        }
    }

    /// The analyzer wrapper to invoke
    ///
    /// Without an explicit path this is `ccc-analyzer` in the directory holding
    /// the running executable, falling back to a PATH lookup.
    pub fn analyzer(&self) -> PathBuf {
        match &self.analyzer_path {
            Some(p) => { p.clone() }
            None => {
                std::env::current_exe().ok()
                    .and_then(|exe| exe.parent().map(|d| d.join("ccc-analyzer")))
                    .unwrap_or_else(|| PathBuf::from("ccc-analyzer"))
            }
        }
    }
}
