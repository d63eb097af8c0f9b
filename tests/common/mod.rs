use intercept::intercept::options::Options;
use clap::Parser;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Name of the file the fake analyzer appends its invocations to
pub static ANALYZER_LOG : &'static str = "analyzed.txt";

// Write an analyzer stand-in that records how it was invoked
//
// Each invocation appends one line to ANALYZER_LOG in its working directory:
// the compiler it replaces, the IS_INTERCEPTED marker, the value of $FOO, and
// its arguments.
pub fn fake_analyzer(dir : &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("fake-analyzer");
    let mut f = std::fs::File::create(&path)?;
    writeln!(f, "#!/bin/sh")?;
    writeln!(f, "echo \"$COMPILER|$IS_INTERCEPTED|$FOO|$*\" >> \"$PWD/{}\"", ANALYZER_LOG)?;
    drop(f);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

pub fn write_trace(dir : &Path, lines : &[String]) -> anyhow::Result<PathBuf> {
    let path = dir.join("build.trace");
    let mut f = std::fs::File::create(&path)?;
    for l in lines {
        writeln!(f, "{}", l)?;
    }
    Ok(path)
}

pub fn replay_options(trace : &Path, analyzer : &Path) -> Options {
    Options::parse_from(["strace-interceptor",
                         "--trace-file", &trace.to_string_lossy(),
                         "--analyzer", &analyzer.to_string_lossy(),
                         "--jobs", "2"])
}

// The lines the fake analyzer recorded in `dir`, sorted (analyzers run
// concurrently, so their order is arbitrary)
pub fn analyzer_invocations(dir : &Path) -> Vec<String> {
    let mut lines : Vec<String> = std::fs::read_to_string(dir.join(ANALYZER_LOG))
        .map(|s| s.lines().map(String::from).collect())
        .unwrap_or_default();
    lines.sort();
    lines
}
