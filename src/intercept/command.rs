use regex::Regex;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::intercept::process::{ProcessState, under_root};

/// Autoconf-style configure scripts probe the compiler with throwaway sources
/// of this name; analyzing them is a waste of time.
pub const CONFIGURE_PROBE_MARKER : &str = "conftest.c";

/// The arguments of an `execve` as printed by strace
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct ExecCall {
    pub executable : String,
    pub args : Vec<String>,
    pub env : Vec<String>
}

lazy_static::lazy_static! {
    static ref EXECVE_PREFIX_RE : Regex = Regex::new(r"^\d+ +execve\(").unwrap();
    static ref LINK_OPTION_RE : Regex = Regex::new(r"^(-[IL])(.+)$").unwrap();
}

impl ExecCall {
    /// The environment of the call as a map
    ///
    /// Entries are split at the first `=`; entries without one are dropped.
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.env.iter()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }
}

/// Parse the argument vector of an `execve` trace line
///
/// The line may be a completed call or an unfinished one; everything after the
/// environment is ignored. Without `-v` strace abbreviates the environment to
/// something like `0x7ffe... /* 23 vars */`, which yields an empty environment.
pub fn parse_execve(line : &str) -> Option<ExecCall> {
    let prefix = EXECVE_PREFIX_RE.find(line)?;
    let mut sc = Scanner { rest : &line[prefix.end()..] };
    let executable = sc.quoted()?;
    sc.expect(",")?;
    let args = sc.list()?;
    let env = match sc.expect(",") {
        None => { Vec::new() }
        Some(()) => { sc.list().unwrap_or_default() }
    };
    Some(ExecCall { executable, args, env })
}

/// A cursor over the C-like literals strace prints for syscall arguments
struct Scanner<'a> {
    rest : &'a str
}

impl<'a> Scanner<'a> {
    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn expect(&mut self, tok : &str) -> Option<()> {
        self.skip_ws();
        self.rest = self.rest.strip_prefix(tok)?;
        Some(())
    }

    /// A double quoted string with C escapes, optionally followed by the `...`
    /// strace appends to truncated strings
    fn quoted(&mut self) -> Option<String> {
        self.skip_ws();
        let body = self.rest.strip_prefix('"')?;
        let mut bytes = Vec::new();
        let mut chars = body.char_indices();
        loop {
            let (idx, c) = chars.next()?;
            match c {
                '"' => {
                    self.rest = &body[idx + 1..];
                    break;
                }
                '\\' => {
                    let (_, esc) = chars.next()?;
                    match esc {
                        'n' => { bytes.push(b'\n') }
                        't' => { bytes.push(b'\t') }
                        'r' => { bytes.push(b'\r') }
                        'v' => { bytes.push(0x0b) }
                        'f' => { bytes.push(0x0c) }
                        'x' => {
                            let hi = chars.next()?.1.to_digit(16)?;
                            let lo = chars.next()?.1.to_digit(16)?;
                            bytes.push((hi * 16 + lo) as u8);
                        }
                        '0'..='7' => {
                            let mut val = esc.to_digit(8)?;
                            let mut lookahead = chars.clone();
                            for _ in 0..2 {
                                match lookahead.next() {
                                    Some((_, d)) if d.is_digit(8) => {
                                        val = val * 8 + d.to_digit(8)?;
                                        chars = lookahead.clone();
                                    }
                                    _ => { break }
                                }
                            }
                            // strace never prints more than \377
                            bytes.push(u8::try_from(val).ok()?);
                        }
                        other => {
                            let mut buf = [0; 4];
                            bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                        }
                    }
                }
                other => {
                    let mut buf = [0; 4];
                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        if let Some(r) = self.rest.strip_prefix("...") {
            self.rest = r;
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// A bracketed list of quoted strings
    ///
    /// Truncation markers (`...`) and comments (`/* 3 entries */`) are skipped.
    fn list(&mut self) -> Option<Vec<String>> {
        self.expect("[")?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if let Some(r) = self.rest.strip_prefix(']') {
                self.rest = r;
                return Some(items);
            } else if let Some(r) = self.rest.strip_prefix(',') {
                self.rest = r;
            } else if let Some(r) = self.rest.strip_prefix("...") {
                self.rest = r;
            } else if let Some(r) = self.rest.strip_prefix("/*") {
                let end = r.find("*/")?;
                self.rest = &r[end + 2..];
            } else {
                items.push(self.quoted()?);
            }
        }
    }
}

/// Quote a word for `sh`; words made only of safe characters are left alone
pub fn quote(word : &str) -> String {
    shell_escape::escape(Cow::Borrowed(word)).into_owned()
}

/// Rewrite a compiler argument so that it refers to the same file outside of
/// the chroot
///
/// Absolute paths are moved under the root, as are the directory values of
/// `-I` and `-L`.
pub fn reroot_argument(arg : &str, root_dir : &str) -> String {
    if arg.starts_with('/') {
        return under_root(arg, root_dir);
    }
    match LINK_OPTION_RE.captures(arg) {
        None => { arg.to_owned() }
        Some(caps) => { format!("{}{}", &caps[1], reroot_argument(&caps[2], root_dir)) }
    }
}

/// Returns true if the file starts with a `#!` line
///
/// Some build systems (Android in particular) put wrapper scripts named like
/// compilers on the PATH; only the real binaries they eventually exec are
/// interesting. Unreadable files are treated as binaries.
pub fn is_script(path : &Path) -> bool {
    let mut magic = [0u8; 2];
    match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Err(_) => { false }
        Ok(()) => { &magic == b"#!" }
    }
}

/// Guess the sysroot belonging to a compiler binary
///
/// Cross toolchains are commonly laid out as `<prefix>/bin/<cc>` next to
/// `<prefix>/sysroot`. When no such directory exists the process root is used.
fn guess_sysroot(executable : &str, root_dir : &str) -> String {
    let prefix = Path::new(executable).parent().and_then(|p| p.parent())
        .map_or(String::new(), |p| p.to_string_lossy().into_owned());
    let candidate = under_root(&format!("{}/sysroot", prefix), root_dir);
    if Path::new(&candidate).exists() {
        candidate
    } else {
        root_dir.to_owned()
    }
}

/// Build the shell command that runs `analyzer` in place of the traced
/// compiler invocation
///
/// Returns `None` if the compiler turns out to be a script.
pub fn analyzer_command(analyzer : &Path, state : &ProcessState, exec : &ExecCall) -> Option<String> {
    let root_dir = &state.root_dir;
    let work_dir = state.host_work_dir();
    let sysroot = guess_sysroot(&exec.executable, root_dir);
    let compiler = under_root(&exec.executable, root_dir);

    let on_disk = if compiler.starts_with('/') {
        compiler.clone()
    } else {
        format!("{}/{}", work_dir, compiler)
    };
    if is_script(Path::new(&on_disk)) {
        return None;
    }

    let mut words : Vec<String> = exec.args.iter().skip(1)
        .map(|a| quote(&reroot_argument(a, root_dir)))
        .collect();
    words.push(String::from("-g"));
    words.push(quote(&format!("-I{}/usr/include", sysroot.trim_end_matches('/'))));

    Some(format!("cd {} && IS_INTERCEPTED=true COMPILER={} {} {}",
                 quote(&work_dir),
                 quote(&compiler),
                 quote(&analyzer.to_string_lossy()),
                 words.join(" ")))
}
