use regex::{Captures, Regex};

/// How far a syscall reported on a single trace line got
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum CallStatus {
    /// The call returned; the value is the return code if strace printed a
    /// numeric one
    Completed(Option<i64>),
    /// The call was interrupted by output from another process and will be
    /// finished by a later `<... name resumed>` line
    Unfinished
}

/// The shape of one line of `strace -f` output
#[derive(Debug,Clone,PartialEq,Eq)]
pub enum TraceLine<'a> {
    /// `PID name(args) = RET` or `PID name(args <unfinished ...>`
    Call { pid : &'a str, syscall : &'a str, status : CallStatus },
    /// `PID <... name resumed> rest) = RET`
    Resumed { pid : &'a str, syscall : &'a str, retval : i64 },
    /// `PID +++ exited with N +++` and `PID +++ killed by SIG +++`
    Exited { pid : &'a str },
    Unrecognized
}

impl<'a> TraceLine<'a> {
    pub fn pid(&self) -> Option<&'a str> {
        match self {
            TraceLine::Call { pid, .. } => { Some(*pid) }
            TraceLine::Resumed { pid, .. } => { Some(*pid) }
            TraceLine::Exited { pid } => { Some(*pid) }
            TraceLine::Unrecognized => { None }
        }
    }
}

impl CallStatus {
    pub fn is_success(&self) -> bool {
        *self == CallStatus::Completed(Some(0))
    }
}

const UNFINISHED_MARKER : &str = "<unfinished ...>";

type Rule = for<'a> fn(&Captures<'a>, &'a str) -> TraceLine<'a>;

lazy_static::lazy_static! {
    static ref RETVAL_RE : Regex = Regex::new(r".*= (-?\d+)").unwrap();

    /// Line rules, tried in order; the first matching rule classifies the line
    static ref RULES : Vec<(Regex, Rule)> = vec![
        (Regex::new(r"^(\d+) +<\.\.\. (\w+) resumed>.*= (-?\d+)").unwrap(), resumed as Rule),
        (Regex::new(r"^(\d+) +\+\+\+ (?:exited|killed)").unwrap(), exited as Rule),
        (Regex::new(r"^(\d+) +(\w+)\(").unwrap(), call as Rule)
    ];
}

fn resumed<'a>(caps : &Captures<'a>, _line : &'a str) -> TraceLine<'a> {
    match caps[3].parse::<i64>() {
        Err(_) => { TraceLine::Unrecognized }
        Ok(retval) => {
            TraceLine::Resumed { pid : capture(caps, 1), syscall : capture(caps, 2), retval }
        }
    }
}

fn exited<'a>(caps : &Captures<'a>, _line : &'a str) -> TraceLine<'a> {
    TraceLine::Exited { pid : capture(caps, 1) }
}

fn call<'a>(caps : &Captures<'a>, line : &'a str) -> TraceLine<'a> {
    let status = if line.ends_with(UNFINISHED_MARKER) {
        CallStatus::Unfinished
    } else {
        CallStatus::Completed(return_value(line))
    };
    TraceLine::Call { pid : capture(caps, 1), syscall : capture(caps, 2), status }
}

fn capture<'a>(caps : &Captures<'a>, idx : usize) -> &'a str {
    caps.get(idx).map_or("", |m| m.as_str())
}

/// The (last) numeric return value printed on a line, if any
pub fn return_value(line : &str) -> Option<i64> {
    RETVAL_RE.captures(line).and_then(|c| c[1].parse().ok())
}

/// Classify a single line of trace output
///
/// Trailing line terminators are ignored. Lines that match no rule (signal
/// deliveries, strace diagnostics, garbage) are `Unrecognized`.
pub fn classify(raw_line : &str) -> TraceLine<'_> {
    let line = raw_line.trim_end_matches(|c : char| c == '\n' || c == '\r');
    for (rx, rule) in RULES.iter() {
        if let Some(caps) = rx.captures(line) {
            return rule(&caps, line);
        }
    }
    TraceLine::Unrecognized
}
