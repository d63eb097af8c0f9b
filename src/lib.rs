pub mod intercept;

use crate::intercept::options::Options;
use crate::intercept::trace::{trace_entrypoint, InterceptError};

/// Exit code used when the run is cut short by SIGINT/SIGTERM
pub const INTERRUPTED_EXIT_CODE : i32 = 130;

/// Run the interceptor and compute the process exit code
///
/// A trace that does not start with an `execve` is reported and turned into
/// exit code 1; other errors are returned to the caller.
pub fn run_interceptor(opt : Options) -> anyhow::Result<i32> {
    match trace_entrypoint(&opt) {
        Ok(ec) => { Ok(ec) }
        Err(err) => {
            match err.downcast_ref::<InterceptError>() {
                Some(InterceptError::FirstSyscallNotExec(_)) | Some(InterceptError::EmptyTrace) => {
                    eprintln!("{}", err);
                    Ok(1)
                }
                Some(InterceptError::Interrupted) => { Ok(INTERRUPTED_EXIT_CODE) }
                _ => { Err(err) }
            }
        }
    }
}
