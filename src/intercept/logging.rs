use log::LevelFilter;
use std::fs::OpenOptions;

use crate::intercept::options::Options;

/// Set up `env_logger`
///
/// `RUST_LOG` works as usual; `--debug` raises this crate to debug level and
/// `--debug-file` appends all records to the given file instead of stderr.
pub fn init_logging(opts : &Options) -> anyhow::Result<()> {
    logger_builder(opts)?.try_init()?;
    Ok(())
}

fn logger_builder(opts : &Options) -> anyhow::Result<env_logger::Builder> {
    let mut builder = env_logger::Builder::from_default_env();
    if opts.debug {
        builder.filter_module(module_path!().split("::").next().unwrap_or("intercept"), LevelFilter::Debug);
    }
    if let Some(path) = &opts.debug_file {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(f)));
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use log::{Level, Log, Metadata, Record};
    use serial_test::serial;

    const TRACKER_TARGET : &str = "intercept::intercept::tracker";

    fn debug_enabled(logger : &env_logger::Logger) -> bool {
        logger.enabled(&Metadata::builder().level(Level::Debug).target(TRACKER_TARGET).build())
    }

    #[test]
    #[serial]
    fn test_debug_level() -> anyhow::Result<()> {
        std::env::remove_var("RUST_LOG");
        std::env::remove_var("INTERCEPTOR_DEBUG");
        std::env::remove_var("INTERCEPTOR_DEBUG_FILE");
        let quiet = Options::try_parse_from(["strace-interceptor"])?;
        assert!(!debug_enabled(&logger_builder(&quiet)?.build()));

        let verbose = Options::try_parse_from(["strace-interceptor", "--debug"])?;
        let logger = logger_builder(&verbose)?.build();
        assert!(debug_enabled(&logger));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Debug).target("regex").build()));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_debug_file_is_appended() -> anyhow::Result<()> {
        std::env::remove_var("RUST_LOG");
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("interceptor.log");
        std::fs::write(&path, "earlier run\n")?;

        let opts = Options::try_parse_from(["strace-interceptor", "--debug", "--debug-file",
                                             &path.to_string_lossy()])?;
        let logger = logger_builder(&opts)?.build();
        logger.log(&Record::builder()
                   .args(format_args!("Replaying 3 buffered lines for process 12"))
                   .level(Level::Debug)
                   .target(TRACKER_TARGET)
                   .build());
        logger.flush();

        let contents = std::fs::read_to_string(&path)?;
        assert!(contents.starts_with("earlier run\n"));
        assert!(contents.contains("Replaying 3 buffered lines for process 12"));
        Ok(())
    }
}
