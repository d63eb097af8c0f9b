use clap::Parser;

use intercept;
use intercept::intercept::logging::init_logging;
use intercept::intercept::options::Options;

fn main() -> anyhow::Result<()> {
    let opt = Options::parse();
    init_logging(&opt)?;
    let ec = intercept::run_interceptor(opt)?;
    std::process::exit(ec);
}
