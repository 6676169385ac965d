use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use leakpipe::config::RawConfig;
use leakpipe::pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "leakpipe")]
#[command(about = "Side-channel leakage detection trace pipeline")]
struct Args {
    /// Path to the pipeline configuration file (defaults to `leakpipe.toml`,
    /// overridable with LEAKPIPE_CONFIG).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match RawConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let pipeline = match Pipeline::build(&config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            log::error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    match pipeline.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("run failed: {e}");
            ExitCode::from(2)
        }
    }
}
