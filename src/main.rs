mod audio;
mod checkpoint;
mod config;
mod dataset;
mod generate;
mod logging;
mod model;
mod paths;
mod session;
mod train;

use clap::Parser;

fn main() -> anyhow::Result<()> {
    if cfg!(debug_assertions) {
        eprintln!(
            "Warning: running a debug build. Training and generation can be much slower. Use `cargo run --release ...`."
        );
    }
    let cfg = config::RunConfig::parse();
    cfg.validate()?;
    let plan = checkpoint::plan_start(&cfg)?;

    let logfile = (!cfg.generate).then(|| plan.paths.logfile_path());
    logging::init(logfile.as_deref())?;

    session::run(&cfg, plan)
}
