//! rpicam CLI
//!
//! Usage:
//!   rpicam cam timelapse -d 120 --spf 10
//!   rpicam cam -s pan=cw,pause --cycle timelapse -d 60
//!   rpicam cam live -o /tmp/preview.jpg
//!   rpicam cam stream --port 10001
//!   rpicam servo move --channel 1 noon cw(45)

use anyhow::Context;
use rpicam::cli::{self, Args};
use rpicam::shutdown::setup_shutdown;

fn main() {
    let args: Args = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let cancel = setup_shutdown()?;
    cli::run(args, cancel).context("rpicam failed")?;
    Ok(())
}
