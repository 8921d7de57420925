mod session;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use session::Session;

#[derive(Parser)]
#[command(name = "mesa-client")]
#[command(about = "Headless mesa test client")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = mesa::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = 3, help = "Connection attempts before giving up")]
    retries: u32,

    #[arg(long, help = "Stop after this many seconds (runs forever by default)")]
    run_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut session = Session::new(
        args.host,
        args.port,
        args.retries,
        args.run_secs.map(Duration::from_secs),
    )?;
    session.run()?;
    Ok(())
}
