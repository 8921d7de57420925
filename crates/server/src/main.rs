mod config;
mod server;
mod simulation;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use server::GameServer;

#[derive(Parser)]
#[command(name = "mesa-server")]
#[command(about = "Mesa simulation server")]
struct Args {
    #[arg(short, long, default_value_t = mesa::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = 5.0, help = "Player movement speed in units/sec")]
    move_speed: f32,

    #[arg(long, help = "Stop after this many seconds (runs forever by default)")]
    run_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        port: args.port,
        move_speed: args.move_speed,
        run_for: args.run_secs.map(Duration::from_secs),
    };

    let mut server = GameServer::new(config)?;
    server.run()?;
    log::info!("server shutting down");
    Ok(())
}
