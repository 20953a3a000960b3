use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use sync_core::{DefaultHooks, Stepper, WorldController, TIMESTEP_MS};
use tracing::info;
use ws_transport::WsTransport;

mod config;

#[derive(Parser, Debug)]
#[command(about = "Lockstep client for a tick-driven simulation server")]
struct Args {
    /// WebSocket endpoint of the simulation server.
    #[arg(long)]
    endpoint: Option<String>,
    /// Tick increment in milliseconds for the lockstep loop.
    #[arg(long)]
    timestep_ms: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the notification-driven lockstep loop until interrupted.
    Run,
    /// Advance the simulation manually, one published tick per step.
    Step {
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Restart the server session before stepping.
        #[arg(long)]
        restart: bool,
    },
    /// Print the server's current simulation time in microseconds.
    Time,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(endpoint) = args.endpoint {
        settings.endpoint = endpoint;
    }
    if let Some(timestep_ms) = args.timestep_ms {
        settings.timestep_ms = timestep_ms;
    }

    let transport = Arc::new(WsTransport::new(&settings.endpoint)?);

    match args.command {
        Command::Run => {
            let controller = WorldController::with_timestep_ms(
                transport,
                Arc::new(DefaultHooks),
                settings.timestep_ms,
            );
            let mut events = controller.subscribe_events();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    info!("sync: {event:?}");
                }
            });
            tokio::signal::ctrl_c().await?;
            info!("interrupted at tick {}", controller.last_tick());
        }
        Command::Step { count, restart } => {
            let stepper = Stepper::new(transport);
            let first = stepper.connect().await?;
            info!("connected at tick {first}");
            if restart {
                stepper.session().restart().await?;
            }
            for _ in 0..count {
                let tick = stepper.step().await?;
                println!("{tick}");
                tokio::time::sleep(Duration::from_millis(TIMESTEP_MS as u64)).await;
            }
        }
        Command::Time => {
            let stepper = Stepper::new(transport);
            stepper.connect().await?;
            println!("{}", stepper.session().time_us().await?);
        }
    }

    Ok(())
}
