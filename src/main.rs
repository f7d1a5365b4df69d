use std::env;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use ride_dispatch::config::Settings;
use ride_dispatch::csv::{read_script, write_wallets};
use ride_dispatch::dispatch::ActiveDrivers;
use ride_dispatch::fare::StraightLineOracle;
use ride_dispatch::payments::InMemoryProcessor;
use ride_dispatch::{Command, Engine, Role};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into()))
        .with_writer(io::stderr)
        .init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: ride-dispatch <script.csv>");
        return ExitCode::FAILURE;
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let commands = match read_script(Path::new(&path)) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let drivers = Arc::new(ActiveDrivers::new());
    let engine = Engine::new(
        settings,
        StraightLineOracle::default(),
        InMemoryProcessor::new(),
        drivers.clone(),
    );

    let (stop, shutdown) = watch::channel(false);
    let background = engine.spawn_background(shutdown);

    let (command_sender, command_receiver) = mpsc::channel(16);
    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    // a driver joining the script is also on shift
                    if let Command::Connect {
                        user,
                        role: Role::Driver,
                    } = command
                    {
                        drivers.activate(user);
                    }
                    if command_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let _connections = engine.run(ReceiverStream::new(command_receiver)).await;

    let _ = stop.send(true);
    for task in background {
        let _ = task.await;
    }

    if let Err(e) = write_wallets(
        io::stdout().lock(),
        engine.wallets(),
        engine.platform_summary(),
    ) {
        error!("failed to write wallets: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
