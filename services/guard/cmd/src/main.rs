//! sagiri-guard binary.
//!
//! `guard serve` runs the notification and API listeners; the other
//! subcommands are small device/admin clients against a running server.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use guard_session::{ClientConfig, ClientSession, ConnectionState, DuplicatePolicy, GuardServer};
use guard_wire::{describe, DeviceId, Frame};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod routes;

use config::GuardConfig;
use logging::GuardLogFormatter;

/// Device-management server and client
#[derive(Parser, Debug)]
#[command(name = "guard", version, about = "sagiri-guard device-management server and client")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the notification and API listeners
    Serve {
        /// Notification port (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// API port (overrides config)
        #[arg(long)]
        api_port: Option<u16>,

        /// Identifier handshake timeout, e.g. 30s
        #[arg(long)]
        handshake_timeout: Option<humantime::Duration>,

        /// Close the older connection when an identifier registers twice
        #[arg(long)]
        replace_duplicates: bool,
    },

    /// Hold a notification connection and print everything the server pushes
    Listen {
        #[arg(long)]
        device_id: String,
    },

    /// Log in over the API channel
    Login {
        #[arg(long, default_value = "admin")]
        username: String,

        #[arg(long, default_value = "admin")]
        password: String,
    },

    /// List online devices
    Users,

    /// Send one notification message and print the reply
    Send {
        #[arg(long)]
        device_id: String,

        #[arg(long)]
        message: String,

        /// How long to wait for the connection, e.g. 10s
        #[arg(long, default_value = "10s")]
        wait: humantime::Duration,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("guard={}", args.log_level).parse()?)
        .add_directive(format!("guard_session={}", args.log_level).parse()?)
        .add_directive(format!("guard_wire={}", args.log_level).parse()?);

    let formatter = GuardLogFormatter::new("guard");
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(formatter.color_enabled())
        .event_format(formatter)
        .init();

    let config = GuardConfig::load_from_file(&args.config);

    match args.command {
        Command::Serve {
            port,
            api_port,
            handshake_timeout,
            replace_duplicates,
        } => {
            let mut server_config = config.server_config()?;
            if let Some(port) = port {
                server_config.notify_addr.set_port(port);
            }
            if let Some(port) = api_port {
                server_config.api_addr.set_port(port);
            }
            if let Some(timeout) = handshake_timeout {
                server_config.handshake_timeout = timeout.into();
            }
            if replace_duplicates {
                server_config.duplicate_policy = DuplicatePolicy::Replace;
            }
            serve(server_config).await
        }
        Command::Listen { device_id } => listen(config.client_config(), device_id).await,
        Command::Login { username, password } => {
            let client = ClientSession::new(config.client_config());
            let response = client.login(&username, &password).await?;
            println!("{} {}", response.status, response.text());
            if !response.is_success() {
                bail!("login rejected");
            }
            Ok(())
        }
        Command::Users => {
            let client = ClientSession::new(config.client_config());
            for user in client.get_online_users().await? {
                println!("{}", user);
            }
            Ok(())
        }
        Command::Send {
            device_id,
            message,
            wait,
        } => send(config.client_config(), device_id, message, wait.into()).await,
    }
}

async fn serve(server_config: guard_session::ServerConfig) -> anyhow::Result<()> {
    info!(component = "server", "Starting sagiri-guard v{}", env!("CARGO_PKG_VERSION"));

    let server = GuardServer::new(server_config);
    let router = routes::build_router(server.registry(), server.fallback_handler());
    let handle = server
        .with_request_handler(std::sync::Arc::new(router))
        .start()
        .await?;

    info!(
        component = "server",
        "Notification on {}, API on {}",
        handle.notify_addr(),
        handle.api_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(component = "server", "Shutdown requested");
    handle.stop().await;
    Ok(())
}

fn print_frame(frame: Frame) {
    println!("[{}] {}", describe(frame.typ), frame.text().trim_end());
}

async fn listen(client_config: ClientConfig, device_id: String) -> anyhow::Result<()> {
    let device_id = DeviceId::new(device_id)?;
    let client = ClientSession::new(client_config).with_callback(print_frame);
    let mut state = client.subscribe_state();
    client.connect_notification(device_id).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(component = "client", "Connection {:?}", *state.borrow_and_update());
            }
        }
    }

    client.close().await;
    Ok(())
}

async fn send(
    client_config: ClientConfig,
    device_id: String,
    message: String,
    wait: Duration,
) -> anyhow::Result<()> {
    let device_id = DeviceId::new(device_id)?;
    let client = ClientSession::new(client_config);
    let mut state = client.subscribe_state();
    client.connect_notification(device_id).await;

    tokio::time::timeout(wait, async {
        while *state.borrow_and_update() != ConnectionState::Connected {
            if state.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .context("server did not accept the connection in time")?;

    let reply = client.send_and_wait(message.as_bytes()).await?;
    print_frame(reply);

    client.close().await;
    Ok(())
}
