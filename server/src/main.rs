use clap::Parser;
use log::{error, info};
use server::config::{RoomConfig, SessionConfig};
use server::{Server, ServerConfig};
use std::time::Duration;

/// Starts the hub with settings from the command line and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "3000")]
        port: u16,
        /// Maximum concurrent connections
        #[clap(long, default_value = "1000")]
        max_connections: usize,
        /// Maximum concurrent sessions
        #[clap(long, default_value = "500")]
        max_sessions: usize,
        /// Maximum concurrent rooms
        #[clap(long, default_value = "200")]
        max_rooms: usize,
        /// Digits per session code
        #[clap(long, default_value = "4")]
        code_length: u32,
        /// Seconds a released code stays unavailable
        #[clap(long, default_value = "300")]
        code_cooldown: u64,
        /// Code generation attempts before giving up
        #[clap(long, default_value = "100")]
        code_attempts: u32,
        /// Idle seconds before a session is ended
        #[clap(long, default_value = "1800")]
        session_timeout: u64,
        /// Idle seconds before a room player is dropped
        #[clap(long, default_value = "1800")]
        player_timeout: u64,
        /// Seconds between liveness probes
        #[clap(long, default_value = "10")]
        ping_interval: u64,
        /// Seconds between idle sweeps
        #[clap(long, default_value = "60")]
        cleanup_interval: u64,
        /// Seconds between stats log lines
        #[clap(long, default_value = "300")]
        stats_interval: u64,
        /// Rate-limit window in milliseconds
        #[clap(long, default_value = "1000")]
        rate_window_ms: u64,
        /// Messages allowed per window
        #[clap(long, default_value = "200")]
        rate_limit: u32,
        /// Milliseconds between room:starting and room:started
        #[clap(long, default_value = "3000")]
        start_delay_ms: u64,
        /// Largest accepted frame in bytes
        #[clap(long, default_value = "65536")]
        max_message_size: usize,
        /// Token required to identify as admin; admin is disabled without it
        #[clap(long)]
        admin_token: Option<String>,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let defaults = RoomConfig::default();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        max_connections: args.max_connections,
        max_message_size: args.max_message_size,
        ping_interval: Duration::from_secs(args.ping_interval),
        cleanup_interval: Duration::from_secs(args.cleanup_interval),
        stats_interval: Duration::from_secs(args.stats_interval),
        rate_limit_window: Duration::from_millis(args.rate_window_ms),
        rate_limit_max_messages: args.rate_limit,
        admin_token: args.admin_token,
        sessions: SessionConfig {
            code_length: args.code_length,
            code_cooldown: Duration::from_secs(args.code_cooldown),
            max_code_attempts: args.code_attempts,
            max_sessions: args.max_sessions,
            session_timeout: Duration::from_secs(args.session_timeout),
        },
        rooms: RoomConfig {
            max_rooms: args.max_rooms,
            start_delay: Duration::from_millis(args.start_delay_ms),
            player_timeout: Duration::from_secs(args.player_timeout),
            ..defaults
        },
    };

    let server = Server::bind(config).await?;
    info!("Sensor hub ready on ws://{}", server.local_addr()?);
    let shutdown = server.shutdown_handle();
    let mut server_handle = tokio::spawn(server.run());

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped with error: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    shutdown.shutdown();
    if let Err(e) = server_handle.await {
        error!("Server task panicked: {}", e);
    }

    Ok(())
}
