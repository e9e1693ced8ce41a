use clap::{Parser, ValueEnum};
use client::{ClientError, HubClient, SensorSimulator};
use log::{info, warn};
use shared::{ClientMessage, ClientRole, GameMode, ServerMessage};
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    Display,
    Sensor,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Solo,
    Dual,
    Multiplayer,
}

impl From<Mode> for GameMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Solo => GameMode::Solo,
            Mode::Dual => GameMode::Dual,
            Mode::Multiplayer => GameMode::Multiplayer,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hub WebSocket URL
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:3000")]
    server: String,

    /// Which side of the pairing to simulate
    #[arg(short = 'r', long, value_enum, default_value = "display")]
    role: Role,

    /// Game mode for a display's session
    #[arg(short = 'm', long, value_enum, default_value = "solo")]
    mode: Mode,

    /// Session code to join as a sensor
    #[arg(short = 'c', long)]
    code: Option<String>,

    /// Requested sensor slot name
    #[arg(long)]
    slot: Option<String>,

    /// Sensor frames per second
    #[arg(long, default_value = "30")]
    rate: u32,

    /// Seconds to run before leaving; 0 runs until the session ends
    #[arg(short = 'd', long, default_value = "0")]
    duration: u64,

    /// Start the game as soon as the session is ready (display only)
    #[arg(long)]
    auto_start: bool,
}

const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting to: {}", args.server);

    let mut hub = HubClient::connect(&args.server).await?;
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));

    match args.role {
        Role::Display => run_display(&mut hub, &args, deadline).await?,
        Role::Sensor => run_sensor(&mut hub, &args, deadline).await?,
    }

    if let Err(e) = hub.close().await {
        warn!("Close handshake failed: {}", e);
    }
    Ok(())
}

fn remaining(deadline: Option<Instant>) -> Duration {
    deadline
        .map(|d| d.saturating_duration_since(Instant::now()))
        .unwrap_or(IDLE_WAIT)
}

async fn run_display(
    hub: &mut HubClient,
    args: &Args,
    deadline: Option<Instant>,
) -> Result<(), ClientError> {
    hub.identify(ClientRole::Display).await?;
    hub.send(&ClientMessage::CreateSession {
        game_type: args.mode.into(),
    })
    .await?;

    if let ServerMessage::SessionCreated {
        session_code,
        max_sensors,
        ..
    } = hub.recv_until("session:created", Duration::from_secs(5)).await?
    {
        info!(
            "Session code {} ({} sensor slot(s)); run with --role sensor --code {}",
            session_code, max_sensors, session_code
        );
    }

    let mut frames: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        let message = match hub.recv(remaining(deadline)).await {
            Ok(message) => message,
            Err(ClientError::Timeout(_)) => {
                info!("Duration elapsed, closing session");
                hub.send(&ClientMessage::CloseSession { reason: None }).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match message {
            ServerMessage::SensorConnected {
                sensor_id,
                sensor_count,
                max_sensors,
                is_ready,
                ..
            } => {
                info!("Sensor {} joined ({}/{})", sensor_id, sensor_count, max_sensors);
                if is_ready && args.auto_start {
                    hub.send(&ClientMessage::StartSession).await?;
                }
            }
            ServerMessage::SensorDisconnected { sensor_id, .. } => {
                warn!("Sensor {} left", sensor_id);
            }
            ServerMessage::SensorData { .. } => {
                frames += 1;
                if last_report.elapsed() >= Duration::from_secs(1) {
                    info!("{} sensor frames received", frames);
                    last_report = Instant::now();
                }
            }
            ServerMessage::SessionStarted { session_id } => {
                info!("Game started in {}", session_id);
            }
            ServerMessage::SessionEnded { reason, .. } => {
                info!("Session ended: {}", reason);
                return Ok(());
            }
            ServerMessage::Shutdown { reason } => {
                warn!("Hub shutting down: {}", reason);
                return Ok(());
            }
            ServerMessage::Error { error } => {
                warn!("Hub error {:?}: {}", error.code, error.message);
            }
            _ => {}
        }
    }
}

async fn run_sensor(
    hub: &mut HubClient,
    args: &Args,
    deadline: Option<Instant>,
) -> Result<(), ClientError> {
    let code = match &args.code {
        Some(code) => code.clone(),
        None => {
            warn!("--code is required for the sensor role");
            return Ok(());
        }
    };

    hub.identify(ClientRole::Sensor).await?;
    hub.send(&ClientMessage::JoinSession {
        session_code: code,
        sensor_id: args.slot.clone(),
    })
    .await?;

    match hub.recv(Duration::from_secs(5)).await? {
        ServerMessage::SessionJoined {
            sensor_id, state, ..
        } => info!("Joined as {} (session {})", sensor_id, state.as_str()),
        ServerMessage::Error { error } => {
            warn!("Join refused: {}", error.message);
            return Ok(());
        }
        other => {
            return Err(ClientError::Unexpected {
                expected: "session:joined",
                actual: other.message_type(),
            })
        }
    }

    let mut sim = SensorSimulator::new();
    let mut ticker = interval(Duration::from_secs_f64(1.0 / f64::from(args.rate.max(1))));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let stop = sleep(remaining(deadline));
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                hub.send(&ClientMessage::SensorData { data: sim.next_frame() }).await?;
            }
            result = hub.recv(Duration::from_secs(1)) => {
                match result {
                    Ok(ServerMessage::SessionEnded { reason, .. }) => {
                        info!("Session ended: {}", reason);
                        return Ok(());
                    }
                    Ok(ServerMessage::Shutdown { reason }) => {
                        warn!("Hub shutting down: {}", reason);
                        return Ok(());
                    }
                    Ok(ServerMessage::Error { error }) => {
                        warn!("Hub error {:?}: {}", error.code, error.message);
                    }
                    Ok(_) | Err(ClientError::Timeout(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            _ = &mut stop => {
                info!("Duration elapsed, leaving session");
                hub.send(&ClientMessage::LeaveSession).await?;
                return Ok(());
            }
        }
    }
}
