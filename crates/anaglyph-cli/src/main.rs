//! Anaglyph CLI tools: discovery payloads, LAN discovery, colocation simulation.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anaglyph_colocation::{
    AnchorRegistry, ColocationConfig, ColocationCoordinator, ConnectionState, LoopbackNetwork,
    ManualTransport, MdnsDiscovery, PeerId, SessionDiscovery, TransportKind,
};
use anaglyph_common::DiscoveryPayload;
use anaglyph_xr::sim::{SimHeadset, SimOp, SimWorld};
use anaglyph_xr::Pose;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use glam::{Quat, Vec3};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "anaglyph")]
#[command(about = "Anaglyph colocation tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode or decode session discovery payloads
    Payload {
        #[command(subcommand)]
        action: PayloadAction,
    },

    /// Run session discovery over mDNS until Ctrl-C
    Discover {
        /// Connection state reported to the discovery state machine
        #[arg(long, value_enum, default_value_t = StateArg::Disconnected)]
        state: StateArg,
        /// Address advertised while connected
        #[arg(long)]
        lan: Option<String>,
        /// Relay session advertised while connected
        #[arg(long, conflicts_with = "lan")]
        relay: Option<String>,
        /// Report this peer as the session owner
        #[arg(long)]
        owner: bool,
        /// JSON configuration file
        #[arg(short, long, env = "ANAGLYPH_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Colocate simulated headsets over an in-process network
    Simulate {
        /// Number of headsets
        #[arg(long, default_value_t = 3)]
        peers: u32,
        /// How long to run
        #[arg(long, default_value_t = 20)]
        seconds: u64,
        /// Localization attempts that fail before any succeeds
        #[arg(long, default_value_t = 0)]
        fail_localizations: u32,
        /// JSON configuration file
        #[arg(short, long, env = "ANAGLYPH_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
enum PayloadAction {
    /// Build the payload a connected peer advertises
    Encode {
        #[arg(long, required_unless_present = "relay")]
        lan: Option<String>,
        #[arg(long, conflicts_with = "lan")]
        relay: Option<String>,
    },
    /// Parse a payload received while scanning
    Decode { payload: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StateArg {
    Disconnected,
    Connecting,
    Connected,
}

impl From<StateArg> for ConnectionState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Disconnected => ConnectionState::Disconnected,
            StateArg::Connecting => ConnectionState::Connecting,
            StateArg::Connected => ConnectionState::Connected,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ColocationConfig> {
    let mut config = match path {
        Some(path) => ColocationConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ColocationConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn main() -> Result<()> {
    anaglyph_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Payload { action } => match action {
            PayloadAction::Encode { lan, relay } => {
                let payload = match (lan, relay) {
                    (_, Some(session)) => DiscoveryPayload::relay(session),
                    (Some(address), None) => DiscoveryPayload::lan(address),
                    (None, None) => bail!("either --lan or --relay is required"),
                };
                payload.validate_target()?;
                println!("{payload}");
            }
            PayloadAction::Decode { payload } => {
                let payload: DiscoveryPayload = payload.parse()?;
                println!("strategy: {:?}", payload.strategy());
                println!("target:   {}", payload.target());
            }
        },
        Command::Discover {
            state,
            lan,
            relay,
            owner,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            runtime()?.block_on(discover(state.into(), lan, relay, owner, config))?;
        }
        Command::Simulate {
            peers,
            seconds,
            fail_localizations,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            runtime()?.block_on(simulate(
                peers,
                Duration::from_secs(seconds),
                fail_localizations,
                config,
            ))?;
        }
        Command::Version => {
            println!("anaglyph {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

async fn discover(
    state: ConnectionState,
    lan: Option<String>,
    relay: Option<String>,
    owner: bool,
    config: ColocationConfig,
) -> Result<()> {
    let transport = match relay {
        Some(session) => {
            let transport = ManualTransport::new(TransportKind::Relay, lan.unwrap_or_default());
            transport.set_session_identifier(Some(session));
            transport
        }
        None => ManualTransport::new(
            TransportKind::Direct,
            lan.unwrap_or_else(|| "127.0.0.1".into()),
        ),
    };
    let transport = Arc::new(transport);
    transport.set_session_owner(owner);
    transport.set_state(state);

    let radio = Arc::new(MdnsDiscovery::new(&config.discovery.service_type, 0)?);
    info!(instance = radio.instance_name(), ?state, "mdns discovery ready");

    let discovery = Arc::new(SessionDiscovery::new(
        radio,
        transport.clone(),
        config.discovery,
    ));
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(discovery.clone().run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down discovery");
    shutdown.cancel();
    runner.await?;

    for join in transport.joins() {
        println!("join requested: {join}");
    }
    Ok(())
}

async fn simulate(
    peers: u32,
    duration: Duration,
    fail_localizations: u32,
    config: ColocationConfig,
) -> Result<()> {
    if peers == 0 {
        bail!("at least one peer is required");
    }

    let world = SimWorld::new();
    world.fail_next(SimOp::Localize, fail_localizations);
    let network = LoopbackNetwork::new();
    let shutdown = CancellationToken::new();
    let started = Instant::now();
    let mut headsets = Vec::new();
    let mut tasks = Vec::new();

    for index in 1..=peers {
        let offset = (index - 1) as f32;
        let origin = Pose::new(
            Vec3::new(offset * 1.5, 0.0, -offset),
            Quat::from_rotation_y(offset * 0.8),
        );
        let headset = SimHeadset::new(world.clone(), origin);
        let replication = network.join(PeerId(index as u64));
        let registry = Arc::new(AnchorRegistry::new(headset.clone(), config.anchor.clone()));
        let coordinator = Arc::new(ColocationCoordinator::new(
            registry.clone(),
            replication.clone(),
            headset.clone(),
            config.coordinator.clone(),
        ));

        tasks.push(tokio::spawn({
            let shutdown = shutdown.clone();
            async move { registry.track_lifecycle(replication, shutdown).await }
        }));

        let outcome = coordinator.start_colocation();
        info!(peer = index, ?outcome, "colocation started");

        tasks.push(tokio::spawn({
            let coordinator = coordinator.clone();
            let shutdown = shutdown.clone();
            async move { coordinator.run(shutdown).await }
        }));
        tasks.push(tokio::spawn({
            let shutdown = shutdown.clone();
            let mut colocated = coordinator.subscribe_colocated();
            async move {
                let reached = async { colocated.wait_for(|colocated| *colocated).await.is_ok() };
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    reached = reached => {
                        if reached {
                            println!("peer {index} colocated after {:.2?}", started.elapsed());
                        }
                    }
                }
            }
        }));

        headsets.push(headset);
    }

    tokio::time::sleep(duration).await;
    shutdown.cancel();
    for task in tasks {
        task.await?;
    }

    let sample_point = Pose::from_position(Vec3::new(0.0, 0.0, 2.0));
    let reference = headsets[0].physical_to_world(&sample_point);
    for (index, headset) in headsets.iter().enumerate().skip(1) {
        let error = headset.physical_to_world(&sample_point).distance(&reference);
        println!("peer {} residual alignment error: {error:.4} m", index + 1);
    }
    println!(
        "anchor entities: {}, shared anchors: {}",
        network.entity_count(),
        world.shared_count()
    );
    Ok(())
}
