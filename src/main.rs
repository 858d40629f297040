use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use etbus::protocol::MessageType;
use etbus::transport::MulticastTransport;
use etbus::{Config, Daemon, DeliveryEvent, DeviceNode, Envelope, Hub, NodeIdentity, Payload};

/// ET-Bus - multicast device bus hub
#[derive(Parser)]
#[command(name = "etbus", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: ~/.config/etbus/config.toml)
    #[arg(long, env = "ETBUS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Multicast group
    #[arg(long, global = true)]
    group: Option<Ipv4Addr>,

    /// Multicast port
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub until Ctrl-C (default)
    Run,
    /// Ping the bus and list the devices that answer
    Devices {
        /// Seconds to wait for answers
        #[arg(short, long, default_value = "3")]
        wait: u64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print every message on the bus as one JSON line
    Listen {
        /// Only messages whose class starts with this prefix
        #[arg(short, long)]
        class: Option<String>,
    },
    /// Send a command and wait for the device to confirm it
    Send {
        /// Device id
        #[arg(long)]
        id: String,
        /// Endpoint class (e.g. "switch.relay")
        #[arg(long)]
        class: String,
        /// Desired state as a JSON object (e.g. '{"on":true}')
        #[arg(long)]
        payload: String,
        /// Send once without retries or confirmation
        #[arg(long)]
        no_qos: bool,
    },
    /// Act as a device that echoes commands back as state
    Emulate {
        /// Device id (default: host name)
        #[arg(long)]
        id: Option<String>,
        /// Endpoint class
        #[arg(long)]
        class: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Firmware version to announce
        #[arg(long, default_value = "0.0.0")]
        fw: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,etbus=info",
        1 => "info,etbus=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(group) = cli.group {
        config.bus.group = group;
    }
    if let Some(port) = cli.port {
        config.bus.port = port;
    }
    config.validate()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(
                group = %config.bus.group,
                port = config.bus.port,
                "starting etbus hub"
            );
            Daemon::new(&config).run().await?;
            Ok(())
        }
        Command::Devices { wait, json } => cmd_devices(&config, wait, json).await,
        Command::Listen { class } => cmd_listen(&config, class.as_deref()).await,
        Command::Send {
            id,
            class,
            payload,
            no_qos,
        } => cmd_send(&config, &id, &class, &payload, no_qos).await,
        Command::Emulate {
            id,
            class,
            name,
            fw,
        } => cmd_emulate(config, id, class, name, fw).await,
    }
}

async fn cmd_devices(config: &Config, wait: u64, json: bool) -> anyhow::Result<()> {
    let hub = Hub::multicast(config);
    hub.start()?;
    hub.ping();
    tokio::time::sleep(Duration::from_secs(wait)).await;
    let devices = hub.devices();
    hub.stop().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices answered within {wait}s");
        return Ok(());
    }

    println!(
        "{:<20} {:<16} {:<20} {:<10} {:<16} {:<8} LAST SEEN",
        "ID", "CLASS", "NAME", "FW", "ADDRESS", "ONLINE"
    );
    for dev in devices {
        println!(
            "{:<20} {:<16} {:<20} {:<10} {:<16} {:<8} {}",
            dev.id,
            dev.class.as_deref().unwrap_or("-"),
            dev.name,
            dev.firmware.as_deref().unwrap_or("-"),
            dev.last_addr,
            if dev.online { "yes" } else { "no" },
            dev.last_seen.format("%H:%M:%S"),
        );
    }
    Ok(())
}

async fn cmd_listen(config: &Config, class: Option<&str>) -> anyhow::Result<()> {
    let hub = Hub::multicast(config);
    let mut messages = hub.subscribe();
    hub.start()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = messages.recv() => {
                let Some(message) = message else { break };
                if class.is_some_and(|prefix| !message.envelope.class.starts_with(prefix)) {
                    continue;
                }
                println!("{}", serde_json::to_string(&message)?);
            }
        }
    }

    hub.stop().await;
    Ok(())
}

async fn cmd_send(
    config: &Config,
    id: &str,
    class: &str,
    payload: &str,
    no_qos: bool,
) -> anyhow::Result<()> {
    let desired = parse_payload(payload)?;
    let hub = Hub::multicast(config);

    if no_qos {
        hub.start()?;
        hub.publish_to(id, &Envelope::command(id, class, desired));
        hub.stop().await;
        println!("sent");
        return Ok(());
    }

    let mut messages = hub.subscribe();
    hub.start()?;
    let engine = hub.delivery_engine(id, class);
    let mut events = engine.subscribe();
    engine.request_delivery(desired);

    let outcome = loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else { break None };
                let env = &message.envelope;
                if env.kind == MessageType::State && env.id == id && env.class == class {
                    engine.on_observed_state(&env.payload);
                }
            }
            event = events.recv() => match event {
                Ok(DeliveryEvent::Sent { attempt }) => tracing::debug!(attempt, "command sent"),
                Ok(event @ (DeliveryEvent::Confirmed { .. } | DeliveryEvent::TimedOut { .. })) => {
                    break Some(event);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "delivery events lost");
                    break None;
                }
            },
        }
    };

    engine.stop();
    hub.stop().await;

    match outcome {
        Some(DeliveryEvent::Confirmed { attempts, elapsed }) => {
            println!(
                "confirmed after {attempts} attempt(s) in {}ms",
                elapsed.as_millis()
            );
            Ok(())
        }
        Some(DeliveryEvent::TimedOut { attempts, elapsed }) => anyhow::bail!(
            "{id}/{class} did not confirm after {attempts} attempt(s) in {}ms",
            elapsed.as_millis()
        ),
        _ => anyhow::bail!("delivery interrupted"),
    }
}

async fn cmd_emulate(
    mut config: Config,
    id: Option<String>,
    class: String,
    name: Option<String>,
    fw: String,
) -> anyhow::Result<()> {
    let id = match id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().into_owned(),
    };

    // A hub on the same host only hears us with loopback on
    config.bus.multicast_loop = true;
    let transport = Arc::new(MulticastTransport::new(config.bus.clone()));

    let mut identity = NodeIdentity::new(&id, &class).with_firmware(fw);
    if let Some(name) = name {
        identity = identity.with_name(name);
    }
    let (node, mut commands) = DeviceNode::start(identity, transport)?;
    println!("emulating {id} ({class}), Ctrl-C to stop");

    let mut state = Payload::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                println!("command: {}", serde_json::Value::Object(command.clone()));
                state.extend(command);
                node.send_state(state.clone())?;
            }
        }
    }

    node.stop().await;
    Ok(())
}

fn parse_payload(raw: &str) -> anyhow::Result<Payload> {
    match serde_json::from_str(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("payload must be a JSON object, got {other}"),
    }
}
