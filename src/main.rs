//! Venue AV Control operator CLI
//!
//! Usage:
//!   venue-av-control discover [<cidr|a-b>] [gain|satellite|ir|matrix]
//!   venue-av-control test <kind> <host> [port]
//!   venue-av-control gain <host> <zone> [dB]
//!   venue-av-control route <host> <in> <out>[,<out>...]
//!   venue-av-control tune <host> <major> [minor]
//!   venue-av-control key <host> <key>
//!   venue-av-control ir <host> <port> <preset>

use venue_av_control::adapters::atlas::{GainParameter, GainTarget};
use venue_av_control::adapters::directv;
use venue_av_control::adapters::itach::IrCommand;
use venue_av_control::discovery::{
    AddressRange, DiscoveryEngine, DiscoveryRequest, DriverIdentifier, Identifier,
};
use venue_av_control::registry::{InMemoryRegistry, SharedRegistry};
use venue_av_control::{bus, config, ConnectionManager, Device, DeviceId, DriverKind};

use anyhow::{anyhow, bail, Result};
use serde_json::json;
use std::env;
use std::net::IpAddr;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: venue-av-control <command>

commands:
  discover [<cidr|a-b>] [gain|satellite|ir|matrix]
  test <kind> <host> [port]
  gain <host> <zone> [dB]
  route <host> <in> <out>[,<out>...]
  tune <host> <major> [minor]
  key <host> <key>
  ir <host> <port> <preset>";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "venue_av_control=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args).await {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("error: {:#}", e);
            process::exit(1);
        }
    }
}

async fn run(args: &[String]) -> Result<serde_json::Value> {
    let Some((command, rest)) = args.split_first() else {
        bail!("{}", USAGE);
    };

    tracing::debug!(
        "venue-av-control v{} ({})",
        env!("AVC_VERSION"),
        env!("AVC_GIT_SHA")
    );
    let config = config::load_config()?;
    let registry = InMemoryRegistry::shared();
    let bus = bus::create_bus();
    let manager = ConnectionManager::new(
        registry.clone(),
        bus.clone(),
        config.driver_settings(),
        config.ir_library(),
    );

    let output = match (command.as_str(), rest) {
        ("discover", rest) if rest.len() <= 2 => {
            let mut request = DiscoveryRequest {
                multicast: config.discovery.multicast,
                ..Default::default()
            };
            for arg in rest {
                if let Ok(kind) = arg.parse::<DriverKind>() {
                    request.kind = Some(kind);
                } else {
                    request.range = Some(arg.parse::<AddressRange>()?);
                }
            }
            let engine = DiscoveryEngine::new(&config, registry.clone(), bus);
            serde_json::to_value(engine.discover(&request).await)?
        }
        ("test", [kind, host, port @ ..]) if port.len() <= 1 => {
            let kind: DriverKind = kind.parse().map_err(|e: String| anyhow!(e))?;
            let port = match port.first() {
                Some(p) => parse(p, "port")?,
                None => config.ports.for_kind(kind),
            };
            let id = attach(&config, &registry, kind, host, Some(port)).await?;
            let status = manager.test(&id).await?;
            json!({ "device": registry.get(&id).await, "status": status })
        }
        ("gain", [host, zone, value @ ..]) if value.len() <= 1 => {
            let zone: u16 = parse(zone, "zone")?;
            // Out-of-range values never reach the network
            let requested = value
                .first()
                .map(|db| -> Result<GainParameter> {
                    Ok(GainParameter::new(GainTarget::Zone, zone, parse(db, "gain")?)?)
                })
                .transpose()?;
            let id = attach(&config, &registry, DriverKind::Gain, host, None).await?;
            let parameter = match requested {
                Some(parameter) => manager.set_gain(&id, parameter).await?,
                None => manager.get_gain(&id, GainTarget::Zone, zone).await?,
            };
            json!({ "zone": parameter.channel(), "gain_db": parameter.value() })
        }
        ("route", [host, input, outputs]) => {
            let input: u16 = parse(input, "input")?;
            let outputs = outputs
                .split(',')
                .map(|o| parse::<u16>(o.trim(), "output"))
                .collect::<Result<Vec<_>>>()?;
            config.matrix.route(input, &outputs)?;
            let id = attach(&config, &registry, DriverKind::Matrix, host, None).await?;
            let route = manager.route(&id, input, &outputs).await?;
            json!({ "input": route.input(), "outputs": route.outputs() })
        }
        ("tune", [host, major, minor @ ..]) if minor.len() <= 1 => {
            let major: u16 = parse(major, "major channel")?;
            let minor = minor.first().map(|m| parse(m, "minor channel")).transpose()?;
            directv::validate_channel(major, minor)?;
            let id = attach(&config, &registry, DriverKind::Satellite, host, None).await?;
            manager.tune(&id, major, minor).await?;
            json!({ "tuned": { "major": major, "minor": minor } })
        }
        ("key", [host, key]) => {
            directv::validate_key(key)?;
            let id = attach(&config, &registry, DriverKind::Satellite, host, None).await?;
            manager.key_press(&id, key).await?;
            json!({ "key": key })
        }
        ("ir", [host, port, preset]) => {
            let port: u8 = parse(port, "IR port")?;
            let command = IrCommand::parse(preset);
            config.ir_library().prepare(port, &command)?;
            let id = attach(&config, &registry, DriverKind::Ir, host, None).await?;
            manager.send_ir(&id, port, &command).await?;
            json!({ "sent": preset, "port": port })
        }
        _ => bail!("{}", USAGE),
    };

    manager.close_all().await;
    Ok(output)
}

/// Identify the device at `host` and register it so the manager can use it.
async fn attach(
    config: &config::Config,
    registry: &SharedRegistry,
    kind: DriverKind,
    host: &str,
    port: Option<u16>,
) -> Result<DeviceId> {
    let address: IpAddr = parse(host, "host address")?;
    let port = port.unwrap_or_else(|| config.ports.for_kind(kind));

    let identifier = DriverIdentifier::new(
        &config.driver_settings(),
        config.discovery.identify_timeout(),
    );
    let device = match identifier.identify(kind, address, port).await {
        Ok(identification) => {
            Device::identified(kind, address, port, &identification, chrono::Utc::now())
        }
        Err(e) => {
            tracing::warn!("Identification of {}:{} failed: {}", address, port, e);
            Device::with_kind(DeviceId::for_endpoint(kind, address, port), address, port, kind)
        }
    };
    let id = device.id().clone();
    registry.insert(device).await;
    Ok(id)
}

fn parse<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid {}: {:?}", what, value))
}
