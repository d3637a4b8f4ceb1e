//! Fleet Simulator - synthetic tracker records over MQTT
//!
//! Publishes `{ "data": [...] }` batches on the configured transport topic,
//! the same shape the telematics platform pushes. Each simulated bus drives
//! in a straight line from a start point to a terminal, dwells there, then
//! drives back out.
//!
//! Usage:
//!   cargo run --bin fleet-sim -- --config config/dev.toml --buses 3
//!   cargo run --bin fleet-sim -- --speeding 1   # bus #1 runs at 72 km/h

use clap::Parser;
use fleet_dispatch::domain::{Coordinate, ZoneDefinition};
use fleet_dispatch::infra::Config;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleet-sim")]
#[command(about = "Publish synthetic tracker records for local testing")]
struct Args {
    /// Path to TOML configuration file (transport and zones)
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Number of simulated buses
    #[arg(long, default_value_t = 3)]
    buses: usize,

    /// Publish interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Samples per leg between start point and terminal
    #[arg(long, default_value_t = 30)]
    steps: u32,

    /// Cruising speed reported by every bus
    #[arg(long, default_value_t = 32.0)]
    speed_kmh: f64,

    /// 1-based index of a bus that reports 72 km/h instead
    #[arg(long)]
    speeding: Option<usize>,

    /// First vehicle id; buses are numbered upward from here
    #[arg(long, default_value_t = 101)]
    first_vehicle: u64,

    /// Stop after this many batches (runs until Ctrl+C by default)
    #[arg(long)]
    batches: Option<u64>,
}

/// Samples spent parked at the terminal before turning around
const DWELL_STEPS: u32 = 5;
/// Start points sit this far north-east of their terminal
const APPROACH_OFFSET_DEG: f64 = 0.01;
const SPEEDING_KMH: f64 = 72.0;

struct SimBus {
    ident: String,
    vehicle_id: String,
    origin: Coordinate,
    terminal: Coordinate,
    speed_kmh: f64,
    /// Position in the out-and-back cycle
    tick: u32,
}

impl SimBus {
    fn new(index: usize, args: &Args, zone: &ZoneDefinition) -> Self {
        let terminal = zone.representative_point;
        let spread = index as f64 * 0.002;
        let speed_kmh = if args.speeding == Some(index + 1) { SPEEDING_KMH } else { args.speed_kmh };
        Self {
            ident: format!("86{:013}", index + 1),
            vehicle_id: (args.first_vehicle + index as u64).to_string(),
            origin: Coordinate::new(
                terminal.latitude + APPROACH_OFFSET_DEG + spread,
                terminal.longitude + APPROACH_OFFSET_DEG,
            ),
            terminal,
            speed_kmh,
            // Stagger so buses don't arrive together
            tick: (index as u32 * 7) % args.steps.max(1),
        }
    }

    /// Current position and speed, then advance one sample
    fn step(&mut self, steps: u32) -> (Coordinate, f64) {
        let steps = steps.max(1);
        let cycle = steps * 2 + DWELL_STEPS;
        let t = self.tick % cycle;
        self.tick = self.tick.wrapping_add(1);

        let (fraction, speed) = if t < steps {
            (f64::from(t) / f64::from(steps), self.speed_kmh)
        } else if t < steps + DWELL_STEPS {
            (1.0, 0.0)
        } else {
            (1.0 - f64::from(t - steps - DWELL_STEPS) / f64::from(steps), self.speed_kmh)
        };

        let position = Coordinate::new(
            self.origin.latitude + (self.terminal.latitude - self.origin.latitude) * fraction,
            self.origin.longitude + (self.terminal.longitude - self.origin.longitude) * fraction,
        );
        (position, speed)
    }

    fn record(&mut self, steps: u32) -> Value {
        let (position, speed) = self.step(steps);
        json!({
            "Ident": self.ident,
            "vehicle_id": self.vehicle_id,
            "PositionLatitude": position.latitude,
            "PositionLongitude": position.longitude,
            "PositionSpeed": speed,
            "Timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);
    let zones = config.zones();
    if zones.is_empty() {
        anyhow::bail!("no zones configured");
    }

    let mut buses: Vec<SimBus> =
        (0..args.buses).map(|i| SimBus::new(i, &args, &zones[i % zones.len()])).collect();

    let mut mqtt_options = MqttOptions::new(
        format!("{}-sim", config.transport_client_id()),
        config.transport_host(),
        config.transport_port(),
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) =
        (config.transport_username(), config.transport_password())
    {
        mqtt_options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
    let mqtt_handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("sim_connected"),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "sim_mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let topic = config.transport_topic();
    info!(
        topic = %topic,
        buses = buses.len(),
        interval_ms = args.interval_ms,
        speeding = ?args.speeding,
        "sim_started"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {
                let records: Vec<Value> = buses.iter_mut().map(|b| b.record(args.steps)).collect();
                let payload = json!({ "data": records }).to_string();
                if let Err(e) = client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                    warn!(error = %e, "sim_publish_failed");
                }
                sent += 1;
                if args.batches.is_some_and(|max| sent >= max) {
                    break;
                }
            }
        }
    }

    info!(batches = sent, "sim_stopped");
    let _ = client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    mqtt_handle.abort();
    Ok(())
}
