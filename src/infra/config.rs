//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! The API token may also come from the FLEET_API_TOKEN environment variable,
//! which takes precedence over the file.

use crate::domain::zone::{default_zones, Coordinate, ZoneDefinition};
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

const API_TOKEN_ENV: &str = "FLEET_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_api_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_channel() -> String {
    "flespi-data".to_string()
}

fn default_event() -> String {
    "FlespiDataReceived".to_string()
}

fn default_client_id() -> String {
    "fleet-dispatch".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: String,
    /// Delay before a published fleet snapshot is written
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: default_storage_dir(), debounce_ms: default_debounce_ms() }
    }
}

fn default_storage_dir() -> String {
    "data".to_string()
}

fn default_debounce_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_overspeed_threshold")]
    pub overspeed_threshold_kmh: f64,
    #[serde(default = "default_zone_tolerance")]
    pub zone_tolerance_deg: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            overspeed_threshold_kmh: default_overspeed_threshold(),
            zone_tolerance_deg: default_zone_tolerance(),
        }
    }
}

fn default_overspeed_threshold() -> f64 {
    50.0
}

fn default_zone_tolerance() -> f64 {
    1e-4
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrailConfig {
    #[serde(default = "default_trail_max_points")]
    pub max_points: usize,
    #[serde(default)]
    pub dedupe_consecutive: bool,
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self { max_points: default_trail_max_points(), dedupe_consecutive: false }
    }
}

fn default_trail_max_points() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Minimum time a bus must stay on alley before it can be dispatched (0 = off)
    #[serde(default)]
    pub alley_interval_secs: u64,
    /// Background roster sync period (0 = off)
    #[serde(default = "default_roster_sync_secs")]
    pub roster_sync_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { alley_interval_secs: 0, roster_sync_secs: default_roster_sync_secs() }
    }
}

fn default_roster_sync_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { settle_delay_ms: default_settle_delay_ms() }
    }
}

fn default_settle_delay_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub name: String,
    pub representative: Coordinate,
    pub boundary: Vec<Coordinate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub api: ApiConfig,
    pub transport: TransportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub trail: TrailConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    /// Tracker ident -> vehicle id, for trackers that don't report one
    #[serde(default)]
    pub trackers: BTreeMap<String, String>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    api_base_url: String,
    api_token: Option<String>,
    api_timeout_ms: u64,
    transport_host: String,
    transport_port: u16,
    transport_channel: String,
    transport_event: String,
    transport_client_id: String,
    transport_username: Option<String>,
    transport_password: Option<String>,
    storage_dir: String,
    persistence_debounce_ms: u64,
    overspeed_threshold_kmh: f64,
    zone_tolerance_deg: f64,
    trail_max_points: usize,
    trail_dedupe_consecutive: bool,
    alley_interval_secs: u64,
    roster_sync_secs: u64,
    refresh_settle_delay_ms: u64,
    metrics_interval_secs: u64,
    zones: Vec<ZoneDefinition>,
    tracker_vehicles: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: "default".to_string(),
            api_base_url: "http://localhost:8000".to_string(),
            api_token: env::var(API_TOKEN_ENV).ok(),
            api_timeout_ms: default_api_timeout_ms(),
            transport_host: "localhost".to_string(),
            transport_port: 1883,
            transport_channel: default_channel(),
            transport_event: default_event(),
            transport_client_id: default_client_id(),
            transport_username: None,
            transport_password: None,
            storage_dir: default_storage_dir(),
            persistence_debounce_ms: default_debounce_ms(),
            overspeed_threshold_kmh: default_overspeed_threshold(),
            zone_tolerance_deg: default_zone_tolerance(),
            trail_max_points: default_trail_max_points(),
            trail_dedupe_consecutive: false,
            alley_interval_secs: 0,
            roster_sync_secs: default_roster_sync_secs(),
            refresh_settle_delay_ms: default_settle_delay_ms(),
            metrics_interval_secs: default_metrics_interval(),
            zones: default_zones(),
            tracker_vehicles: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        // An empty [[zones]] list keeps the built-in terminals
        let zones = if toml_config.zones.is_empty() {
            default_zones()
        } else {
            toml_config
                .zones
                .into_iter()
                .map(|z| ZoneDefinition::new(z.name, z.representative, z.boundary))
                .collect()
        };

        Ok(Self {
            config_file: path.display().to_string(),
            api_base_url: toml_config.api.base_url.trim_end_matches('/').to_string(),
            api_token: env::var(API_TOKEN_ENV).ok().or(toml_config.api.token),
            api_timeout_ms: toml_config.api.timeout_ms,
            transport_host: toml_config.transport.host,
            transport_port: toml_config.transport.port,
            transport_channel: toml_config.transport.channel,
            transport_event: toml_config.transport.event,
            transport_client_id: toml_config.transport.client_id,
            transport_username: toml_config.transport.username,
            transport_password: toml_config.transport.password,
            storage_dir: toml_config.storage.dir,
            persistence_debounce_ms: toml_config.storage.debounce_ms,
            overspeed_threshold_kmh: toml_config.detection.overspeed_threshold_kmh,
            zone_tolerance_deg: toml_config.detection.zone_tolerance_deg,
            trail_max_points: toml_config.trail.max_points,
            trail_dedupe_consecutive: toml_config.trail.dedupe_consecutive,
            alley_interval_secs: toml_config.dispatch.alley_interval_secs,
            roster_sync_secs: toml_config.dispatch.roster_sync_secs,
            refresh_settle_delay_ms: toml_config.refresh.settle_delay_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            zones,
            tracker_vehicles: toml_config.trackers,
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn transport_host(&self) -> &str {
        &self.transport_host
    }

    pub fn transport_port(&self) -> u16 {
        self.transport_port
    }

    pub fn transport_channel(&self) -> &str {
        &self.transport_channel
    }

    pub fn transport_event(&self) -> &str {
        &self.transport_event
    }

    /// MQTT topic carrying the channel's events
    pub fn transport_topic(&self) -> String {
        format!("{}/{}", self.transport_channel, self.transport_event)
    }

    pub fn transport_client_id(&self) -> &str {
        &self.transport_client_id
    }

    pub fn transport_username(&self) -> Option<&str> {
        self.transport_username.as_deref()
    }

    pub fn transport_password(&self) -> Option<&str> {
        self.transport_password.as_deref()
    }

    pub fn storage_dir(&self) -> &str {
        &self.storage_dir
    }

    pub fn persistence_debounce(&self) -> Duration {
        Duration::from_millis(self.persistence_debounce_ms)
    }

    pub fn overspeed_threshold_kmh(&self) -> f64 {
        self.overspeed_threshold_kmh
    }

    pub fn zone_tolerance_deg(&self) -> f64 {
        self.zone_tolerance_deg
    }

    pub fn trail_max_points(&self) -> usize {
        self.trail_max_points
    }

    pub fn trail_dedupe_consecutive(&self) -> bool {
        self.trail_dedupe_consecutive
    }

    pub fn alley_interval(&self) -> Duration {
        Duration::from_secs(self.alley_interval_secs)
    }

    pub fn roster_sync_secs(&self) -> u64 {
        self.roster_sync_secs
    }

    pub fn refresh_settle_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_settle_delay_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn zones(&self) -> &[ZoneDefinition] {
        &self.zones
    }

    /// Vehicle a tracker is mounted on, if configured
    pub fn tracker_vehicle(&self, tracker_ident: &str) -> Option<&str> {
        self.tracker_vehicles.get(tracker_ident).map(String::as_str)
    }

    /// Builder method to map a tracker to a vehicle
    pub fn with_tracker_vehicle(mut self, tracker_ident: &str, vehicle_id: &str) -> Self {
        self.tracker_vehicles.insert(tracker_ident.to_string(), vehicle_id.to_string());
        self
    }

    /// Builder method to set the refresh settle delay
    pub fn with_settle_delay_ms(mut self, ms: u64) -> Self {
        self.refresh_settle_delay_ms = ms;
        self
    }

    /// Builder method to set the alley interval
    pub fn with_alley_interval_secs(mut self, secs: u64) -> Self {
        self.alley_interval_secs = secs;
        self
    }

    /// Builder method to set the roster sync period
    pub fn with_roster_sync_secs(mut self, secs: u64) -> Self {
        self.roster_sync_secs = secs;
        self
    }

    /// Builder method to set the trail bound
    pub fn with_trail_max_points(mut self, max_points: usize) -> Self {
        self.trail_max_points = max_points;
        self
    }
}
