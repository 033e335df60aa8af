use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::pipeline::queue;
use crate::source::event::{Channel, NUM_CHANNELS};
use crate::source::unpack::LostHitPolicy;
use crate::spill::{
    self, macrospill, microspill, ChannelSettings, SpillSettings, DEFAULT_CLOCK_HZ,
};

/// Lowest publish port accepted; below it ports are privileged.
pub const MIN_PORT: u16 = 1024;

/// Top-level configuration for the spill monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Where trigger events come from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Where finished spill snapshots go.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Histogram and channel settings.
    #[serde(default)]
    pub spill: SpillConfig,

    /// Queueing between fetch and consumers.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Acquisition server streaming frames, "host:port".
    #[serde(default = "default_source_address")]
    pub address: String,

    /// Recorded frame file replayed instead of connecting. Takes precedence.
    #[serde(default)]
    pub replay: Option<PathBuf>,

    /// Events arriving this soon after connecting are dropped. Zero disables.
    #[serde(default = "default_discard_backlog", with = "humantime_serde")]
    pub discard_backlog: Duration,
}

/// Snapshot publishing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Serve snapshots to TCP subscribers.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: all interfaces.
    #[serde(default = "default_publish_host")]
    pub host: String,

    /// Listen port. Default: 8888.
    #[serde(default = "default_publish_port")]
    pub port: u16,

    /// Budget for delivering one snapshot to all subscribers. Default: 30ms.
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Capture one spill to `dump_path` and exit.
    #[serde(default)]
    pub dump: bool,

    /// Dump file path. Default: "tcp/example.json".
    #[serde(default = "default_dump_path")]
    pub dump_path: PathBuf,
}

/// Micro histogram defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct MicroConfig {
    /// Bin count, 6..=256. Default: 100.
    #[serde(default = "default_micro_bins")]
    pub nbins: usize,

    /// Longest interval binned, in clock ticks. Default: 1e7.
    #[serde(default = "default_micro_range")]
    pub max_range: u32,
}

/// Macro histogram defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct MacroConfig {
    /// Bin width in seconds, [0.05, 2.0). Default: 0.1.
    #[serde(default = "default_macro_bin_width")]
    pub bin_width: f64,
}

/// Per-channel overrides of the global settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub nbins: Option<usize>,
    #[serde(default)]
    pub max_range: Option<u32>,
    #[serde(default)]
    pub bin_width: Option<f64>,
}

/// Histogram and channel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SpillConfig {
    /// Rate of the hardware clock in Hz. Default: 100 MHz.
    #[serde(default = "default_clock_hz")]
    pub clock_hz: f64,

    /// How intervals before lost hits are split.
    #[serde(default)]
    pub lost_hit_policy: LostHitPolicy,

    #[serde(default)]
    pub microspill: MicroConfig,

    #[serde(default)]
    pub macrospill: MacroConfig,

    /// Overrides keyed by channel number 1..=4.
    #[serde(default)]
    pub channels: BTreeMap<u32, ChannelConfig>,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Events each consumer may lag behind the fetcher. Default: 65536.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Print a per-spill scaler table to stdout.
    #[serde(default)]
    pub monitor: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for health metrics server. Default: ":9090". Empty disables.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_address() -> String {
    "localhost:8000".to_string()
}

fn default_discard_backlog() -> Duration {
    Duration::from_millis(300)
}

fn default_publish_host() -> String {
    "0.0.0.0".to_string()
}

fn default_publish_port() -> u16 {
    8888
}

fn default_send_timeout() -> Duration {
    Duration::from_millis(30)
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("tcp/example.json")
}

fn default_micro_bins() -> usize {
    microspill::DEFAULT_BINS
}

fn default_micro_range() -> u32 {
    microspill::DEFAULT_MAX_RANGE
}

fn default_macro_bin_width() -> f64 {
    macrospill::DEFAULT_BIN_WIDTH
}

fn default_clock_hz() -> f64 {
    DEFAULT_CLOCK_HZ
}

fn default_queue_capacity() -> usize {
    queue::DEFAULT_CAPACITY
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            publish: PublishConfig::default(),
            spill: SpillConfig::default(),
            pipeline: PipelineConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            address: default_source_address(),
            replay: None,
            discard_backlog: default_discard_backlog(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_publish_host(),
            port: default_publish_port(),
            send_timeout: default_send_timeout(),
            dump: false,
            dump_path: default_dump_path(),
        }
    }
}

impl Default for MicroConfig {
    fn default() -> Self {
        Self {
            nbins: default_micro_bins(),
            max_range: default_micro_range(),
        }
    }
}

impl Default for MacroConfig {
    fn default() -> Self {
        Self {
            bin_width: default_macro_bin_width(),
        }
    }
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            clock_hz: default_clock_hz(),
            lost_hit_policy: LostHitPolicy::default(),
            microspill: MicroConfig::default(),
            macrospill: MacroConfig::default(),
            channels: BTreeMap::new(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            monitor: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Not validated yet: command-line overrides are applied on top first.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for ranges and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.replay.is_none() && self.source.address.is_empty() {
            bail!("source.address is required unless source.replay is set");
        }

        if self.publish.port < MIN_PORT {
            bail!(
                "publish.port {} outside {MIN_PORT}..=65535",
                self.publish.port
            );
        }

        if self.publish.send_timeout.is_zero() {
            bail!("publish.send_timeout must be positive");
        }

        if self.publish.dump && self.publish.dump_path.as_os_str().is_empty() {
            bail!("publish.dump_path is required when publish.dump is set");
        }

        if !(self.spill.clock_hz.is_finite() && self.spill.clock_hz > 0.0) {
            bail!("spill.clock_hz must be positive");
        }

        microspill::validate_bins(self.spill.microspill.nbins)
            .context("spill.microspill.nbins")?;
        microspill::validate_range(self.spill.microspill.max_range)
            .context("spill.microspill.max_range")?;
        macrospill::validate_bin_width(self.spill.macrospill.bin_width)
            .context("spill.macrospill.bin_width")?;

        for (number, channel) in &self.spill.channels {
            if Channel::from_number(*number).is_none() {
                bail!("spill.channels: unknown channel {number}, expected 1..={NUM_CHANNELS}");
            }
            if let Some(alias) = &channel.alias {
                validate_alias(alias).with_context(|| format!("spill.channels.{number}.alias"))?;
            }
            if let Some(nbins) = channel.nbins {
                microspill::validate_bins(nbins)
                    .with_context(|| format!("spill.channels.{number}.nbins"))?;
            }
            if let Some(max_range) = channel.max_range {
                microspill::validate_range(max_range)
                    .with_context(|| format!("spill.channels.{number}.max_range"))?;
            }
            if let Some(width) = channel.bin_width {
                macrospill::validate_bin_width(width)
                    .with_context(|| format!("spill.channels.{number}.bin_width"))?;
            }
        }

        if self.pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be positive");
        }

        Ok(())
    }

    /// Resolved settings of all four channels.
    pub fn spill_settings(&self) -> SpillSettings {
        let channels = Channel::all()
            .map(|ch| {
                let over = self
                    .spill
                    .channels
                    .get(&ch.number())
                    .cloned()
                    .unwrap_or_default();
                ChannelSettings {
                    alias: over.alias.unwrap_or_else(|| spill::default_alias(ch)),
                    nbins: over.nbins.unwrap_or(self.spill.microspill.nbins),
                    max_range: over.max_range.unwrap_or(self.spill.microspill.max_range),
                    bin_width: over.bin_width.unwrap_or(self.spill.macrospill.bin_width),
                }
            })
            .collect();

        SpillSettings {
            clock_hz: self.spill.clock_hz,
            channels,
        }
    }

    /// Backlog window, `None` when disabled.
    pub fn discard_backlog(&self) -> Option<Duration> {
        Some(self.source.discard_backlog).filter(|d| !d.is_zero())
    }

    /// Applies one command-line override.
    pub fn apply(&mut self, over: &Override) {
        match over {
            Override::Alias(alias) => {
                self.channel_mut(alias.channel).alias = Some(alias.name.clone());
            }
            Override::MicroBins(v) => match v.channel {
                Some(ch) => self.channel_mut(ch).nbins = Some(v.value),
                None => {
                    self.spill.microspill.nbins = v.value;
                    self.clear_overrides(|c| c.nbins = None);
                }
            },
            Override::MicroRange(v) => match v.channel {
                Some(ch) => self.channel_mut(ch).max_range = Some(v.value),
                None => {
                    self.spill.microspill.max_range = v.value;
                    self.clear_overrides(|c| c.max_range = None);
                }
            },
            Override::MacroBinWidth(v) => match v.channel {
                Some(ch) => self.channel_mut(ch).bin_width = Some(v.value),
                None => {
                    self.spill.macrospill.bin_width = v.value;
                    self.clear_overrides(|c| c.bin_width = None);
                }
            },
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelConfig {
        self.spill.channels.entry(channel.number()).or_default()
    }

    fn clear_overrides(&mut self, clear: impl Fn(&mut ChannelConfig)) {
        self.spill.channels.values_mut().for_each(clear);
    }
}

fn validate_alias(alias: &str) -> Result<()> {
    if alias.is_empty() {
        bail!("alias must not be empty");
    }
    if alias.contains('=') {
        bail!("alias {alias:?} must not contain '='");
    }
    Ok(())
}

// --- Command-line overrides ---

/// A setting applied to one channel, or to all when `channel` is `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelValue<T> {
    pub channel: Option<Channel>,
    pub value: T,
}

impl<T> FromStr for ChannelValue<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    type Err = String;

    /// Parses "VALUE" or "N=VALUE" with N in 1..=4.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, value) = match s.split_once('=') {
            Some((n, value)) => (Some(parse_channel(n)?), value),
            None => (None, s),
        };
        let value = value
            .trim()
            .parse()
            .map_err(|e| format!("invalid value {value:?}: {e}"))?;
        Ok(Self { channel, value })
    }
}

/// "N=NAME" channel alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAlias {
    pub channel: Channel,
    pub name: String,
}

impl FromStr for ChannelAlias {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (n, name) = s
            .split_once('=')
            .ok_or_else(|| format!("expected N=NAME, got {s:?}"))?;
        let channel = parse_channel(n)?;
        validate_alias(name).map_err(|e| e.to_string())?;
        Ok(Self {
            channel,
            name: name.to_string(),
        })
    }
}

fn parse_channel(s: &str) -> Result<Channel, String> {
    s.trim()
        .parse::<u32>()
        .ok()
        .and_then(Channel::from_number)
        .ok_or_else(|| format!("channel must be 1..={NUM_CHANNELS}, got {s:?}"))
}

/// One command-line override of the file configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Override {
    Alias(ChannelAlias),
    MicroBins(ChannelValue<usize>),
    MicroRange(ChannelValue<u32>),
    MacroBinWidth(ChannelValue<f64>),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn ch(n: u32) -> Channel {
        Channel::from_number(n).unwrap()
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.publish.port, 8888);
        assert_eq!(cfg.publish.host, "0.0.0.0");
        assert_eq!(cfg.publish.send_timeout, Duration::from_millis(30));
        assert_eq!(cfg.publish.dump_path, PathBuf::from("tcp/example.json"));
        assert_eq!(cfg.source.discard_backlog, Duration::from_millis(300));
        assert_eq!(cfg.pipeline.queue_capacity, 65_536);
        assert_eq!(cfg.health.addr, ":9090");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_default_spill_settings() {
        let settings = Config::default().spill_settings();
        assert_eq!(settings, SpillSettings::default());
        assert_eq!(settings.channels[3].alias, "ECL_IN(4)");
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
log_level: debug
source:
  replay: run042.frames
  discard_backlog: 0s
publish:
  enabled: true
  port: 9999
  send_timeout: 50ms
spill:
  lost_hit_policy: half_then_full
  microspill:
    nbins: 64
  channels:
    2:
      alias: "beam monitor"
      bin_width: 0.5
pipeline:
  monitor: true
health:
  addr: ""
"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.source.replay, Some(PathBuf::from("run042.frames")));
        assert_eq!(cfg.discard_backlog(), None);
        assert_eq!(cfg.publish.send_timeout, Duration::from_millis(50));
        assert_eq!(cfg.spill.lost_hit_policy, LostHitPolicy::HalfThenFull);
        assert!(cfg.pipeline.monitor);
        assert!(cfg.health.addr.is_empty());

        let settings = cfg.spill_settings();
        assert_eq!(settings.channels[0].nbins, 64);
        assert_eq!(settings.channels[1].alias, "beam monitor");
        assert_eq!(settings.channels[1].bin_width, 0.5);
        assert_eq!(settings.channels[1].nbins, 64);
        assert_eq!(settings.channels[2].bin_width, 0.1);
    }

    #[test]
    fn test_load_rejects_unknown_policy() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "spill:\n  lost_hit_policy: guess\n").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_validation_port_range() {
        let mut cfg = Config::default();
        cfg.publish.port = 1023;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("publish.port"));

        cfg.publish.port = MIN_PORT;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validation_histogram_ranges() {
        let mut cfg = Config::default();
        cfg.spill.microspill.nbins = 5;
        assert!(format!("{:#}", cfg.validate().unwrap_err()).contains("nbins"));

        let mut cfg = Config::default();
        cfg.spill.macrospill.bin_width = 2.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.spill.channels.insert(
            3,
            ChannelConfig {
                max_range: Some(100),
                ..Default::default()
            },
        );
        let err = format!("{:#}", cfg.validate().unwrap_err());
        assert!(err.contains("spill.channels.3.max_range"));
    }

    #[test]
    fn test_validation_unknown_channel() {
        let mut cfg = Config::default();
        cfg.spill.channels.insert(5, ChannelConfig::default());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown channel 5"));
    }

    #[test]
    fn test_validation_bad_alias() {
        let mut cfg = Config::default();
        cfg.spill.channels.insert(
            1,
            ChannelConfig {
                alias: Some(String::new()),
                ..Default::default()
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_source_required() {
        let mut cfg = Config::default();
        cfg.source.address.clear();
        assert!(cfg.validate().is_err());

        cfg.source.replay = Some(PathBuf::from("events.bin"));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_channel_value() {
        let all: ChannelValue<usize> = "128".parse().unwrap();
        assert_eq!(
            all,
            ChannelValue {
                channel: None,
                value: 128
            }
        );

        let one: ChannelValue<f64> = "3=0.25".parse().unwrap();
        assert_eq!(one.channel, Some(ch(3)));
        assert_eq!(one.value, 0.25);

        assert!("5=10".parse::<ChannelValue<usize>>().is_err());
        assert!("x".parse::<ChannelValue<usize>>().is_err());
    }

    #[test]
    fn test_parse_alias() {
        let alias: ChannelAlias = "2=Start detector".parse().unwrap();
        assert_eq!(alias.channel, ch(2));
        assert_eq!(alias.name, "Start detector");

        assert!("2=".parse::<ChannelAlias>().is_err());
        assert!("2=a=b".parse::<ChannelAlias>().is_err());
        assert!("foo".parse::<ChannelAlias>().is_err());
        assert!("0=foo".parse::<ChannelAlias>().is_err());
    }

    #[test]
    fn test_global_override_replaces_channel_overrides() {
        let mut cfg = Config::default();
        cfg.apply(&Override::MicroBins("4=50".parse().unwrap()));
        assert_eq!(cfg.spill_settings().channels[3].nbins, 50);

        cfg.apply(&Override::MicroBins("200".parse().unwrap()));
        let settings = cfg.spill_settings();
        assert!(settings.channels.iter().all(|c| c.nbins == 200));
    }

    #[test]
    fn test_override_then_validate() {
        let mut cfg = Config::default();
        cfg.apply(&Override::MacroBinWidth("1=0.01".parse().unwrap()));
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.apply(&Override::Alias("1=trigger".parse().unwrap()));
        cfg.apply(&Override::MicroRange("2=5000".parse().unwrap()));
        cfg.validate().unwrap();
        let settings = cfg.spill_settings();
        assert_eq!(settings.channels[0].alias, "trigger");
        assert_eq!(settings.channels[1].max_range, 5_000);
    }
}
