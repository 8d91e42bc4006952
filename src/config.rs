use std::fmt;
use std::io;
use std::path::Path;

use serde_derive::Deserialize;

use crate::clock::FitParams;

#[derive(Debug)]
pub enum ConfigError {
	Io(io::Error),
	Parse(toml::de::Error),
	Invalid{field: &'static str, reason: String},
}

impl fmt::Display for ConfigError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Io(e) => write!(f, "failed to read configuration: {}", e),
			Self::Parse(e) => write!(f, "failed to parse configuration: {}", e),
			Self::Invalid{field, reason} => write!(f, "invalid configuration value for {}: {}", field, reason),
		}
	}
}

impl std::error::Error for ConfigError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Io(e) => Some(e),
			Self::Parse(e) => Some(e),
			Self::Invalid{..} => None,
		}
	}
}

impl From<io::Error> for ConfigError {
	fn from(other: io::Error) -> Self {
		Self::Io(other)
	}
}

impl From<toml::de::Error> for ConfigError {
	fn from(other: toml::de::Error) -> Self {
		Self::Parse(other)
	}
}

fn default_best_fraction() -> f64 {
	0.5
}

fn default_latency_floor_us() -> u64 {
	1000
}

fn default_neighbourhood_s() -> u64 {
	3600
}

fn default_tolerance() -> f64 {
	0.5
}

fn default_max_segment_samples() -> usize {
	65536
}

fn default_queue_depth() -> usize {
	64
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
	/// Share of the exchanges of a packet used for fitting, lowest latency first.
	#[serde(default = "default_best_fraction")]
	pub best_fraction: f64,
	#[serde(default = "default_latency_floor_us")]
	pub latency_floor_us: u64,
	/// How far (device-time) a neighbour may be to lend its clock model.
	#[serde(default = "default_neighbourhood_s")]
	pub neighbourhood_s: u64,
}

impl ClockConfig {
	pub fn fit_params(&self) -> FitParams {
		FitParams{
			best_fraction: self.best_fraction,
			latency_floor_us: self.latency_floor_us,
		}
	}

	pub fn neighbourhood_us(&self) -> i64 {
		(self.neighbourhood_s as i64).saturating_mul(1_000_000)
	}
}

impl Default for ClockConfig {
	fn default() -> Self {
		Self{
			best_fraction: default_best_fraction(),
			latency_floor_us: default_latency_floor_us(),
			neighbourhood_s: default_neighbourhood_s(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssemblyConfig {
	/// Relative slack on the sample period before a gap is assumed.
	#[serde(default = "default_tolerance")]
	pub tolerance: f64,
}

impl Default for AssemblyConfig {
	fn default() -> Self {
		Self{
			tolerance: default_tolerance(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
	#[serde(default = "default_max_segment_samples")]
	pub max_segment_samples: usize,
}

impl Default for QueryConfig {
	fn default() -> Self {
		Self{
			max_segment_samples: default_max_segment_samples(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
	/// Decoded packets in flight between the decode workers and the folders.
	#[serde(default = "default_queue_depth")]
	pub queue_depth: usize,
}

impl Default for IngestConfig {
	fn default() -> Self {
		Self{
			queue_depth: default_queue_depth(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub clock: ClockConfig,
	#[serde(default)]
	pub assembly: AssemblyConfig,
	#[serde(default)]
	pub query: QueryConfig,
	#[serde(default)]
	pub ingest: IngestConfig,
}

impl Config {
	pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
		let raw = std::fs::read_to_string(path)?;
		raw.parse()
	}

	pub fn check(&self) -> Result<(), ConfigError> {
		if !(self.clock.best_fraction > 0.0 && self.clock.best_fraction <= 1.0) {
			return Err(ConfigError::Invalid{
				field: "clock.best_fraction",
				reason: format!("{} is not within (0, 1]", self.clock.best_fraction),
			})
		}
		if !(self.assembly.tolerance >= 0.0 && self.assembly.tolerance.is_finite()) {
			return Err(ConfigError::Invalid{
				field: "assembly.tolerance",
				reason: format!("{} is not a finite non-negative number", self.assembly.tolerance),
			})
		}
		if self.query.max_segment_samples == 0 {
			return Err(ConfigError::Invalid{
				field: "query.max_segment_samples",
				reason: "must be at least 1".into(),
			})
		}
		if self.ingest.queue_depth == 0 {
			return Err(ConfigError::Invalid{
				field: "ingest.queue_depth",
				reason: "must be at least 1".into(),
			})
		}
		Ok(())
	}
}

impl std::str::FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let config: Config = toml::from_str(s)?;
		config.check()?;
		Ok(config)
	}
}
