/*!
# Sensor packets

A packet is one self-contained recording unit of a single device, covering
a bounded span of device-time. Besides the channel blocks, it carries the
clock synchronization exchanges which were recorded while the packet was
being filled; those are needed to map the device's free-running clock onto
the common reference timeline (see [`crate::clock`]).

On the wire, a packet is an envelope (magic, format version, declared body
length and checksum) around an LZ4 compressed body. See [`codec`] for the
envelope and [`frame`] for the body layout.
*/
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};

use num_enum::TryFromPrimitive;

use smartstring::alias::{String as SmartString};

pub mod codec;
mod delta;
mod frame;

pub use codec::{decode, encode, FORMAT_VERSION};

/// Microseconds, either on a device clock or on the reference timeline.
pub type Micros = i64;

/// Largest magnitude of any time a packet may carry, a little over 36000
/// years either side of the epoch. Keeps offsets and corrections well
/// inside `i64`.
pub const TIME_LIMIT: Micros = 1 << 60;

fn check_time(what: &str, t: Micros) -> Result<(), String> {
	if t < -TIME_LIMIT || t > TIME_LIMIT {
		return Err(format!("{} {} out of range", what, t))
	}
	Ok(())
}

/// Convert a reference-time to a calendar timestamp, for display.
///
/// `None` if `t` lies outside what chrono can represent.
pub fn to_datetime(t: Micros) -> Option<DateTime<Utc>> {
	Utc.timestamp_opt(t.div_euclid(1_000_000), (t.rem_euclid(1_000_000) * 1000) as u32).single()
}

#[derive(Debug)]
pub enum DecodeError {
	/// Length, checksum, compression or structural damage.
	CorruptPacket(String),
	/// Unknown format version or flags in the envelope.
	UnsupportedFormat{version: u8, flags: u8},
	/// The packet handed to the encoder violates a structural invariant.
	InvalidPacket(String),
}

impl fmt::Display for DecodeError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::CorruptPacket(why) => write!(f, "corrupt packet: {}", why),
			Self::UnsupportedFormat{version, flags} => write!(f, "unsupported packet format (version {}, flags {:#04x})", version, flags),
			Self::InvalidPacket(why) => write!(f, "invalid packet: {}", why),
		}
	}
}

impl std::error::Error for DecodeError {}

#[repr(u8)]
#[derive(TryFromPrimitive, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
	Audio = 0x01,
	Pressure = 0x02,
	Location = 0x03,
	Accelerometer = 0x04,
	Magnetometer = 0x05,
	Gyroscope = 0x06,
	Light = 0x07,
}

impl ChannelKind {
	pub const ALL: [ChannelKind; 7] = [
		Self::Audio,
		Self::Pressure,
		Self::Location,
		Self::Accelerometer,
		Self::Magnetometer,
		Self::Gyroscope,
		Self::Light,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Audio => "audio",
			Self::Pressure => "pressure",
			Self::Location => "location",
			Self::Accelerometer => "accelerometer",
			Self::Magnetometer => "magnetometer",
			Self::Gyroscope => "gyroscope",
			Self::Light => "light",
		}
	}

	/// Shape of the values a block of this channel carries.
	pub fn value_kind(&self) -> ValueKind {
		match self {
			Self::Audio => ValueKind::Audio,
			Self::Pressure | Self::Light => ValueKind::Scalar,
			Self::Accelerometer | Self::Magnetometer | Self::Gyroscope => ValueKind::Xyz,
			Self::Location => ValueKind::Location,
		}
	}
}

impl fmt::Display for ChannelKind {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ChannelKind {
	type Err = &'static str;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		for kind in Self::ALL.iter() {
			if kind.as_str() == s {
				return Ok(*kind)
			}
		}
		Err("unknown channel")
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
	Audio,
	Scalar,
	Xyz,
	Location,
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Location {
	pub latitude: f64,
	pub longitude: f64,
	pub altitude: f64,
	pub accuracy: f64,
}

/// A single sample value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
	Audio(i16),
	Scalar(f64),
	Xyz([f64; 3]),
	Location(Location),
}

impl Value {
	/// Bitwise identity; unlike `==`, two NaNs with the same payload are the same value.
	pub fn same_as(&self, other: &Value) -> bool {
		match (self, other) {
			(Self::Audio(a), Self::Audio(b)) => a == b,
			(Self::Scalar(a), Self::Scalar(b)) => a.to_bits() == b.to_bits(),
			(Self::Xyz(a), Self::Xyz(b)) => a.iter().zip(b.iter()).all(|(a, b)| a.to_bits() == b.to_bits()),
			(Self::Location(a), Self::Location(b)) => {
				a.latitude.to_bits() == b.latitude.to_bits() &&
				a.longitude.to_bits() == b.longitude.to_bits() &&
				a.altitude.to_bits() == b.altitude.to_bits() &&
				a.accuracy.to_bits() == b.accuracy.to_bits()
			},
			_ => false,
		}
	}
}

impl fmt::Display for Value {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Audio(v) => write!(f, "{}", v),
			Self::Scalar(v) => write!(f, "{}", v),
			Self::Xyz([x, y, z]) => write!(f, "({}, {}, {})", x, y, z),
			Self::Location(l) => write!(f, "{},{} @{}m ±{}m", l.latitude, l.longitude, l.altitude, l.accuracy),
		}
	}
}

/// Column of sample values of one channel block.
#[derive(Clone, Debug, PartialEq)]
pub enum RawData {
	Audio(Vec<i16>),
	Scalar(Vec<f64>),
	Xyz(Vec<[f64; 3]>),
	Location(Vec<Location>),
}

impl RawData {
	pub fn len(&self) -> usize {
		match self {
			Self::Audio(v) => v.len(),
			Self::Scalar(v) => v.len(),
			Self::Xyz(v) => v.len(),
			Self::Location(v) => v.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn value_kind(&self) -> ValueKind {
		match self {
			Self::Audio(_) => ValueKind::Audio,
			Self::Scalar(_) => ValueKind::Scalar,
			Self::Xyz(_) => ValueKind::Xyz,
			Self::Location(_) => ValueKind::Location,
		}
	}

	pub fn get(&self, i: usize) -> Option<Value> {
		match self {
			Self::Audio(v) => v.get(i).map(|v| Value::Audio(*v)),
			Self::Scalar(v) => v.get(i).map(|v| Value::Scalar(*v)),
			Self::Xyz(v) => v.get(i).map(|v| Value::Xyz(*v)),
			Self::Location(v) => v.get(i).map(|v| Value::Location(*v)),
		}
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelBlock {
	pub kind: ChannelKind,
	/// Nominal interval between two samples.
	pub period_us: u32,
	/// Device-time of each sample.
	pub timestamps: Vec<Micros>,
	pub data: RawData,
}

impl ChannelBlock {
	pub fn len(&self) -> usize {
		self.timestamps.len()
	}

	pub fn is_empty(&self) -> bool {
		self.timestamps.is_empty()
	}

	pub fn samples<'x>(&'x self) -> impl Iterator<Item = (Micros, Value)> + 'x {
		self.timestamps.iter().enumerate().filter_map(move |(i, t)| {
			self.data.get(i).map(|v| (*t, v))
		})
	}

	fn check(&self) -> Result<(), String> {
		if self.period_us == 0 {
			return Err(format!("{} block has a zero sample period", self.kind))
		}
		if self.kind.value_kind() != self.data.value_kind() {
			return Err(format!("{} block carries {:?} values", self.kind, self.data.value_kind()))
		}
		if self.timestamps.len() != self.data.len() {
			return Err(format!("{} block has {} timestamps but {} values", self.kind, self.timestamps.len(), self.data.len()))
		}
		for pair in self.timestamps.windows(2) {
			if pair[1] <= pair[0] {
				return Err(format!("{} block timestamps are not strictly increasing at {}", self.kind, pair[1]))
			}
		}
		Ok(())
	}
}

/// One clock comparison between the device and the reference clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncExchange {
	pub device_time: Micros,
	pub reference_time: Micros,
	pub latency: u64,
}

impl SyncExchange {
	/// Offset to add to the device-time to obtain the reference-time.
	pub fn offset(&self) -> i64 {
		self.reference_time.saturating_sub(self.device_time)
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
	pub device_id: SmartString,
	pub version: u8,
	/// Device-time of the start of the recording.
	pub start: Micros,
	/// Device-time of the end of the recording.
	pub end: Micros,
	/// Reference-time at which the collecting server received the packet, if known.
	pub server_arrival: Option<Micros>,
	pub exchanges: Vec<SyncExchange>,
	pub blocks: Vec<ChannelBlock>,
}

impl Packet {
	pub fn new<S: Into<SmartString>>(device_id: S, start: Micros, end: Micros) -> Self {
		Self{
			device_id: device_id.into(),
			version: FORMAT_VERSION,
			start,
			end,
			server_arrival: None,
			exchanges: Vec::new(),
			blocks: Vec::new(),
		}
	}

	pub fn block(&self, kind: ChannelKind) -> Option<&ChannelBlock> {
		self.blocks.iter().find(|b| b.kind == kind)
	}

	/// Stable identity of this packet, used to make indexing idempotent.
	pub fn id(&self) -> PacketId {
		PacketId{
			device_id: self.device_id.clone(),
			start: self.start,
			digest: frame::digest(self),
		}
	}

	/// Structural invariants shared by the encoder and the decoder.
	pub fn check(&self) -> Result<(), String> {
		if self.device_id.is_empty() {
			return Err("empty device identifier".into())
		}
		if self.device_id.len() > u16::MAX as usize {
			return Err("device identifier too long".into())
		}
		check_time("start", self.start)?;
		check_time("end", self.end)?;
		if self.end < self.start {
			return Err(format!("packet ends ({}) before it starts ({})", self.end, self.start))
		}
		if let Some(t) = self.server_arrival {
			check_time("server arrival", t)?;
		}
		for x in self.exchanges.iter() {
			check_time("exchange device-time", x.device_time)?;
			check_time("exchange reference-time", x.reference_time)?;
		}
		if self.exchanges.len() > u16::MAX as usize {
			return Err("too many synchronization exchanges".into())
		}
		for pair in self.exchanges.windows(2) {
			if pair[1].device_time < pair[0].device_time {
				return Err(format!("synchronization exchanges out of order at {}", pair[1].device_time))
			}
		}
		if self.blocks.len() > u8::MAX as usize {
			return Err("too many channel blocks".into())
		}
		for (i, block) in self.blocks.iter().enumerate() {
			if self.blocks[..i].iter().any(|other| other.kind == block.kind) {
				return Err(format!("duplicate {} block", block.kind))
			}
			if block.len() > u32::MAX as usize {
				return Err(format!("{} block too long", block.kind))
			}
			block.check()?;
			if let (Some(first), Some(last)) = (block.timestamps.first(), block.timestamps.last()) {
				check_time("sample time", *first)?;
				check_time("sample time", *last)?;
			}
		}
		Ok(())
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId {
	pub device_id: SmartString,
	pub start: Micros,
	/// seahash of the uncompressed body
	pub digest: u64,
}

impl fmt::Display for PacketId {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}@{}#{:016x}", self.device_id, self.start, self.digest)
	}
}
