/*!
# Channel extraction

Projects a decoded packet onto the reference timeline: every channel block
becomes a [`SampleBlock`] of `(reference-time, value)` samples. Samples which
land outside the packet's own corrected span are not part of the block; they
are reported as [`Anomaly`] instead.
*/
use std::collections::BTreeMap;
use std::fmt;

use log::warn;

use crate::clock::{ClockModel, Confidence};
use crate::packet::{ChannelKind, Micros, Packet, PacketId, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
	pub time: Micros,
	pub value: Value,
}

/// Where a sample came from, used to decide between colliding samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
	/// Content digest of the packet.
	pub digest: u64,
	pub confidence: Confidence,
	/// Ingest sequence number; higher arrived later.
	pub arrival: u64,
}

/// Corrected samples of one channel from one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
	pub kind: ChannelKind,
	pub period_us: u32,
	pub origin: Origin,
	/// Corrected `[start, end]` of the packet.
	pub span: (Micros, Micros),
	pub samples: Vec<Sample>,
}

impl SampleBlock {
	pub fn len(&self) -> usize {
		self.samples.len()
	}

	pub fn is_empty(&self) -> bool {
		self.samples.is_empty()
	}
}

/// A sample whose corrected time contradicts the packet's corrected span.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
	pub packet: PacketId,
	pub kind: ChannelKind,
	pub device_time: Micros,
	pub time: Micros,
	pub value: Value,
}

impl fmt::Display for Anomaly {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		write!(f, "{} {} sample at {} (device {}) outside of packet span: {}", self.packet, self.kind, self.time, self.device_time, self.value)
	}
}

#[derive(Debug, Clone)]
pub struct Extraction {
	pub packet: PacketId,
	pub confidence: Confidence,
	/// Corrected `[start, end]` of the packet.
	pub span: (Micros, Micros),
	pub blocks: BTreeMap<ChannelKind, SampleBlock>,
	pub anomalies: Vec<Anomaly>,
}

/// Correct all channel blocks of `packet` with `model`.
///
/// `arrival` orders packets which carry samples for the same instant with
/// equal confidence; the later one wins.
pub fn extract(packet: &Packet, model: &ClockModel, arrival: u64) -> Extraction {
	let id = packet.id();
	let span = (model.apply(packet.start).time, model.apply(packet.end).time);
	let origin = Origin{
		digest: id.digest,
		confidence: model.confidence(packet.start, packet.end),
		arrival,
	};

	// an inverted span is rejected as a whole when folding
	let inverted = span.1 < span.0;

	let mut blocks = BTreeMap::new();
	let mut anomalies = Vec::new();
	for block in packet.blocks.iter() {
		let mut samples = Vec::with_capacity(block.len());
		for (device_time, value) in block.samples() {
			let time = model.apply(device_time).time;
			if !inverted && (time < span.0 || time > span.1) {
				let anomaly = Anomaly{
					packet: id.clone(),
					kind: block.kind,
					device_time,
					time,
					value,
				};
				warn!("{}", anomaly);
				anomalies.push(anomaly);
				continue;
			}
			samples.push(Sample{time, value});
		}
		if samples.is_empty() {
			continue;
		}
		blocks.insert(block.kind, SampleBlock{
			kind: block.kind,
			period_us: block.period_us,
			origin,
			span,
			samples,
		});
	}

	Extraction{
		packet: id,
		confidence: origin.confidence,
		span,
		blocks,
		anomalies,
	}
}
