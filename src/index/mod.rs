/*!
# Stream index

The index owns one [`ContinuousStream`] per device and channel, together
with a registry of the packets folded into them.

Every stream lives in a slot with a writer lock. A fold works on the
writer's copy and then publishes a new snapshot; queries only ever read
snapshots, so they run concurrently with folds and never observe half a
fold.
*/
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, trace};

use smartstring::alias::{String as SmartString};

use crate::channel::{Anomaly, Extraction};
use crate::clock::Confidence;
use crate::packet::{ChannelKind, Micros, PacketId};
use crate::stream::{self, Conflict, ContinuousStream, FoldError, Gap, StoredSample};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
	pub device: SmartString,
	pub kind: ChannelKind,
}

impl StreamKey {
	pub fn new<S: Into<SmartString>>(device: S, kind: ChannelKind) -> Self {
		Self{device: device.into(), kind}
	}
}

impl fmt::Display for StreamKey {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}/{}", self.device, self.kind)
	}
}

/// Registry entry of an indexed packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketLocation {
	pub id: PacketId,
	/// Corrected `[start, end]`.
	pub span: (Micros, Micros),
	pub confidence: Confidence,
	pub channels: Vec<ChannelKind>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexReport {
	pub added: usize,
	pub replaced: usize,
	pub conflicts: usize,
	pub anomalies: usize,
}

#[derive(Debug)]
struct Slot {
	writer: Mutex<ContinuousStream>,
	snapshot: RwLock<Arc<ContinuousStream>>,
	conflicts: Mutex<Vec<Conflict>>,
}

impl Slot {
	fn new(stream: ContinuousStream) -> Self {
		Self{
			snapshot: RwLock::new(Arc::new(stream.clone())),
			writer: Mutex::new(stream),
			conflicts: Mutex::new(Vec::new()),
		}
	}

	fn snapshot(&self) -> Arc<ContinuousStream> {
		self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
	}
}

#[derive(Debug)]
pub struct StreamIndex {
	tolerance: f64,
	max_segment_samples: usize,
	slots: RwLock<HashMap<StreamKey, Arc<Slot>>>,
	packets: RwLock<BTreeMap<PacketId, PacketLocation>>,
	anomalies: Mutex<HashMap<SmartString, Vec<Anomaly>>>,
}

impl StreamIndex {
	pub fn new(tolerance: f64, max_segment_samples: usize) -> Self {
		Self{
			tolerance,
			max_segment_samples: max_segment_samples.max(1),
			slots: RwLock::new(HashMap::new()),
			packets: RwLock::new(BTreeMap::new()),
			anomalies: Mutex::new(HashMap::new()),
		}
	}

	fn slot(&self, key: &StreamKey) -> Option<Arc<Slot>> {
		self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
	}

	fn slot_or_create(&self, key: &StreamKey, period_us: u32) -> Arc<Slot> {
		if let Some(slot) = self.slot(key) {
			return slot
		}
		let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
		slots.entry(key.clone()).or_insert_with(|| {
			debug!("new stream {} at {}µs", key, period_us);
			Arc::new(Slot::new(ContinuousStream::new(key.device.clone(), key.kind, period_us, self.tolerance)))
		}).clone()
	}

	pub fn contains(&self, id: &PacketId) -> bool {
		self.packets.read().unwrap_or_else(PoisonError::into_inner).contains_key(id)
	}

	/// Fold all blocks of an extracted packet into their streams.
	///
	/// Returns `None` if the packet had been indexed before; the streams are
	/// not touched again in that case. If any block is malformed, nothing is
	/// folded.
	pub fn index(&self, extraction: &Extraction) -> Result<Option<IndexReport>, FoldError> {
		if extraction.span.1 < extraction.span.0 {
			return Err(FoldError::InvalidTimeRange{start: extraction.span.0, end: extraction.span.1})
		}
		for block in extraction.blocks.values() {
			stream::check(block)?;
		}

		{
			let mut packets = self.packets.write().unwrap_or_else(PoisonError::into_inner);
			if packets.contains_key(&extraction.packet) {
				trace!("{} already indexed", extraction.packet);
				return Ok(None)
			}
			packets.insert(extraction.packet.clone(), PacketLocation{
				id: extraction.packet.clone(),
				span: extraction.span,
				confidence: extraction.confidence,
				channels: extraction.blocks.keys().copied().collect(),
			});
		}

		let mut report = IndexReport::default();
		for block in extraction.blocks.values() {
			let key = StreamKey::new(extraction.packet.device_id.clone(), block.kind);
			let slot = self.slot_or_create(&key, block.period_us);
			let mut writer = slot.writer.lock().unwrap_or_else(PoisonError::into_inner);
			let folded = writer.fold(block)?;
			*slot.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(writer.clone());

			report.added += folded.added;
			report.replaced += folded.replaced;
			report.conflicts += folded.conflicts.len();
			if !folded.conflicts.is_empty() {
				slot.conflicts.lock().unwrap_or_else(PoisonError::into_inner).extend(folded.conflicts);
			}
		}

		if !extraction.anomalies.is_empty() {
			report.anomalies = extraction.anomalies.len();
			self.anomalies.lock().unwrap_or_else(PoisonError::into_inner)
				.entry(extraction.packet.device_id.clone())
				.or_insert_with(Vec::new)
				.extend(extraction.anomalies.iter().cloned());
		}
		Ok(Some(report))
	}

	/// Indexed packets of `device` whose corrected span intersects `[t0, t1)`.
	pub fn locate(&self, device: &str, t0: Micros, t1: Micros) -> Vec<PacketLocation> {
		let packets = self.packets.read().unwrap_or_else(PoisonError::into_inner);
		let lower = PacketId{device_id: device.into(), start: Micros::MIN, digest: 0};
		let upper = PacketId{device_id: device.into(), start: Micros::MAX, digest: u64::MAX};
		packets.range(lower..=upper)
			.map(|(_, loc)| loc)
			.filter(|loc| loc.span.0 < t1 && loc.span.1 >= t0)
			.cloned()
			.collect()
	}

	/// Current snapshot of a stream.
	pub fn stream(&self, device: &str, kind: ChannelKind) -> Option<Arc<ContinuousStream>> {
		self.slot(&StreamKey::new(device, kind)).map(|slot| slot.snapshot())
	}

	pub fn keys(&self) -> Vec<StreamKey> {
		let mut keys: Vec<StreamKey> = self.slots.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
		keys.sort();
		keys
	}

	/// Samples and gaps of a stream within `[t0, t1)`.
	///
	/// The window is produced lazily from a snapshot taken now; later folds
	/// do not affect it. An unknown stream yields a single gap.
	pub fn query(&self, device: &str, kind: ChannelKind, t0: Micros, t1: Micros) -> Window {
		let stream = self.stream(device, kind);
		if stream.is_none() {
			debug!("no stream {}/{}, query is all gap", device, kind);
		}
		Window{
			stream,
			cursor: t0,
			end: t1,
			run: 0,
			max_samples: self.max_segment_samples,
		}
	}

	pub fn conflicts(&self, device: &str, kind: ChannelKind) -> Vec<Conflict> {
		match self.slot(&StreamKey::new(device, kind)) {
			Some(slot) => slot.conflicts.lock().unwrap_or_else(PoisonError::into_inner).clone(),
			None => Vec::new(),
		}
	}

	pub fn anomalies(&self, device: &str) -> Vec<Anomaly> {
		self.anomalies.lock().unwrap_or_else(PoisonError::into_inner)
			.get(device)
			.cloned()
			.unwrap_or_default()
	}
}

/// One piece of a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
	/// `[start, end)` is covered by data; `samples` are those within it.
	Data{start: Micros, end: Micros, samples: Vec<StoredSample>},
	Gap(Gap),
}

impl Segment {
	pub fn start(&self) -> Micros {
		match self {
			Self::Data{start, ..} => *start,
			Self::Gap(g) => g.start,
		}
	}

	pub fn end(&self) -> Micros {
		match self {
			Self::Data{end, ..} => *end,
			Self::Gap(g) => g.end,
		}
	}

	pub fn is_gap(&self) -> bool {
		match self {
			Self::Gap(_) => true,
			_ => false,
		}
	}
}

/// Lazy, restartable (clone it) sequence of segments exactly covering a window.
#[derive(Debug, Clone)]
pub struct Window {
	stream: Option<Arc<ContinuousStream>>,
	cursor: Micros,
	end: Micros,
	run: usize,
	max_samples: usize,
}

impl Window {
	fn gap_until(&mut self, until: Micros) -> Segment {
		let gap = Gap{start: self.cursor, end: until};
		self.cursor = until;
		Segment::Gap(gap)
	}
}

impl Iterator for Window {
	type Item = Segment;

	fn next(&mut self) -> Option<Segment> {
		if self.cursor >= self.end {
			return None
		}
		let stream = match self.stream.as_ref() {
			Some(stream) => stream.clone(),
			None => return Some(self.gap_until(self.end)),
		};
		let runs = stream.runs();
		if self.run == 0 {
			self.run = stream.run_at(self.cursor);
		}
		while self.run < runs.len() && runs[self.run].end() <= self.cursor {
			self.run += 1;
		}
		let run = match runs.get(self.run) {
			Some(run) => run,
			None => return Some(self.gap_until(self.end)),
		};
		if run.start() > self.cursor {
			return Some(self.gap_until(run.start().min(self.end)));
		}

		let samples = run.samples();
		let from = run.position(self.cursor);
		let mut to = from;
		while to < samples.len() && to - from < self.max_samples && samples[to].time < self.end {
			to += 1;
		}
		let until = if to < samples.len() && to - from == self.max_samples && samples[to].time < self.end {
			samples[to].time
		} else {
			run.end().min(self.end)
		};
		let segment = Segment::Data{
			start: self.cursor,
			end: until,
			samples: samples[from..to].to_vec(),
		};
		self.cursor = until;
		Some(segment)
	}
}
