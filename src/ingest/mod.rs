/*!
# Ingest driver

[`Engine`] ties the pipeline together: decode, clock resolution, channel
extraction and folding into the [`StreamIndex`].

Bulk ingest runs in two phases. First, all packets are decoded and their
own clock models are fitted on blocking workers; fitting everything first
makes every model of a batch available as a neighbour, independent of the
order in which the packets were handed in. Then the packets are grouped by
device, ordered by device-time, and folded one after the other per device,
with different devices folding concurrently.
*/
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use log::{debug, info, warn};

use smartstring::alias::{String as SmartString};

use tokio::sync::mpsc;
use tokio::task::spawn_blocking;

use crate::channel::extract;
use crate::clock::{stats, ClockResolver, Grade, Interpolate, SyncError};
use crate::config::Config;
use crate::index::{IndexReport, StreamIndex};
use crate::packet::{self, DecodeError, Micros, Packet, PacketId};
use crate::stream::FoldError;

/// Shared flag to stop a bulk ingest between two folds.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[derive(Debug)]
pub enum SkipReason {
	Decode(DecodeError),
	Fold{id: PacketId, error: FoldError},
	/// The worker handling the packet went away.
	Worker(String),
}

impl fmt::Display for SkipReason {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Decode(e) => fmt::Display::fmt(e, f),
			Self::Fold{id, error} => write!(f, "{}: {}", id, error),
			Self::Worker(why) => write!(f, "worker failed: {}", why),
		}
	}
}

/// Result of ingesting one packet.
#[derive(Debug)]
pub enum Outcome {
	Ingested{
		id: PacketId,
		grade: Grade,
		/// Why the packet's own exchanges could not be used, if so.
		fault: Option<SyncError>,
		report: IndexReport,
	},
	Duplicate{id: PacketId},
	Skipped{reason: SkipReason},
	Cancelled{device: SmartString, start: Micros},
}

impl Outcome {
	pub fn is_ingested(&self) -> bool {
		match self {
			Self::Ingested{..} => true,
			_ => false,
		}
	}
}

impl fmt::Display for Outcome {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Ingested{id, grade, fault, report} => {
				write!(f, "ingested {} ({} clock", id, grade)?;
				if let Some(fault) = fault {
					write!(f, ": {}", fault)?;
				}
				write!(f, "), {} samples added, {} replaced, {} conflicts, {} anomalies", report.added, report.replaced, report.conflicts, report.anomalies)
			},
			Self::Duplicate{id} => write!(f, "duplicate {}", id),
			Self::Skipped{reason} => write!(f, "skipped: {}", reason),
			Self::Cancelled{device, start} => write!(f, "cancelled {}@{}", device, start),
		}
	}
}

#[derive(Debug)]
pub struct Engine {
	config: Config,
	clocks: ClockResolver,
	index: StreamIndex,
	arrival: AtomicU64,
}

impl Engine {
	pub fn new(config: Config) -> Self {
		Self{
			clocks: ClockResolver::new(config.clock.fit_params(), config.clock.neighbourhood_us()),
			index: StreamIndex::new(config.assembly.tolerance, config.query.max_segment_samples),
			arrival: AtomicU64::new(0),
			config,
		}
	}

	pub fn with_interpolation(mut self, interpolate: Box<dyn Interpolate>) -> Self {
		self.clocks = self.clocks.with_interpolation(interpolate);
		self
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn index(&self) -> &StreamIndex {
		&self.index
	}

	pub fn clocks(&self) -> &ClockResolver {
		&self.clocks
	}

	fn prepare(&self, raw: &[u8]) -> Result<Packet, DecodeError> {
		let packet = packet::decode(raw)?;
		if let Err(e) = self.clocks.register(&packet) {
			debug!("{}@{}: {}", packet.device_id, packet.start, e);
		}
		Ok(packet)
	}

	/// Resolve, extract and fold one decoded packet.
	pub fn fold_packet(&self, packet: &Packet) -> Outcome {
		let arrival = self.arrival.fetch_add(1, Ordering::SeqCst);
		self.fold_arrived(packet, arrival)
	}

	/// Fold a packet which was handed in as the `arrival`th.
	fn fold_arrived(&self, packet: &Packet, arrival: u64) -> Outcome {
		if let Some(sync) = stats::summarize(&packet.exchanges) {
			debug!(
				"{}@{}: {} exchanges, best latency {}µs, offset {:.0}µs ± {:.0}µs, travel time {:?}µs",
				packet.device_id, packet.start,
				sync.exchanges, sync.best_latency, sync.mean_offset, sync.offset_std,
				stats::travel_time(packet, &sync),
			);
		}
		let resolved = self.clocks.resolve(packet);
		let extraction = extract(packet, &resolved.model, arrival);
		match self.index.index(&extraction) {
			Ok(Some(report)) => {
				debug!("{}: {} samples from {} channels", extraction.packet, report.added, extraction.blocks.len());
				Outcome::Ingested{
					id: extraction.packet,
					grade: resolved.model.grade,
					fault: resolved.fault,
					report,
				}
			},
			Ok(None) => Outcome::Duplicate{id: extraction.packet},
			Err(error) => {
				warn!("skipping {}: {}", extraction.packet, error);
				Outcome::Skipped{reason: SkipReason::Fold{id: extraction.packet, error}}
			},
		}
	}

	/// Run the whole pipeline for a single packet.
	pub fn ingest_packet(&self, raw: &[u8]) -> Outcome {
		match packet::decode(raw) {
			Ok(packet) => self.fold_packet(&packet),
			Err(e) => {
				warn!("skipping packet: {}", e);
				Outcome::Skipped{reason: SkipReason::Decode(e)}
			},
		}
	}

	/// Ingest a batch of packets. Outcomes are returned in input order.
	///
	/// Packets count as arriving in input order, whatever order they are
	/// folded in. Once `cancel` trips, no further packet is folded; those
	/// report `Cancelled`. Packets folded before remain indexed.
	pub async fn ingest(self: Arc<Self>, batch: Vec<Bytes>, cancel: CancelFlag) -> Vec<Outcome> {
		let total = batch.len();
		let base = self.arrival.fetch_add(total as u64, Ordering::SeqCst);
		let mut outcomes: Vec<Option<Outcome>> = (0..total).map(|_| None).collect();

		let (tx, mut rx) = mpsc::channel(self.config.ingest.queue_depth.max(1));
		for (i, raw) in batch.into_iter().enumerate() {
			let engine = self.clone();
			let tx = tx.clone();
			tokio::spawn(async move {
				let prepared = match spawn_blocking(move || engine.prepare(&raw[..])).await {
					Ok(Ok(packet)) => Ok(packet),
					Ok(Err(e)) => Err(SkipReason::Decode(e)),
					Err(e) => Err(SkipReason::Worker(e.to_string())),
				};
				// the receiver only goes away if the ingest itself was dropped
				let _ = tx.send((i, prepared)).await;
			});
		}
		drop(tx);

		let mut per_device: BTreeMap<SmartString, Vec<(usize, Packet)>> = BTreeMap::new();
		while let Some((i, prepared)) = rx.recv().await {
			match prepared {
				Ok(packet) => per_device.entry(packet.device_id.clone()).or_insert_with(Vec::new).push((i, packet)),
				Err(reason) => {
					warn!("skipping packet {} of batch: {}", i, reason);
					outcomes[i] = Some(Outcome::Skipped{reason});
				},
			}
		}

		let mut folders = Vec::with_capacity(per_device.len());
		for (device, mut packets) in per_device.into_iter() {
			packets.sort_by_key(|(i, p)| (p.start, *i));
			let engine = self.clone();
			let cancel = cancel.clone();
			debug!("folding {} packets of {}", packets.len(), device);
			folders.push(tokio::spawn(async move {
				let mut done = Vec::with_capacity(packets.len());
				for (i, packet) in packets.into_iter() {
					if cancel.is_cancelled() {
						done.push((i, Outcome::Cancelled{device: packet.device_id, start: packet.start}));
						continue;
					}
					done.push((i, engine.fold_arrived(&packet, base + i as u64)));
					tokio::task::yield_now().await;
				}
				done
			}));
		}
		for folder in folders.into_iter() {
			match folder.await {
				Ok(done) => {
					for (i, outcome) in done.into_iter() {
						outcomes[i] = Some(outcome);
					}
				},
				Err(e) => warn!("folding task failed: {}", e),
			}
		}

		let outcomes: Vec<Outcome> = outcomes.into_iter().map(|o| match o {
			Some(o) => o,
			None => Outcome::Skipped{reason: SkipReason::Worker("no outcome recorded".into())},
		}).collect();
		info!(
			"ingested {} of {} packets{}",
			outcomes.iter().filter(|o| o.is_ingested()).count(),
			total,
			if cancel.is_cancelled() { " (cancelled)" } else { "" },
		);
		outcomes
	}
}
