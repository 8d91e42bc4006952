/*!
# Continuous streams

A [`ContinuousStream`] holds all samples of one channel of one device on the
reference timeline, as an ordered list of runs. Within a run, consecutive
samples are at most `period * (1 + tolerance)` apart; between two runs lies
a gap. Gaps are not stored but derived from the runs, so a fold which fills
a gap closes it without further bookkeeping.

Runs are shared (`Arc`) so that a snapshot of a stream is a cheap clone and
a fold only rebuilds the runs it touches.

When an incoming sample collides with a stored one (their times are less
than half a period apart), the one from the packet with the better clock
confidence is kept; on equal confidence, the later arrival wins. If the
values differ, a [`Conflict`] is reported.
*/
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use log::{trace, warn};

use smartstring::alias::{String as SmartString};

use crate::channel::{Origin, SampleBlock};
use crate::packet::{ChannelKind, Micros, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldError {
	InvalidTimeRange{start: Micros, end: Micros},
}

impl fmt::Display for FoldError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::InvalidTimeRange{start, end} => write!(f, "invalid time range: {} .. {}", start, end),
		}
	}
}

impl std::error::Error for FoldError {}

/// Reject blocks with an inverted span or unordered samples.
pub fn check(block: &SampleBlock) -> Result<(), FoldError> {
	if block.span.1 < block.span.0 {
		return Err(FoldError::InvalidTimeRange{start: block.span.0, end: block.span.1})
	}
	for pair in block.samples.windows(2) {
		if pair[1].time <= pair[0].time {
			return Err(FoldError::InvalidTimeRange{start: pair[0].time, end: pair[1].time})
		}
	}
	Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredSample {
	pub time: Micros,
	pub value: Value,
	pub origin: Origin,
}

/// Samples without a gap between them. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
	period: u32,
	samples: Vec<StoredSample>,
}

impl Run {
	pub fn start(&self) -> Micros {
		self.samples[0].time
	}

	/// Exclusive end: one period past the last sample.
	pub fn end(&self) -> Micros {
		self.last().saturating_add(self.period as i64)
	}

	fn last(&self) -> Micros {
		self.samples[self.samples.len() - 1].time
	}

	pub fn len(&self) -> usize {
		self.samples.len()
	}

	pub fn samples(&self) -> &[StoredSample] {
		&self.samples
	}

	/// Index of the first sample at or after `t`.
	pub fn position(&self, t: Micros) -> usize {
		self.samples.partition_point(|s| s.time < t)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
	pub start: Micros,
	pub end: Micros,
}

impl fmt::Display for Gap {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		write!(f, "[{}, {})", self.start, self.end)
	}
}

/// Two different values for the same instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
	pub kind: ChannelKind,
	pub time: Micros,
	pub kept: Value,
	pub kept_from: Origin,
	pub discarded: Value,
	pub discarded_from: Origin,
}

impl fmt::Display for Conflict {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"{} conflict at {}: kept {} from {:016x} ({}), discarded {} from {:016x} ({})",
			self.kind, self.time,
			self.kept, self.kept_from.digest, self.kept_from.confidence,
			self.discarded, self.discarded_from.digest, self.discarded_from.confidence,
		)
	}
}

/// What a fold did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoldReport {
	/// Incoming samples which are now part of the stream.
	pub added: usize,
	/// Of those, how many displaced a stored sample.
	pub replaced: usize,
	/// Incoming samples identical to a stored one.
	pub duplicates: usize,
	/// Incoming samples which lost against a stored one.
	pub rejected: usize,
	pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone)]
pub struct ContinuousStream {
	device: SmartString,
	kind: ChannelKind,
	period: u32,
	/// Largest spacing of two samples within one run.
	reach: i64,
	runs: Vec<Arc<Run>>,
}

impl ContinuousStream {
	pub fn new<S: Into<SmartString>>(device: S, kind: ChannelKind, period_us: u32, tolerance: f64) -> Self {
		let period = period_us.max(1);
		Self{
			device: device.into(),
			kind,
			period,
			reach: (period as f64 * (1.0 + tolerance.max(0.0))).floor() as i64,
			runs: Vec::new(),
		}
	}

	pub fn device(&self) -> &str {
		&self.device
	}

	pub fn kind(&self) -> ChannelKind {
		self.kind
	}

	pub fn period_us(&self) -> u32 {
		self.period
	}

	pub fn runs(&self) -> &[Arc<Run>] {
		&self.runs
	}

	pub fn is_empty(&self) -> bool {
		self.runs.is_empty()
	}

	/// Total number of samples.
	pub fn len(&self) -> usize {
		self.runs.iter().map(|r| r.len()).sum()
	}

	/// `[start, end)` of all data.
	pub fn span(&self) -> Option<(Micros, Micros)> {
		match (self.runs.first(), self.runs.last()) {
			(Some(first), Some(last)) => Some((first.start(), last.end())),
			_ => None,
		}
	}

	pub fn gaps(&self) -> Vec<Gap> {
		self.runs.windows(2).map(|pair| Gap{
			start: pair[0].end(),
			end: pair[1].start(),
		}).collect()
	}

	/// Index of the first run ending after `t`.
	pub fn run_at(&self, t: Micros) -> usize {
		self.runs.partition_point(|r| r.end() <= t)
	}

	/// Runs are non-empty, strictly ordered and do not overlap.
	pub fn is_ordered(&self) -> bool {
		self.runs.iter().all(|r| {
			!r.samples.is_empty() && r.samples.windows(2).all(|p| p[0].time < p[1].time)
		}) && self.runs.windows(2).all(|p| p[0].end() <= p[1].start())
	}

	/// Merge a block into the stream.
	///
	/// The block is validated before anything is touched; on error the
	/// stream is unchanged.
	pub fn fold(&mut self, block: &SampleBlock) -> Result<FoldReport, FoldError> {
		check(block)?;

		let mut report = FoldReport::default();
		let (first, last) = match (block.samples.first(), block.samples.last()) {
			(Some(first), Some(last)) => (first.time, last.time),
			_ => return Ok(report),
		};
		if block.period_us != self.period {
			warn!("{}/{}: block period {}µs differs from stream period {}µs", self.device, self.kind, block.period_us, self.period);
		}

		let reach = self.reach;
		let lo = self.runs.partition_point(|r| r.last().saturating_add(reach) < first);
		let hi = self.runs.partition_point(|r| r.start().saturating_sub(reach) <= last);
		trace!("{}/{}: folding {} samples into runs {}..{} of {}", self.device, self.kind, block.len(), lo, hi, self.runs.len());

		let collide = (self.period as i64 / 2).max(1);
		let merged = {
			let mut existing = self.runs[lo..hi].iter().flat_map(|r| r.samples.iter().copied()).peekable();
			let mut incoming = block.samples.iter().map(|s| StoredSample{
				time: s.time,
				value: s.value,
				origin: block.origin,
			}).peekable();
			let capacity = self.runs[lo..hi].iter().map(|r| r.len()).sum::<usize>() + block.len();
			let mut merged: Vec<(StoredSample, bool)> = Vec::with_capacity(capacity);
			loop {
				let take_existing = match (existing.peek(), incoming.peek()) {
					(Some(a), Some(b)) => a.time <= b.time,
					(Some(_), None) => true,
					(None, Some(_)) => false,
					(None, None) => break,
				};
				let (sample, fresh) = if take_existing {
					(existing.next(), false)
				} else {
					(incoming.next(), true)
				};
				if let Some(sample) = sample {
					settle(&mut merged, sample, fresh, collide, self.kind, &mut report);
				}
			}
			merged
		};

		let mut rebuilt = Vec::new();
		let mut current: Vec<StoredSample> = Vec::new();
		for (sample, _) in merged.into_iter() {
			if let Some(prev) = current.last() {
				if sample.time.saturating_sub(prev.time) > reach {
					rebuilt.push(Arc::new(Run{
						period: self.period,
						samples: std::mem::take(&mut current),
					}));
				}
			}
			current.push(sample);
		}
		if !current.is_empty() {
			rebuilt.push(Arc::new(Run{period: self.period, samples: current}));
		}
		let _ = self.runs.splice(lo..hi, rebuilt);
		debug_assert!(self.is_ordered());

		for conflict in report.conflicts.iter() {
			warn!("{}: {}", self.device, conflict);
		}
		Ok(report)
	}
}

/// Append `sample` to `merged`, resolving a collision with the previous
/// sample if they come from different sides.
fn settle(merged: &mut Vec<(StoredSample, bool)>, sample: StoredSample, fresh: bool, collide: i64, kind: ChannelKind, report: &mut FoldReport) {
	let collides = match merged.last() {
		Some((last, last_fresh)) => *last_fresh != fresh && sample.time.saturating_sub(last.time) < collide,
		None => false,
	};
	if !collides {
		if fresh {
			report.added += 1;
		}
		merged.push((sample, fresh));
		return
	}
	let (last, last_fresh) = match merged.last_mut() {
		Some((last, last_fresh)) => (last, last_fresh),
		None => return,
	};

	let (stored, incoming) = if fresh { (*last, sample) } else { (sample, *last) };
	if stored.value.same_as(&incoming.value) {
		if *last_fresh {
			report.added -= 1;
		}
		report.duplicates += 1;
		*last = stored;
		*last_fresh = false;
		return
	}

	let incoming_wins = match incoming.origin.confidence.cmp(&stored.origin.confidence) {
		Ordering::Greater => true,
		Ordering::Less => false,
		Ordering::Equal => incoming.origin.arrival > stored.origin.arrival,
	};
	let (winner, loser) = if incoming_wins { (incoming, stored) } else { (stored, incoming) };
	report.conflicts.push(Conflict{
		kind,
		time: winner.time,
		kept: winner.value,
		kept_from: winner.origin,
		discarded: loser.value,
		discarded_from: loser.origin,
	});

	// `last_fresh` says whether the incoming sample is already counted as added
	match (*last_fresh, incoming_wins) {
		(true, true) => report.replaced += 1,
		(true, false) => {
			report.added -= 1;
			report.rejected += 1;
		},
		(false, true) => {
			report.added += 1;
			report.replaced += 1;
		},
		(false, false) => report.rejected += 1,
	}
	*last = winner;
	*last_fresh = incoming_wins;
}
