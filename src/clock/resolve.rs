use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::{Mutex, PoisonError};

use log::debug;

use smartstring::alias::{String as SmartString};

use crate::packet::{Micros, Packet};

use super::fit::{fit, FitParams};
use super::{ClockModel, Grade, SyncError};

/// A model fitted from another packet of the same device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
	pub start: Micros,
	pub end: Micros,
	pub model: ClockModel,
}

impl Neighbour {
	pub fn midpoint(&self) -> Micros {
		halfway(self.start, self.end)
	}
}

fn halfway(a: Micros, b: Micros) -> Micros {
	((a as i128 + b as i128) / 2) as Micros
}

/// Derive a model for a packet without exchanges from its neighbours.
pub trait Interpolate: fmt::Debug + Send + Sync {
	fn interpolate(&self, at: Micros, prior: Option<&Neighbour>, next: Option<&Neighbour>) -> Option<ClockModel>;
}

/// Blend the corrections of the prior and next model, weighted by distance.
///
/// With only one neighbour, its model is used unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearInterpolation;

impl Interpolate for LinearInterpolation {
	fn interpolate(&self, at: Micros, prior: Option<&Neighbour>, next: Option<&Neighbour>) -> Option<ClockModel> {
		match (prior, next) {
			(None, None) => None,
			(Some(only), None) | (None, Some(only)) => Some(ClockModel{
				grade: Grade::Borrowed,
				..only.model
			}),
			(Some(p), Some(n)) => {
				let (tp, tn) = (p.midpoint(), n.midpoint());
				let w = if tn > tp {
					((at as f64 - tp as f64) / (tn as f64 - tp as f64)).max(0.0).min(1.0)
				} else {
					0.5
				};
				let cp = p.model.correction_at(at) as f64;
				let cn = n.model.correction_at(at) as f64;
				Some(ClockModel{
					pivot: at,
					offset: (cp + w * (cn - cp)).round() as i64,
					drift: p.model.drift + w * (n.model.drift - p.model.drift),
					domain: (p.model.domain.0.min(n.model.domain.0), p.model.domain.1.max(n.model.domain.1)),
					grade: Grade::Borrowed,
					best_latency: p.model.best_latency.max(n.model.best_latency),
				})
			},
		}
	}
}

/// Outcome of resolving a packet's clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolved {
	pub model: ClockModel,
	/// Why the packet's own exchanges were not used, if they were not.
	pub fault: Option<SyncError>,
}

/// Fits and caches clock models per (device, packet start).
#[derive(Debug)]
pub struct ClockResolver {
	params: FitParams,
	neighbourhood: i64,
	interpolate: Box<dyn Interpolate>,
	models: Mutex<HashMap<SmartString, BTreeMap<Micros, Neighbour>>>,
}

impl ClockResolver {
	/// `neighbourhood` bounds the device-time distance to a packet a
	/// neighbour may have to be lent its model.
	pub fn new(params: FitParams, neighbourhood: i64) -> Self {
		Self{
			params,
			neighbourhood,
			interpolate: Box::new(LinearInterpolation),
			models: Mutex::new(HashMap::new()),
		}
	}

	pub fn with_interpolation(mut self, interpolate: Box<dyn Interpolate>) -> Self {
		self.interpolate = interpolate;
		self
	}

	/// Fit the packet's own model and remember it for its neighbours.
	pub fn register(&self, packet: &Packet) -> Result<ClockModel, SyncError> {
		let model = fit(&packet.exchanges, &self.params)?;
		let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
		models.entry(packet.device_id.clone()).or_insert_with(BTreeMap::new).insert(packet.start, Neighbour{
			start: packet.start,
			end: packet.end,
			model,
		});
		Ok(model)
	}

	/// Number of cached models for `device`.
	pub fn cached(&self, device: &str) -> usize {
		let models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
		models.get(device).map(|m| m.len()).unwrap_or(0)
	}

	/// Find the model to correct `packet` with.
	///
	/// Never fails: without any reference the identity model is returned
	/// together with `NoClockReference`.
	pub fn resolve(&self, packet: &Packet) -> Resolved {
		let fault = match self.register(packet) {
			Ok(model) => return Resolved{model, fault: None},
			Err(e) => e,
		};

		let models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
		let (prior, next) = match models.get(&packet.device_id) {
			Some(m) => (
				m.range(..packet.start)
					.next_back()
					.map(|(_, n)| n)
					.filter(|n| packet.start.saturating_sub(n.end) <= self.neighbourhood),
				m.range((Bound::Excluded(packet.start), Bound::Unbounded))
					.next()
					.map(|(_, n)| n)
					.filter(|n| n.start.saturating_sub(packet.end) <= self.neighbourhood),
			),
			None => (None, None),
		};

		let at = halfway(packet.start, packet.end);
		match self.interpolate.interpolate(at, prior, next) {
			Some(model) => {
				debug!("{}@{}: {}, borrowing clock from neighbours", packet.device_id, packet.start, fault);
				Resolved{model, fault: Some(fault)}
			},
			None => {
				debug!("{}@{}: {}, no neighbour within {}µs", packet.device_id, packet.start, fault, self.neighbourhood);
				Resolved{model: ClockModel::identity(), fault: Some(SyncError::NoClockReference)}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packet::SyncExchange;

	fn packet(start: Micros, end: Micros, offsets: &[i64]) -> Packet {
		let mut p = Packet::new("dev", start, end);
		let n = offsets.len().max(2) as i64 - 1;
		for (i, off) in offsets.iter().enumerate() {
			let t = start + (end - start) * i as i64 / n;
			p.exchanges.push(SyncExchange{device_time: t, reference_time: t + off, latency: 10});
		}
		p
	}

	fn resolver() -> ClockResolver {
		ClockResolver::new(FitParams::default(), 10_000_000)
	}

	#[test]
	fn own_exchanges_win() {
		let r = resolver();
		let res = r.resolve(&packet(0, 1_000_000, &[500, 500]));
		assert!(res.fault.is_none());
		assert_eq!(res.model.grade, Grade::Fitted);
		assert_eq!(r.cached("dev"), 1);
	}

	#[test]
	fn lonely_packet_has_no_reference() {
		let r = resolver();
		let res = r.resolve(&packet(0, 1_000_000, &[]));
		assert_eq!(res.fault, Some(SyncError::NoClockReference));
		assert_eq!(res.model.grade, Grade::Uncorrected);
		assert_eq!(res.model.apply(77).time, 77);
	}

	#[test]
	fn interpolates_between_neighbours() {
		let r = resolver();
		r.register(&packet(0, 1_000_000, &[1_000, 1_000])).unwrap();
		r.register(&packet(2_000_000, 3_000_000, &[3_000, 3_000])).unwrap();
		let res = r.resolve(&packet(1_000_000, 2_000_000, &[]));
		assert_eq!(res.fault, Some(SyncError::InsufficientSyncData{have: 0}));
		assert_eq!(res.model.grade, Grade::Borrowed);
		// midway between the two neighbours' midpoints
		assert_eq!(res.model.apply(1_500_000).time, 1_502_000);
	}

	#[test]
	fn single_neighbour_is_lent_unchanged() {
		let r = resolver();
		r.register(&packet(0, 1_000_000, &[1_000, 1_000])).unwrap();
		let res = r.resolve(&packet(1_000_000, 2_000_000, &[]));
		assert_eq!(res.model.grade, Grade::Borrowed);
		assert_eq!(res.model.apply(1_500_000).time, 1_501_000);
		assert!(res.model.apply(1_500_000).extrapolated);
	}

	#[test]
	fn neighbours_out_of_reach_are_ignored() {
		let r = ClockResolver::new(FitParams::default(), 1_000);
		r.register(&packet(0, 1_000_000, &[1_000, 1_000])).unwrap();
		let res = r.resolve(&packet(5_000_000, 6_000_000, &[]));
		assert_eq!(res.fault, Some(SyncError::NoClockReference));
	}

	#[test]
	fn other_devices_are_not_neighbours() {
		let r = resolver();
		let mut other = packet(0, 1_000_000, &[1_000, 1_000]);
		other.device_id = "other".into();
		r.register(&other).unwrap();
		let res = r.resolve(&packet(1_000_000, 2_000_000, &[]));
		assert_eq!(res.fault, Some(SyncError::NoClockReference));
	}

	#[derive(Debug)]
	struct PriorOnly;

	impl Interpolate for PriorOnly {
		fn interpolate(&self, _at: Micros, prior: Option<&Neighbour>, _next: Option<&Neighbour>) -> Option<ClockModel> {
			prior.map(|p| ClockModel{grade: Grade::Borrowed, ..p.model})
		}
	}

	#[test]
	fn interpolation_is_replaceable() {
		let r = resolver().with_interpolation(Box::new(PriorOnly));
		r.register(&packet(0, 1_000_000, &[1_000, 1_000])).unwrap();
		r.register(&packet(2_000_000, 3_000_000, &[3_000, 3_000])).unwrap();
		let res = r.resolve(&packet(1_000_000, 2_000_000, &[]));
		assert_eq!(res.model.apply(1_500_000).time, 1_501_000);
	}

	#[test]
	fn neighbours_across_the_whole_timeline_do_not_overflow() {
		let r = ClockResolver::new(FitParams::default(), i64::MAX);
		let mut early = Packet::new("dev", i64::MIN, i64::MIN + 10);
		early.exchanges.push(SyncExchange{device_time: i64::MIN, reference_time: 0, latency: 1});
		let mut late = Packet::new("dev", i64::MAX - 10, i64::MAX);
		late.exchanges.push(SyncExchange{device_time: i64::MAX, reference_time: 0, latency: 1});
		r.register(&early).unwrap();
		r.register(&late).unwrap();
		let res = r.resolve(&Packet::new("dev", -5, i64::MAX - 20));
		assert_eq!(res.model.grade, Grade::Borrowed);
		assert_eq!(Neighbour{start: i64::MIN, end: i64::MAX, model: res.model}.midpoint(), 0);
	}
}
