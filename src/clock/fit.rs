use log::trace;

use crate::packet::{Micros, SyncExchange};

use super::{ClockModel, Grade, SyncError};

#[derive(Debug, Clone, Copy)]
pub struct FitParams {
	/// Share of exchanges (lowest latency first) used for fitting.
	pub best_fraction: f64,
	/// Added to every latency before weighting.
	pub latency_floor_us: u64,
}

impl Default for FitParams {
	fn default() -> Self {
		Self{
			best_fraction: 0.5,
			latency_floor_us: 1000,
		}
	}
}

fn offset_only(x: &SyncExchange, domain: (Micros, Micros)) -> ClockModel {
	ClockModel{
		pivot: x.device_time,
		offset: x.offset(),
		drift: 0.0,
		domain,
		grade: Grade::OffsetOnly,
		best_latency: x.latency,
	}
}

/// Fit a clock model to a packet's exchanges.
///
/// Exchanges are ranked by latency and only the best `best_fraction` of
/// them (at least two) enter a weighted least squares fit of the offset
/// against device-time, with weights falling with latency.
pub fn fit(exchanges: &[SyncExchange], params: &FitParams) -> Result<ClockModel, SyncError> {
	let domain = match (exchanges.iter().map(|x| x.device_time).min(), exchanges.iter().map(|x| x.device_time).max()) {
		(Some(lo), Some(hi)) => (lo, hi),
		_ => return Err(SyncError::InsufficientSyncData{have: 0}),
	};
	if exchanges.len() == 1 {
		return Ok(offset_only(&exchanges[0], domain))
	}

	let mut ranked: Vec<&SyncExchange> = exchanges.iter().collect();
	ranked.sort_by_key(|x| x.latency);
	let keep = ((exchanges.len() as f64 * params.best_fraction).ceil() as usize)
		.max(2)
		.min(exchanges.len());
	let selected = &ranked[..keep];
	let best = selected[0];

	// all arithmetic relative to the best exchange keeps the f64s small
	let x_ref = best.device_time;
	let y_ref = best.offset();
	let floor = params.latency_floor_us.max(1) as f64;
	let mut sw = 0.0f64;
	let mut swx = 0.0f64;
	let mut swy = 0.0f64;
	for x in selected.iter() {
		let w = 1.0 / (x.latency as f64 + floor);
		sw += w;
		swx += w * x.device_time.saturating_sub(x_ref) as f64;
		swy += w * x.offset().saturating_sub(y_ref) as f64;
	}
	let x_mean = swx / sw;
	let y_mean = swy / sw;

	let mut sxx = 0.0f64;
	let mut sxy = 0.0f64;
	for x in selected.iter() {
		let w = 1.0 / (x.latency as f64 + floor);
		let dx = x.device_time.saturating_sub(x_ref) as f64 - x_mean;
		let dy = x.offset().saturating_sub(y_ref) as f64 - y_mean;
		sxx += w * dx * dx;
		sxy += w * dx * dy;
	}

	let pivot = x_ref.saturating_add(x_mean.round() as i64);
	if sxx <= 0.0 {
		// all selected exchanges at the same device-time: no slope to be had
		trace!("degenerate exchange set at {}, fitting offset only", pivot);
		return Ok(ClockModel{
			pivot,
			offset: y_ref.saturating_add(y_mean.round() as i64),
			drift: 0.0,
			domain,
			grade: Grade::OffsetOnly,
			best_latency: best.latency,
		})
	}

	let drift = sxy / sxx;
	let at_pivot = y_mean + drift * (pivot.saturating_sub(x_ref) as f64 - x_mean);
	Ok(ClockModel{
		pivot,
		offset: y_ref.saturating_add(at_pivot.round() as i64),
		drift,
		domain,
		grade: Grade::Fitted,
		best_latency: best.latency,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	use rand::SeedableRng;
	use rand_distr::{Distribution, Exp};
	use rand_xoshiro::Xoshiro256PlusPlus;

	fn x(device_time: Micros, offset: i64, latency: u64) -> SyncExchange {
		SyncExchange{
			device_time,
			reference_time: device_time + offset,
			latency,
		}
	}

	#[test]
	fn no_exchanges_is_insufficient() {
		assert_eq!(fit(&[], &FitParams::default()), Err(SyncError::InsufficientSyncData{have: 0}));
	}

	#[test]
	fn single_exchange_is_offset_only() {
		let m = fit(&[x(1_000, 250, 30)], &FitParams::default()).unwrap();
		assert_eq!(m.grade, Grade::OffsetOnly);
		assert_eq!(m.drift, 0.0);
		assert_eq!(m.apply(1_000).time, 1_250);
		assert_eq!(m.apply(50_000).time, 50_250);
		assert_eq!(m.best_latency, 30);
	}

	#[test]
	fn two_exchanges_give_offset_and_drift() {
		let m = fit(&[x(0, 100, 5), x(1_000_000, 110, 5)], &FitParams::default()).unwrap();
		assert_eq!(m.grade, Grade::Fitted);
		assert!((m.drift - 1e-5).abs() < 1e-12);
		assert_eq!(m.apply(0).time, 100);
		assert_eq!(m.apply(500_000).time, 500_105);
		assert_eq!(m.apply(1_000_000).time, 1_000_110);
	}

	#[test]
	fn high_latency_outliers_are_ignored() {
		let exchanges = vec![
			x(0, 1_000, 10),
			x(100_000, 9_000, 4_000),
			x(200_000, 1_000, 12),
			x(300_000, -7_000, 5_000),
			x(400_000, 1_000, 11),
			x(500_000, 8_000, 3_000),
		];
		let m = fit(&exchanges, &FitParams::default()).unwrap();
		assert_eq!(m.best_latency, 10);
		assert!(m.drift.abs() < 1e-9);
		assert_eq!(m.apply(250_000).time, 251_000);
	}

	#[test]
	fn same_device_time_degrades_to_offset_only() {
		let m = fit(&[x(5_000, 10, 1), x(5_000, 20, 1)], &FitParams::default()).unwrap();
		assert_eq!(m.grade, Grade::OffsetOnly);
		assert_eq!(m.apply(5_000).time, 5_015);
	}

	#[test]
	fn large_epoch_offsets_stay_exact() {
		let epoch = 1_600_000_000_000_000i64;
		let m = fit(&[x(0, epoch, 0), x(10_000_000, epoch, 0)], &FitParams::default()).unwrap();
		assert_eq!(m.apply(5_000_000).time, epoch + 5_000_000);
	}

	#[test]
	fn recovers_drift_under_latency_jitter() {
		let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x5eed);
		let jitter = Exp::new(1.0 / 2_000.0).unwrap();
		let true_offset = 42_000i64;
		let true_drift = 20e-6;
		let mut exchanges = Vec::new();
		for i in 0..40 {
			let t = i * 1_000_000i64;
			let latency: f64 = jitter.sample(&mut rng);
			// latency delays the reading of the reference clock
			let observed = true_offset + (true_drift * t as f64).round() as i64 + latency.round() as i64;
			exchanges.push(x(t, observed, latency.round() as u64));
		}
		let m = fit(&exchanges, &FitParams::default()).unwrap();
		let err_start = m.correction_at(0) - true_offset;
		let err_end = m.correction_at(39_000_000) - (true_offset + 780);
		assert!(err_start.abs() < 2_000, "offset error {}", err_start);
		assert!(err_end.abs() < 2_000, "offset error at end {}", err_end);
	}

	#[test]
	fn extreme_exchanges_do_not_overflow() {
		let exchanges = [
			SyncExchange{device_time: i64::MIN, reference_time: i64::MAX, latency: 0},
			SyncExchange{device_time: i64::MAX, reference_time: i64::MIN, latency: 0},
		];
		let m = fit(&exchanges, &FitParams::default()).unwrap();
		assert_eq!(m.domain, (i64::MIN, i64::MAX));
		let _ = m.apply(0);
		let _ = m.apply(i64::MAX);
		let single = fit(&exchanges[..1], &FitParams::default()).unwrap();
		assert_eq!(single.offset, i64::MAX);
		assert_eq!(single.apply(0).time, i64::MAX);
	}
}
