use bytes::{Buf, BufMut, Bytes, BytesMut};

use log::trace;

use super::frame;
use super::{DecodeError, Packet};

pub const MAGIC: [u8; 4] = *b"SSPK";
pub const FORMAT_VERSION: u8 = 0x01;

/// Upper bound for the declared body length, checked before allocating.
pub const MAX_BODY_LEN: usize = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
	pub version: u8,
	pub flags: u8,
	pub body_len: u32,
	pub checksum: u64,
}

impl Envelope {
	pub const RAW_LEN: usize =
		MAGIC.len() +
		std::mem::size_of::<u8>() +
		std::mem::size_of::<u8>() +
		std::mem::size_of::<u32>() +
		std::mem::size_of::<u64>();

	pub fn read<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		if r.remaining() < Self::RAW_LEN {
			return Err(DecodeError::CorruptPacket("not enough bytes for packet envelope".into()))
		}

		let mut magic = [0u8; 4];
		r.copy_to_slice(&mut magic[..]);
		if magic != MAGIC {
			return Err(DecodeError::CorruptPacket(format!("bad magic {:02x?}", magic)))
		}

		let version = r.get_u8();
		let flags = r.get_u8();
		if version != FORMAT_VERSION || flags != 0 {
			return Err(DecodeError::UnsupportedFormat{version, flags})
		}

		let body_len = r.get_u32_le();
		let checksum = r.get_u64_le();
		Ok(Self{
			version,
			flags,
			body_len,
			checksum,
		})
	}

	pub fn write<W: BufMut>(&self, w: &mut W) {
		w.put_slice(&MAGIC[..]);
		w.put_u8(self.version);
		w.put_u8(self.flags);
		w.put_u32_le(self.body_len);
		w.put_u64_le(self.checksum);
	}
}

/// Decode one packet.
///
/// Nothing is parsed from the body before its declared length and checksum
/// have been verified against the decompressed bytes.
pub fn decode(raw: &[u8]) -> Result<Packet, DecodeError> {
	let mut r = raw;
	let envelope = Envelope::read(&mut r)?;
	let declared = envelope.body_len as usize;
	if declared > MAX_BODY_LEN {
		return Err(DecodeError::CorruptPacket(format!("declared body length {} exceeds maximum {}", declared, MAX_BODY_LEN)))
	}

	let body = match lz4_flex::block::decompress(r, declared) {
		Ok(b) => b,
		Err(e) => return Err(DecodeError::CorruptPacket(format!("decompression failed: {}", e))),
	};
	if body.len() != declared {
		return Err(DecodeError::CorruptPacket(format!("body is {} bytes, {} declared", body.len(), declared)))
	}
	let checksum = seahash::hash(&body[..]);
	if checksum != envelope.checksum {
		return Err(DecodeError::CorruptPacket(format!("checksum mismatch: {:016x} != {:016x}", checksum, envelope.checksum)))
	}

	trace!("decoded envelope {:?} ({} compressed bytes)", envelope, r.len());
	frame::read_body(Bytes::from(body), envelope.version)
}

/// Encode one packet. The result decodes to a packet equal to `packet`.
pub fn encode(packet: &Packet) -> Result<Bytes, DecodeError> {
	if packet.version != FORMAT_VERSION {
		return Err(DecodeError::UnsupportedFormat{version: packet.version, flags: 0})
	}
	if let Err(why) = packet.check() {
		return Err(DecodeError::InvalidPacket(why))
	}

	let body = frame::write_body(packet);
	if body.len() > MAX_BODY_LEN {
		return Err(DecodeError::InvalidPacket(format!("body of {} bytes exceeds maximum {}", body.len(), MAX_BODY_LEN)))
	}
	let envelope = Envelope{
		version: packet.version,
		flags: 0,
		body_len: body.len() as u32,
		checksum: seahash::hash(&body[..]),
	};
	let compressed = lz4_flex::block::compress(&body[..]);

	let mut w = BytesMut::with_capacity(Envelope::RAW_LEN + compressed.len());
	envelope.write(&mut w);
	w.put_slice(&compressed[..]);
	Ok(w.freeze())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packet::testutil::*;
	use crate::packet::{ChannelBlock, ChannelKind, Location, RawData, SyncExchange, ValueKind};

	use rand::seq::SliceRandom;
	use rand::{Rng, SeedableRng};
	use rand_xoshiro::Xoshiro256PlusPlus;

	fn sample_packet() -> Packet {
		let mut p = with_offset(audio_packet("station-7", 0, 125, &[0, 1, 2, 3, -4, 500, -500, 7]), 1_600_000_000_000_000);
		p.blocks.push(ChannelBlock{
			kind: ChannelKind::Magnetometer,
			period_us: 200,
			timestamps: vec![0, 200, 400],
			data: RawData::Xyz(vec![[1.0, 2.0, 3.0], [1.5, 2.5, 3.5], [f64::INFINITY, -0.0, 1e-300]]),
		});
		p
	}

	fn rewrite_header(raw: &Bytes, f: impl FnOnce(&mut Envelope)) -> Bytes {
		let mut r = &raw[..];
		let mut env = Envelope::read(&mut r).unwrap();
		f(&mut env);
		let mut w = BytesMut::new();
		env.write(&mut w);
		w.put_slice(r);
		w.freeze()
	}

	#[test]
	fn times_out_of_range_are_corrupt() {
		let mut p = sample_packet();
		p.exchanges.push(SyncExchange{device_time: 2_000, reference_time: i64::MAX, latency: 0});
		assert!(matches!(encode(&p), Err(DecodeError::InvalidPacket(_))));
		match decode(&encode_unchecked(&p)[..]) {
			Err(DecodeError::CorruptPacket(why)) => assert!(why.contains("out of range")),
			other => panic!("unexpected result: {:?}", other),
		}

		let mut p = sample_packet();
		p.blocks[0].timestamps[7] = i64::MAX - 5;
		p.end = i64::MAX;
		assert!(matches!(decode(&encode_unchecked(&p)[..]), Err(DecodeError::CorruptPacket(_))));

		let p = sample_packet();
		assert_eq!(decode(&encode_unchecked(&p)[..]).unwrap(), p);
	}

	#[test]
	fn decode_reverses_encode() {
		let p = sample_packet();
		let raw = encode(&p).unwrap();
		assert_eq!(decode(&raw[..]).unwrap(), p);
	}

	#[test]
	fn declared_length_mismatch_is_corrupt() {
		let raw = encode(&sample_packet()).unwrap();
		for delta in [-1i64, 1, 1000].iter() {
			let raw = rewrite_header(&raw, |env| env.body_len = (env.body_len as i64 + delta) as u32);
			match decode(&raw[..]) {
				Err(DecodeError::CorruptPacket(_)) => (),
				other => panic!("unexpected result for length delta {}: {:?}", delta, other),
			}
		}
	}

	#[test]
	fn oversized_declared_length_is_corrupt() {
		let raw = rewrite_header(&encode(&sample_packet()).unwrap(), |env| env.body_len = u32::MAX);
		match decode(&raw[..]) {
			Err(DecodeError::CorruptPacket(why)) => assert!(why.contains("exceeds")),
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[test]
	fn checksum_mismatch_is_corrupt() {
		let raw = rewrite_header(&encode(&sample_packet()).unwrap(), |env| env.checksum ^= 1);
		match decode(&raw[..]) {
			Err(DecodeError::CorruptPacket(why)) => assert!(why.contains("checksum")),
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[test]
	fn unknown_version_is_unsupported() {
		let raw = rewrite_header(&encode(&sample_packet()).unwrap(), |env| env.version = 2);
		match decode(&raw[..]) {
			Err(DecodeError::UnsupportedFormat{version: 2, ..}) => (),
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[test]
	fn unknown_flags_are_unsupported() {
		let raw = rewrite_header(&encode(&sample_packet()).unwrap(), |env| env.flags = 0x80);
		match decode(&raw[..]) {
			Err(DecodeError::UnsupportedFormat{flags: 0x80, ..}) => (),
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[test]
	fn bad_magic_and_short_input_are_corrupt() {
		let mut raw = BytesMut::from(&encode(&sample_packet()).unwrap()[..]);
		raw[0] = b'X';
		assert!(matches!(decode(&raw[..]), Err(DecodeError::CorruptPacket(_))));
		assert!(matches!(decode(&b"SSPK"[..]), Err(DecodeError::CorruptPacket(_))));
		assert!(matches!(decode(&[0u8; 0][..]), Err(DecodeError::CorruptPacket(_))));
	}

	#[test]
	fn damaged_payload_is_corrupt() {
		let raw = encode(&sample_packet()).unwrap();
		let mut damaged = BytesMut::from(&raw[..]);
		let last = damaged.len() - 1;
		damaged[last] ^= 0x55;
		damaged.truncate(last - 3);
		assert!(matches!(decode(&damaged[..]), Err(DecodeError::CorruptPacket(_))));
	}

	#[test]
	fn encode_refuses_invalid_packets() {
		let mut p = sample_packet();
		p.device_id = "".into();
		assert!(matches!(encode(&p), Err(DecodeError::InvalidPacket(_))));

		let mut p = sample_packet();
		p.version = 9;
		assert!(matches!(encode(&p), Err(DecodeError::UnsupportedFormat{version: 9, ..})));
	}

	fn random_audio<R: Rng>(rng: &mut R, n: usize) -> Vec<i16> {
		let reference: i16 = rng.gen();
		// offsets around the one/two byte boundary of the delta coding
		let offsets = [0i16, 1, -1, 127, -128, 128, -129, 255, i16::MAX, i16::MIN];
		(0..n).map(|_| {
			if rng.gen_bool(0.7) {
				reference.wrapping_add(*offsets.choose(rng).unwrap())
			} else {
				rng.gen()
			}
		}).collect()
	}

	fn random_block<R: Rng>(rng: &mut R, kind: ChannelKind, start: i64) -> ChannelBlock {
		let n = *[0usize, 1, 2, 17, 300].choose(rng).unwrap();
		let period_us = rng.gen_range(1..2_000_000u32);
		let mut t = start;
		let timestamps: Vec<i64> = (0..n).map(|_| {
			t += rng.gen_range(1..=period_us as i64 * 2);
			t
		}).collect();
		let f = |rng: &mut R| rng.gen_range(-1e6..1e6f64);
		let data = match kind.value_kind() {
			ValueKind::Audio => RawData::Audio(random_audio(rng, n)),
			ValueKind::Scalar => RawData::Scalar((0..n).map(|_| f(rng)).collect()),
			ValueKind::Xyz => RawData::Xyz((0..n).map(|_| [f(rng), f(rng), f(rng)]).collect()),
			ValueKind::Location => RawData::Location((0..n).map(|_| Location{
				latitude: rng.gen_range(-90.0..90.0),
				longitude: rng.gen_range(-180.0..180.0),
				altitude: f(rng),
				accuracy: rng.gen_range(0.0..100.0),
			}).collect()),
		};
		ChannelBlock{kind, period_us, timestamps, data}
	}

	fn random_packet<R: Rng>(rng: &mut R) -> Packet {
		let id_len = rng.gen_range(1..24);
		let device: String = (0..id_len).map(|_| *['a', 'Z', '7', '-', 'ß', '端'].choose(rng).unwrap()).collect();
		let start = rng.gen_range(-1_000_000_000_000_000i64..2_000_000_000_000_000);
		let mut p = Packet::new(device.as_str(), start, start);
		if rng.gen_bool(0.5) {
			p.server_arrival = Some(start + rng.gen_range(0..10_000_000_000i64));
		}

		let nexchanges = *[0usize, 1, 2, 5, 40].choose(rng).unwrap();
		let mut t = start;
		for _ in 0..nexchanges {
			t += rng.gen_range(0..1_000_000i64);
			p.exchanges.push(SyncExchange{
				device_time: t,
				reference_time: t + rng.gen_range(-1_000_000_000i64..1_000_000_000),
				latency: rng.gen_range(0..100_000),
			});
		}

		let mut kinds = ChannelKind::ALL.to_vec();
		kinds.shuffle(rng);
		let nblocks = rng.gen_range(0..=kinds.len());
		for kind in kinds.into_iter().take(nblocks) {
			p.blocks.push(random_block(rng, kind, start));
		}
		p.end = p.blocks.iter()
			.filter_map(|b| b.timestamps.last().copied())
			.chain(std::iter::once(t))
			.max()
			.unwrap_or(start) + rng.gen_range(0..1_000_000i64);
		p
	}

	#[test]
	fn decode_reverses_encode_for_random_packets() {
		let mut rng = Xoshiro256PlusPlus::seed_from_u64(0xc0dec);
		for round in 0..200 {
			let p = random_packet(&mut rng);
			assert!(p.check().is_ok(), "round {} generated an invalid packet", round);
			let raw = encode(&p).unwrap();
			assert_eq!(decode(&raw[..]).unwrap(), p, "round {}", round);
		}
	}
}
