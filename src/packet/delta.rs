/*!
Delta coding of audio amplitudes.

The first sample is stored verbatim. Every following sample is stored as
the (wrapping) difference to the first sample, either as a single signed
byte if it fits or as two little-endian bytes otherwise. A leading bitmap,
most significant bit first, tells which samples are short: a set bit means
one byte.

The coding does not carry the number of samples; the block header does.
*/
use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadCoding(pub &'static str);

fn bitmap_len(n: usize) -> usize {
	(n.saturating_sub(1) + 7) / 8
}

fn is_short(bitmap: &[u8], i: usize) -> bool {
	bitmap[i / 8] & (0x80u8 >> (i % 8)) != 0
}

/// Encode `samples[1..]` relative to `samples[0]`.
///
/// Returns the reference sample and the coded bytes (bitmap followed by the
/// offsets). Empty input encodes to a zero reference and no bytes.
pub fn encode(samples: &[i16]) -> (u16, Bytes) {
	let reference = match samples.first() {
		Some(v) => *v as u16,
		None => return (0, Bytes::new()),
	};
	let mut bitmap = vec![0u8; bitmap_len(samples.len())];
	let mut offsets = BytesMut::with_capacity((samples.len() - 1) * 2);
	for (i, v) in samples[1..].iter().enumerate() {
		let offset = (*v as u16).wrapping_sub(reference) as i16;
		match i8::try_from(offset) {
			Ok(short) => {
				bitmap[i / 8] |= 0x80u8 >> (i % 8);
				offsets.put_i8(short);
			},
			Err(_) => offsets.put_i16_le(offset),
		}
	}
	let mut out = BytesMut::with_capacity(bitmap.len() + offsets.len());
	out.put_slice(&bitmap[..]);
	out.put(offsets);
	(reference, out.freeze())
}

/// Inverse of [`encode`] for a block of `n` samples.
///
/// The coding must hold exactly `n` samples; anything shorter or longer is
/// rejected.
pub fn decode(reference: u16, mut coded: Bytes, n: usize) -> Result<Vec<i16>, BadCoding> {
	if n == 0 {
		if coded.has_remaining() {
			return Err(BadCoding("coding present for an empty block"))
		}
		return Ok(Vec::new())
	}
	let nbitmap = bitmap_len(n);
	if coded.remaining() < nbitmap {
		return Err(BadCoding("coding too short for its bitmap"))
	}
	let bitmap = coded.split_to(nbitmap);

	let mut samples = Vec::with_capacity(n);
	samples.push(reference as i16);
	for i in 0..n - 1 {
		let offset = if is_short(&bitmap[..], i) {
			if !coded.has_remaining() {
				return Err(BadCoding("coding holds fewer samples than declared"))
			}
			coded.get_i8() as i16
		} else {
			if coded.remaining() < 2 {
				return Err(BadCoding("coding holds fewer samples than declared"))
			}
			coded.get_i16_le()
		};
		samples.push(reference.wrapping_add(offset as u16) as i16);
	}
	if coded.has_remaining() {
		return Err(BadCoding("coding holds more samples than declared"))
	}
	Ok(samples)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn decode_all(reference: u16, coded: &'static [u8], n: usize) -> Result<Vec<i16>, BadCoding> {
		decode(reference, Bytes::from_static(coded), n)
	}

	#[test]
	fn single_sample() {
		assert_eq!(decode_all(2342, b"", 1).unwrap(), vec![2342]);
		assert_eq!(decode_all(65535, b"", 1).unwrap(), vec![-1]);
	}

	#[test]
	fn long_and_short_offsets() {
		assert_eq!(decode_all(2342, b"\x00\x01\x00\xff\xff", 3).unwrap(), vec![2342, 2343, 2341]);
		assert_eq!(decode_all(2342, b"\xc0\x01\xff", 3).unwrap(), vec![2342, 2343, 2341]);
	}

	#[test]
	fn bitmap_spanning_several_bytes() {
		let got = decode_all(2342, b"\xff\xc0\x01\xff\x01\xff\x01\xff\x01\xff\x01\xff", 11).unwrap();
		let mut expected = vec![2342];
		for _ in 0..5 {
			expected.push(2343);
			expected.push(2341);
		}
		assert_eq!(got, expected);
	}

	#[test]
	fn sample_count_must_match() {
		assert!(decode_all(0, b"\x00\x01", 2).is_err());
		assert!(decode_all(0, b"\xc0\x01\xff", 2).is_err());
		assert!(decode_all(0, b"\xc0\x01", 3).is_err());
		assert!(decode_all(0, b"", 2).is_err());
		assert!(decode_all(0, b"\x00", 0).is_err());
		assert_eq!(decode_all(7, b"", 0).unwrap(), Vec::<i16>::new());
	}

	#[test]
	fn encoder_picks_short_form_when_it_fits() {
		let (reference, coded) = encode(&[100, 101, 99, 30000, -30000]);
		assert_eq!(reference, 100);
		// bitmap: 1, 1, 0, 0 -> 0xc0; then 2x1 byte and 2x2 bytes
		assert_eq!(coded.len(), 1 + 2 + 4);
		assert_eq!(coded[0], 0xc0);
	}

	#[test]
	fn decoder_reverses_encoder_across_the_full_range() {
		let samples: Vec<i16> = vec![0, 1, -1, 127, -128, 128, -129, i16::MAX, i16::MIN, 5, 6, 7, 8, 9, 10, 11, 12];
		let (reference, coded) = encode(&samples);
		assert_eq!(decode(reference, coded, samples.len()).unwrap(), samples);
	}

	#[test]
	fn encode_empty() {
		let (reference, coded) = encode(&[]);
		assert_eq!(reference, 0);
		assert!(coded.is_empty());
	}
}
