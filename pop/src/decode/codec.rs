//! Bit-level fixed-point codecs merging one refinement level into a result buffer.
//!
//! Every quantized attribute is an unsigned fixed-point integer as wide as a result element. Level 0 carries its most significant bits
//! and each further level the next, less significant, slice: merging a level is a bitwise OR of disjoint bit ranges.

use thiserror::Error;

use crate::refine::{Layout, ResultBuffer};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("level {level} exceeds the precision of {element_bits}-bit elements for {bits} bit(s) per level")]
    LevelOutOfRange { level: u32, bits: u32, element_bits: u32 },
}

/// An unsigned result buffer element.
pub trait Element: Copy {
    const BITS: u32;

    fn to_u32(self) -> u32;

    /// Truncate `value` to the element width.
    fn from_u32(value: u32) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                const BITS: u32 = <$ty>::BITS;

                #[inline]
                fn to_u32(self) -> u32 {
                    self as u32
                }

                #[inline]
                fn from_u32(value: u32) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_element!(u8, u16, u32);

/// The decode algorithm selected for a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Any layout, bit by bit.
    Generic,
    /// 3 position components at 2 bits and 2 texture coordinates at 1 bit per level, one byte per vertex.
    PositionTexcoord,
    /// 3 position components at 2 bits per level, one byte per vertex, with face normals derived per triangle.
    PositionNormal,
}

impl Codec {
    pub fn select(layout: &Layout) -> Self {
        match (&layout.component_counts[..], &layout.bits_per_level[..], &layout.read_offsets[..]) {
            ([3, 2], [2, 1], [0, 6]) => Codec::PositionTexcoord,
            ([3, 3], [2, 0], [0, _]) => Codec::PositionNormal,
            _ => Codec::Generic,
        }
    }
}

/// Merge `input`, the data of refinement `level`, into `result`.
///
/// Returns the number of decoded vertices.
pub fn decode(level: u32, layout: &Layout, input: &[u8], result: &mut ResultBuffer) -> Result<usize, CodecError> {
    match result {
        ResultBuffer::U8(data) => decode_into(level, layout, input, data),
        ResultBuffer::U16(data) => decode_into(level, layout, input, data),
        ResultBuffer::U32(data) => decode_into(level, layout, input, data),
    }
}

fn decode_into<T: Element>(level: u32, layout: &Layout, input: &[u8], result: &mut [T]) -> Result<usize, CodecError> {
    match Codec::select(layout) {
        Codec::Generic => decode_generic(level, layout, input, result),
        Codec::PositionTexcoord => decode_position_texcoord(level, layout, input, result),
        Codec::PositionNormal => decode_position_normal(level, layout, input, result),
    }
}

/// Bit position, in a `T` element, of the slice a level contributes.
fn shift<T: Element>(level: u32, bits: u32) -> Result<u32, CodecError> {
    level
        .checked_add(1)
        .and_then(|levels| levels.checked_mul(bits))
        .and_then(|used| T::BITS.checked_sub(used))
        .ok_or(CodecError::LevelOutOfRange {
            level,
            bits,
            element_bits: T::BITS,
        })
}

#[inline]
fn merge<T: Element>(slot: &mut T, value: u32, shift: u32) {
    *slot = T::from_u32(slot.to_u32() | ((value as u64) << shift) as u32);
}

/// MSB-first reader over a byte stream.
struct BitReader<'a> {
    bytes: &'a [u8],
}

impl BitReader<'_> {
    /// Read `count` bits starting `offset` bits into the stream; missing bits read as zeros.
    fn read(&self, offset: usize, count: u32) -> u32 {
        (offset..offset + count as usize).fold(0u64, |value, bit| {
            let byte = self.bytes.get(bit / 8).copied().unwrap_or_default();
            (value << 1) | u64::from((byte >> (7 - bit % 8)) & 1)
        }) as u32
    }
}

pub fn decode_generic<T: Element>(level: u32, layout: &Layout, input: &[u8], result: &mut [T]) -> Result<usize, CodecError> {
    let record_bits = layout.record_bits();

    if record_bits == 0 {
        return Ok(0);
    }

    let shifts = layout
        .bits_per_level
        .iter()
        .map(|&bits| if bits == 0 { Ok(0) } else { shift::<T>(level, bits) })
        .collect::<Result<Vec<_>, _>>()?;

    let vertices = (input.len() * 8 / record_bits).min(result.len() / layout.stride);
    let reader = BitReader { bytes: input };

    for v in 0..vertices {
        let record = v * record_bits;
        let vertex = v * layout.stride;

        for (i, &shift) in shifts.iter().enumerate() {
            let bits = layout.bits_per_level[i];

            if bits == 0 {
                continue;
            }

            for c in 0..layout.component_counts[i] {
                let value = reader.read(record + layout.read_offsets[i] + c * bits as usize, bits);
                merge(&mut result[vertex + layout.write_offsets[i] + c], value, shift);
            }
        }
    }

    Ok(vertices)
}

/// Positions `xxyyzz` then texture coordinates `uv`, packed in one byte per vertex.
pub fn decode_position_texcoord<T: Element>(level: u32, layout: &Layout, input: &[u8], result: &mut [T]) -> Result<usize, CodecError> {
    let position_shift = shift::<T>(level, 2)?;
    let texcoord_shift = shift::<T>(level, 1)?;

    let (position, texcoord) = (layout.write_offsets[0], layout.write_offsets[1]);

    let vertices = input.len().min(result.len() / layout.stride);

    for (byte, vertex) in input.iter().zip(result.chunks_exact_mut(layout.stride)).take(vertices) {
        let byte = u32::from(*byte);

        merge(&mut vertex[position], (byte >> 6) & 3, position_shift);
        merge(&mut vertex[position + 1], (byte >> 4) & 3, position_shift);
        merge(&mut vertex[position + 2], (byte >> 2) & 3, position_shift);
        merge(&mut vertex[texcoord], (byte >> 1) & 1, texcoord_shift);
        merge(&mut vertex[texcoord + 1], byte & 1, texcoord_shift);
    }

    Ok(vertices)
}

/// Positions `xxyyzz` packed in one byte per vertex, the 2 lowest bits being padding.
///
/// Once merged, the face normal of every complete triangle of consecutive vertices is derived from the accumulated positions and
/// written to its three vertices.
pub fn decode_position_normal<T: Element>(level: u32, layout: &Layout, input: &[u8], result: &mut [T]) -> Result<usize, CodecError> {
    let position_shift = shift::<T>(level, 2)?;

    let (position, normal) = (layout.write_offsets[0], layout.write_offsets[1]);

    let vertices = input.len().min(result.len() / layout.stride);

    for (byte, vertex) in input.iter().zip(result.chunks_exact_mut(layout.stride)).take(vertices) {
        let byte = u32::from(*byte);

        merge(&mut vertex[position], (byte >> 6) & 3, position_shift);
        merge(&mut vertex[position + 1], (byte >> 4) & 3, position_shift);
        merge(&mut vertex[position + 2], (byte >> 2) & 3, position_shift);
    }

    let max = f64::from(u32::MAX >> (32 - T::BITS));

    for triangle in result[..vertices * layout.stride].chunks_exact_mut(3 * layout.stride) {
        let point = |v: usize| -> [f64; 3] {
            let vertex = &triangle[v * layout.stride + position..];
            [0, 1, 2].map(|c| f64::from(vertex[c].to_u32()))
        };

        let n = face_normal(point(0), point(1), point(2));
        let quantized = n.map(|c| T::from_u32(((c + 1.0) / 2.0 * max).round() as u32));

        for vertex in triangle.chunks_exact_mut(layout.stride) {
            vertex[normal..normal + 3].copy_from_slice(&quantized);
        }
    }

    Ok(vertices)
}

/// Unit normal of the triangle `(a, b, c)`, or the zero vector when degenerate.
fn face_normal(a: [f64; 3], b: [f64; 3], c: [f64; 3]) -> [f64; 3] {
    let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];

    let n = [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ];

    let length = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();

    if length > 0.0 {
        n.map(|c| c / length)
    } else {
        [0.0; 3]
    }
}
