//! Shared byte-level helpers for the codecs.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::models::{DataType, Endianness, NumericValues};

/// Rounds `n` up to the next multiple of `alignment`.
#[inline]
pub fn pad_to(n: usize, alignment: usize) -> usize {
    n.div_ceil(alignment) * alignment
}

/// Swaps byte order of multi-byte elements in place.
pub fn swap_endianness_in_place(buffer: &mut [u8], element_size: usize) {
    if element_size <= 1 {
        return;
    }
    for chunk in buffer.chunks_exact_mut(element_size) {
        chunk.reverse();
    }
}

/// Converts `buffer` from `from` byte order to the platform's native
/// order, element by element.
pub fn to_native_order(buffer: &mut [u8], element_size: usize, from: Endianness) {
    if from != Endianness::native() {
        swap_endianness_in_place(buffer, element_size);
    }
}

/// Decodes a raw value array of the declared byte order into typed
/// numerics.
pub fn decode_numeric(dt: DataType, bytes: &[u8], order: Endianness) -> NumericValues {
    macro_rules! decode {
        ($read:ident, $width:literal) => {
            bytes
                .chunks_exact($width)
                .map(|c| match order {
                    Endianness::Little => LittleEndian::$read(c),
                    Endianness::Big => BigEndian::$read(c),
                })
                .collect()
        };
    }
    match dt {
        DataType::Byte | DataType::Char => {
            NumericValues::I8(bytes.iter().map(|&b| b as i8).collect())
        }
        DataType::UByte => NumericValues::U8(bytes.to_vec()),
        DataType::Short => NumericValues::I16(decode!(read_i16, 2)),
        DataType::UShort => NumericValues::U16(decode!(read_u16, 2)),
        DataType::Int => NumericValues::I32(decode!(read_i32, 4)),
        DataType::UInt => NumericValues::U32(decode!(read_u32, 4)),
        DataType::Long => NumericValues::I64(decode!(read_i64, 8)),
        DataType::ULong => NumericValues::U64(decode!(read_u64, 8)),
        DataType::Float => NumericValues::F32(decode!(read_f32, 4)),
        DataType::Double => NumericValues::F64(decode!(read_f64, 8)),
        DataType::String | DataType::Structure => NumericValues::U8(bytes.to_vec()),
    }
}

/// Reads a NUL-terminated string starting at `pos`.
pub fn read_cstring(data: &[u8], pos: usize) -> Option<String> {
    let tail = data.get(pos..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}
