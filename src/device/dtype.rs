//! Element types and their per-context metadata.

use core::fmt;

use bytemuck::Pod;

/// Element type of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dtype {
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 32-bit IEEE float.
    F32,
    /// 64-bit IEEE float.
    F64,
}

impl Dtype {
    /// Every supported element type, in kernel-table order.
    pub const ALL: [Self; 6] = [
        Self::I8,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::F32,
        Self::F64,
    ];

    /// Size of one element in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Returns `true` for floating point types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Position of the type in [`Dtype::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short lowercase name, also used as the kernel type parameter.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// Smallest magnitude considered distinguishable from zero.
    ///
    /// Machine epsilon for floats; one half for integers.
    #[must_use]
    pub const fn epsilon(self) -> f64 {
        match self {
            Self::F32 => f32::EPSILON as f64,
            Self::F64 => f64::EPSILON,
            _ => 0.5,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host-side scalar types that map onto a [`Dtype`].
pub trait Element: Pod + Send + Sync {
    /// The device element type matching `Self`.
    const DTYPE: Dtype;

    /// Widens the value to `f64`.
    fn to_f64(self) -> f64;

    /// Narrows an `f64`, rounding and saturating for integers.
    fn from_f64(v: f64) -> Self;
}

macro_rules! int_element {
    ($($t:ty => $d:ident),* $(,)?) => {$(
        impl Element for $t {
            const DTYPE: Dtype = Dtype::$d;

            #[allow(clippy::cast_precision_loss)]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[allow(clippy::cast_possible_truncation)]
            fn from_f64(v: f64) -> Self {
                v.round() as $t
            }
        }
    )*};
}

int_element!(i8 => I8, i16 => I16, i32 => I32, i64 => I64);

impl Element for f32 {
    const DTYPE: Dtype = Dtype::F32;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(v: f64) -> Self {
        v as Self
    }
}

impl Element for f64 {
    const DTYPE: Dtype = Dtype::F64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(v: f64) -> Self {
        v
    }
}

fn decode_as<T: Element>(bytes: &[u8], out: &mut [f64]) {
    for (chunk, slot) in bytes.chunks_exact(size_of::<T>()).zip(out.iter_mut()) {
        *slot = bytemuck::pod_read_unaligned::<T>(chunk).to_f64();
    }
}

fn encode_as<T: Element>(values: &[f64], bytes: &mut [u8]) {
    for (chunk, &v) in bytes.chunks_exact_mut(size_of::<T>()).zip(values) {
        chunk.copy_from_slice(bytemuck::bytes_of(&T::from_f64(v)));
    }
}

/// Decodes little-endian elements of `dtype` into `out`.
pub(crate) fn decode(dtype: Dtype, bytes: &[u8], out: &mut [f64]) {
    match dtype {
        Dtype::I8 => decode_as::<i8>(bytes, out),
        Dtype::I16 => decode_as::<i16>(bytes, out),
        Dtype::I32 => decode_as::<i32>(bytes, out),
        Dtype::I64 => decode_as::<i64>(bytes, out),
        Dtype::F32 => decode_as::<f32>(bytes, out),
        Dtype::F64 => decode_as::<f64>(bytes, out),
    }
}

/// Encodes `values` as elements of `dtype` into `bytes`.
pub(crate) fn encode(dtype: Dtype, values: &[f64], bytes: &mut [u8]) {
    match dtype {
        Dtype::I8 => encode_as::<i8>(values, bytes),
        Dtype::I16 => encode_as::<i16>(values, bytes),
        Dtype::I32 => encode_as::<i32>(values, bytes),
        Dtype::I64 => encode_as::<i64>(values, bytes),
        Dtype::F32 => encode_as::<f32>(values, bytes),
        Dtype::F64 => encode_as::<f64>(values, bytes),
    }
}

/// Metadata a context keeps for one element type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DtypeInfo {
    /// The element type described.
    pub dtype: Dtype,
    /// Element size in bytes.
    pub size: usize,
    /// Preferred number of elements processed per kernel lane.
    pub vector_width: u32,
    /// Threshold below which values are treated as zero.
    pub epsilon: f64,
}

/// Per-context dtype metadata table.
#[derive(Debug, Clone)]
pub struct DtypeTable {
    entries: [DtypeInfo; Dtype::ALL.len()],
}

impl DtypeTable {
    /// Builds the table for a device preferring `vector_bytes` wide lanes.
    #[must_use]
    pub fn new(vector_bytes: u32) -> Self {
        let entries = Dtype::ALL.map(|dtype| DtypeInfo {
            dtype,
            size: dtype.size(),
            vector_width: (vector_bytes / dtype.size() as u32).max(1),
            epsilon: dtype.epsilon(),
        });
        Self { entries }
    }

    /// Metadata of `dtype`.
    #[must_use]
    pub const fn get(&self, dtype: Dtype) -> &DtypeInfo {
        &self.entries[dtype.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_and_saturate() {
        let mut bytes = [0u8; 2];
        encode(Dtype::I8, &[1.6, 300.0], &mut bytes);
        let mut back = [0.0; 2];
        decode(Dtype::I8, &bytes, &mut back);
        assert_eq!(back, [2.0, 127.0]);
    }

    #[test]
    fn floats_survive_encoding() {
        let mut bytes = [0u8; 16];
        encode(Dtype::F64, &[0.25, -3.5], &mut bytes);
        let mut back = [0.0; 2];
        decode(Dtype::F64, &bytes, &mut back);
        assert_eq!(back, [0.25, -3.5]);
    }

    #[test]
    fn vector_width_follows_element_size() {
        let table = DtypeTable::new(16);
        assert_eq!(table.get(Dtype::F32).vector_width, 4);
        assert_eq!(table.get(Dtype::F64).vector_width, 2);
        assert_eq!(table.get(Dtype::I8).vector_width, 16);
    }
}
