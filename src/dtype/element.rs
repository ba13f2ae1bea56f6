//! Element trait for mapping Rust types to DType

use super::DType;
use bytemuck::{Pod, Zeroable};

/// Trait for types that can be elements of a buffer
///
/// This trait connects Rust's type system to tensr's runtime dtype system.
/// Conversions go through the two canonical forms of the datatype registry:
/// 64-bit float for float-valued math and 128-bit integer for exact integer
/// paths (wide enough to hold both `i64` and `u64` losslessly).
pub trait Element: Copy + Clone + Send + Sync + Pod + Zeroable + PartialEq + 'static {
    /// The corresponding DType for this Rust type
    const DTYPE: DType;

    /// Convert to the canonical float form
    fn to_f64(self) -> f64;

    /// Convert from the canonical float form (narrowing casts per `as`)
    fn from_f64(v: f64) -> Self;

    /// Convert to the canonical integer form (floats truncate toward zero)
    fn to_i128(self) -> i128;

    /// Convert from the canonical integer form, wrapping modulo 2^width
    /// for integer targets
    fn from_i128(v: i128) -> Self;

    /// Zero value
    fn zero() -> Self;

    /// One value
    fn one() -> Self;
}

macro_rules! impl_int_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as $ty
                }

                #[inline]
                fn to_i128(self) -> i128 {
                    self as i128
                }

                #[inline]
                fn from_i128(v: i128) -> Self {
                    // i128 -> narrower `as` cast truncates, i.e. wraps mod 2^width
                    v as $ty
                }

                #[inline]
                fn zero() -> Self {
                    0
                }

                #[inline]
                fn one() -> Self {
                    1
                }
            }
        )*
    };
}

macro_rules! impl_float_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as $ty
                }

                #[inline]
                fn to_i128(self) -> i128 {
                    self as i128
                }

                #[inline]
                fn from_i128(v: i128) -> Self {
                    v as $ty
                }

                #[inline]
                fn zero() -> Self {
                    0.0
                }

                #[inline]
                fn one() -> Self {
                    1.0
                }
            }
        )*
    };
}

impl_int_element! {
    i64 => I64,
    i32 => I32,
    i16 => I16,
    i8 => I8,
    u64 => U64,
    u32 => U32,
    u16 => U16,
    u8 => U8,
}

impl_float_element! {
    f64 => F64,
    f32 => F32,
}
