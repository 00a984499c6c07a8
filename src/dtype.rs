//! Element types and device classes understood by the dispatcher.
//!
//! Gate matrices, token features and expert buffers are plain `ndarray`
//! arrays whose element type implements [`Element`]. The dispatcher picks a
//! compute dtype per (device class, element dtype) pair and converts through
//! [`Element::cast`] at the kernel boundary.

use std::fmt;

use half::f16;
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Floating point element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F16,
    F32,
    F64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Class of device a dispatch runs on.
///
/// `Host` kernels run sequentially on the calling thread. `Accelerator`
/// kernels are data-parallel across tokens; the built-in implementation runs
/// on a dedicated rayon pool unless an external kernel has been registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceClass {
    #[default]
    Host,
    Accelerator,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Host => f.write_str("host"),
            DeviceClass::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Scalar element usable in gate matrices, token features and expert buffers.
pub trait Element: Float + Default + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;

    /// Widen to `f64` (lossless for every supported type).
    fn to_wide(self) -> f64;

    /// Round from `f64` to this type.
    fn from_wide(value: f64) -> Self;

    fn cast<T: Element>(self) -> T {
        T::from_wide(self.to_wide())
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    fn to_wide(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_wide(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn to_wide(self) -> f64 {
        self as f64
    }

    fn from_wide(value: f64) -> Self {
        value as f32
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn to_wide(self) -> f64 {
        self
    }

    fn from_wide(value: f64) -> Self {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_between_widths() {
        let x: f32 = 0.5;
        let h: f16 = x.cast();
        assert_eq!(h, f16::from_f32(0.5));
        let back: f64 = h.cast();
        assert_eq!(back, 0.5);
    }

    #[test]
    fn test_dtype_tags() {
        assert_eq!(<f16 as Element>::DTYPE, DType::F16);
        assert_eq!(<f32 as Element>::DTYPE, DType::F32);
        assert_eq!(<f64 as Element>::DTYPE, DType::F64);
        assert_eq!(DType::F16.to_string(), "float16");
    }
}
