use ndarray::{ArrayD, Axis, IxDyn, SliceInfoElem};
use num_traits::PrimInt;

use crate::errors::{Error, Result};

/// The element type of a stored variable.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::I64 | DataType::U64 | DataType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

/// A typed, n-dimensional block of values, as moved between the storage
/// capability and the array layers. One variant per element type.
///
#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

/// Evaluate `$body` with `$arr` bound to whichever array this block holds.
macro_rules! each_block {
    ($self:expr, $arr:ident => $body:expr) => {
        match $self {
            Block::I8($arr) => $body,
            Block::I16($arr) => $body,
            Block::I32($arr) => $body,
            Block::I64($arr) => $body,
            Block::U8($arr) => $body,
            Block::U16($arr) => $body,
            Block::U32($arr) => $body,
            Block::U64($arr) => $body,
            Block::F32($arr) => $body,
            Block::F64($arr) => $body,
        }
    };
}

/// Like `each_block!` but rewraps the result in the same variant.
macro_rules! map_block {
    ($self:expr, $arr:ident => $body:expr) => {
        match $self {
            Block::I8($arr) => Block::I8($body),
            Block::I16($arr) => Block::I16($body),
            Block::I32($arr) => Block::I32($body),
            Block::I64($arr) => Block::I64($body),
            Block::U8($arr) => Block::U8($body),
            Block::U16($arr) => Block::U16($body),
            Block::U32($arr) => Block::U32($body),
            Block::U64($arr) => Block::U64($body),
            Block::F32($arr) => Block::F32($body),
            Block::F64($arr) => Block::F64($body),
        }
    };
}

/// Match two blocks of the same element type, or fall through to `$mismatch`.
macro_rules! zip_block {
    ($a:expr, $b:expr, ($x:ident, $y:ident) => $body:expr, $mismatch:expr) => {
        match ($a, $b) {
            (Block::I8($x), Block::I8($y)) => $body,
            (Block::I16($x), Block::I16($y)) => $body,
            (Block::I32($x), Block::I32($y)) => $body,
            (Block::I64($x), Block::I64($y)) => $body,
            (Block::U8($x), Block::U8($y)) => $body,
            (Block::U16($x), Block::U16($y)) => $body,
            (Block::U32($x), Block::U32($y)) => $body,
            (Block::U64($x), Block::U64($y)) => $body,
            (Block::F32($x), Block::F32($y)) => $body,
            (Block::F64($x), Block::F64($y)) => $body,
            _ => $mismatch,
        }
    };
}

impl Block {
    pub fn dtype(&self) -> DataType {
        match self {
            Block::I8(_) => DataType::I8,
            Block::I16(_) => DataType::I16,
            Block::I32(_) => DataType::I32,
            Block::I64(_) => DataType::I64,
            Block::U8(_) => DataType::U8,
            Block::U16(_) => DataType::U16,
            Block::U32(_) => DataType::U32,
            Block::U64(_) => DataType::U64,
            Block::F32(_) => DataType::F32,
            Block::F64(_) => DataType::F64,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        each_block!(self, a => a.shape().to_vec())
    }

    pub fn len(&self) -> usize {
        each_block!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An all-zeros block of the given element type and shape.
    pub fn zeros(dtype: DataType, shape: &[usize]) -> Self {
        match dtype {
            DataType::I8 => Block::I8(ArrayD::zeros(IxDyn(shape))),
            DataType::I16 => Block::I16(ArrayD::zeros(IxDyn(shape))),
            DataType::I32 => Block::I32(ArrayD::zeros(IxDyn(shape))),
            DataType::I64 => Block::I64(ArrayD::zeros(IxDyn(shape))),
            DataType::U8 => Block::U8(ArrayD::zeros(IxDyn(shape))),
            DataType::U16 => Block::U16(ArrayD::zeros(IxDyn(shape))),
            DataType::U32 => Block::U32(ArrayD::zeros(IxDyn(shape))),
            DataType::U64 => Block::U64(ArrayD::zeros(IxDyn(shape))),
            DataType::F32 => Block::F32(ArrayD::zeros(IxDyn(shape))),
            DataType::F64 => Block::F64(ArrayD::zeros(IxDyn(shape))),
        }
    }

    /// Copy out the sub-block selected by `info`, one element per axis.
    /// `SliceInfoElem::Index` entries reduce the rank of the result.
    pub fn read_region(&self, info: &[SliceInfoElem]) -> Self {
        map_block!(self, a => a.slice(info).to_owned())
    }

    /// Assign `src` into the sub-block selected by `info`. The selection must
    /// match `src` in element type and shape.
    pub fn write_region(&mut self, info: &[SliceInfoElem], src: &Block) -> Result<()> {
        let (dst_dtype, src_dtype) = (self.dtype(), src.dtype());
        zip_block!(
            self,
            src,
            (dst, s) => {
                let mut dst = dst.slice_mut(info);
                if dst.shape() != s.shape() {
                    return Err(Error::range(
                        "block",
                        format!(
                            "payload shape {:?} does not match selection shape {:?}",
                            s.shape(),
                            dst.shape()
                        ),
                    ));
                }
                dst.assign(s);
                Ok(())
            },
            Err(Error::encoding(
                "block",
                format!("element type mismatch: {src_dtype:?} assigned into {dst_dtype:?}"),
            ))
        )
    }

    /// Insert a new axis of length one at `axis`.
    pub fn insert_axis(self, axis: usize) -> Self {
        map_block!(self, a => a.insert_axis(Axis(axis)))
    }

    /// Convert every element to `f64`.
    pub fn to_f64(&self) -> ArrayD<f64> {
        each_block!(self, a => a.mapv(|v| v as f64))
    }

    /// Convert an `f64` array into the given stored type. Integer targets are
    /// rounded to the nearest whole number; a value outside the target's
    /// representable range is a `Range` error.
    pub fn from_f64(dtype: DataType, data: ArrayD<f64>, entity: &str) -> Result<Self> {
        Ok(match dtype {
            DataType::I8 => Block::I8(pack_ints::<i8>(&data, entity)?),
            DataType::I16 => Block::I16(pack_ints::<i16>(&data, entity)?),
            DataType::I32 => Block::I32(pack_ints::<i32>(&data, entity)?),
            DataType::I64 => Block::I64(pack_ints::<i64>(&data, entity)?),
            DataType::U8 => Block::U8(pack_ints::<u8>(&data, entity)?),
            DataType::U16 => Block::U16(pack_ints::<u16>(&data, entity)?),
            DataType::U32 => Block::U32(pack_ints::<u32>(&data, entity)?),
            DataType::U64 => Block::U64(pack_ints::<u64>(&data, entity)?),
            DataType::F32 => Block::F32(data.mapv(|v| v as f32)),
            DataType::F64 => Block::F64(data),
        })
    }
}

/// Selection covering the contiguous region `start .. start + count`, one
/// entry per axis.
pub(crate) fn region(start: &[usize], count: &[usize]) -> Vec<SliceInfoElem> {
    start
        .iter()
        .zip(count)
        .map(|(&s, &c)| SliceInfoElem::Slice {
            start: s as isize,
            end: Some((s + c) as isize),
            step: 1,
        })
        .collect()
}

fn pack_ints<T>(data: &ArrayD<f64>, entity: &str) -> Result<ArrayD<T>>
where
    T: PrimInt + 'static,
{
    let lo = T::min_value().to_f64().unwrap();
    let hi = T::max_value().to_f64().unwrap();
    let mut out = ArrayD::zeros(data.raw_dim());
    for (dst, &v) in out.iter_mut().zip(data.iter()) {
        let rounded = v.round();
        if !rounded.is_finite() || rounded < lo || rounded > hi {
            return Err(Error::range(
                entity,
                format!("value {v} overflows the stored integer range"),
            ));
        }
        *dst = T::from(rounded).ok_or_else(|| {
            Error::range(
                entity,
                format!("value {v} overflows the stored integer range"),
            )
        })?;
    }

    Ok(out)
}
