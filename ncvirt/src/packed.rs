use std::sync::Arc;

use async_trait::async_trait;
use ndarray::ArrayD;

use crate::{
    array::NcArray,
    block::{Block, DataType},
    errors::{Error, Result},
    store::{AttrSet, AttrValue, Dimension},
};

/// CF packing parameters, captured once from a variable's attributes and
/// immutable from then on.
///
/// `unpacked = stored * scale_factor + add_offset`; a stored value equal to
/// the fill value means "no data".
///
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PackParams {
    pub fill: Option<f64>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

impl PackParams {
    /// Capture packing parameters from `_FillValue`/`missing_value`,
    /// `scale_factor` and `add_offset`.
    pub fn from_attrs(attrs: &AttrSet) -> Self {
        let fill = attrs
            .get("_FillValue")
            .or_else(|| attrs.get("missing_value"))
            .and_then(AttrValue::as_f64);
        let scale = attrs.get("scale_factor").and_then(AttrValue::as_f64);
        let offset = attrs.get("add_offset").and_then(AttrValue::as_f64);

        Self {
            fill,
            scale,
            offset,
        }
    }

    /// True when no parameter is configured and the transform is the
    /// identity.
    pub fn is_passthrough(&self) -> bool {
        self.fill.is_none() && !self.has_linear()
    }

    fn has_linear(&self) -> bool {
        self.scale.is_some() || self.offset.is_some()
    }

    fn matches_fill(&self, v: f64) -> bool {
        match self.fill {
            Some(f) => v == f || (v.is_nan() && f.is_nan()),
            None => false,
        }
    }
}

/// A variable applying the CF numeric transform between the stored
/// representation and physical values on every read and write.
///
/// With `scale_factor` or `add_offset` configured the physical type is `F64`;
/// with only a fill value configured, floating storage maps the fill to NaN
/// in the stored float type, and integer storage passes through with the
/// fill value itself as the missing sentinel. With nothing configured the
/// transform is a bit-identical pass-through.
///
pub struct PackedVariable {
    parent: Arc<dyn NcArray>,
    params: PackParams,
    label: String,
}

impl PackedVariable {
    pub fn new(parent: Arc<dyn NcArray>, label: impl Into<String>) -> Self {
        let params = PackParams::from_attrs(&parent.attrs());

        Self {
            parent,
            params,
            label: label.into(),
        }
    }

    pub fn params(&self) -> &PackParams {
        &self.params
    }

    fn unpack(&self, stored: Block) -> Block {
        if self.params.is_passthrough() {
            return stored;
        }
        if !self.params.has_linear() {
            // Fill only. Floating storage gets NaN; integer storage keeps the
            // fill value as its sentinel.
            return match stored {
                Block::F32(a) => {
                    Block::F32(a.mapv(|v| {
                        if self.params.matches_fill(v as f64) {
                            f32::NAN
                        } else {
                            v
                        }
                    }))
                }
                Block::F64(a) => {
                    Block::F64(a.mapv(|v| if self.params.matches_fill(v) { f64::NAN } else { v }))
                }
                other => other,
            };
        }

        let scale = self.params.scale.unwrap_or(1.0);
        let offset = self.params.offset.unwrap_or(0.0);
        let unpacked = stored.to_f64().mapv(|v| {
            if self.params.matches_fill(v) {
                f64::NAN
            } else {
                v * scale + offset
            }
        });

        Block::F64(unpacked)
    }

    fn pack(&self, data: &Block) -> Result<Block> {
        if self.params.is_passthrough() {
            return Ok(data.clone());
        }
        let stored_dtype = self.parent.dtype();
        if !self.params.has_linear() {
            let fill = self.params.fill.unwrap();
            return Ok(match data {
                Block::F32(a) => {
                    Block::F32(a.mapv(|v| if v.is_nan() { fill as f32 } else { v }))
                }
                Block::F64(a) => Block::F64(a.mapv(|v| if v.is_nan() { fill } else { v })),
                other => other.clone(),
            });
        }

        let scale = self.params.scale.unwrap_or(1.0);
        let offset = self.params.offset.unwrap_or(0.0);
        let physical = data.to_f64();
        let mut stored = ArrayD::<f64>::zeros(physical.raw_dim());
        for (dst, &v) in stored.iter_mut().zip(physical.iter()) {
            if v.is_nan() {
                *dst = match self.params.fill {
                    // Fill values are stored as-is, not scaled.
                    Some(fill) => fill,
                    None if stored_dtype.is_float() => f64::NAN,
                    None => {
                        return Err(Error::encoding(
                            &self.label,
                            "missing value written without a configured fill value",
                        ))
                    }
                };
            } else {
                *dst = (v - offset) / scale;
            }
        }

        Block::from_f64(stored_dtype, stored, &self.label)
    }
}

#[async_trait]
impl NcArray for PackedVariable {
    fn dimensions(&self) -> Vec<Dimension> {
        self.parent.dimensions()
    }

    fn dtype(&self) -> DataType {
        if self.params.has_linear() {
            DataType::F64
        } else {
            self.parent.dtype()
        }
    }

    fn attrs(&self) -> AttrSet {
        self.parent.attrs()
    }

    async fn read(&self, start: &[usize], count: &[usize]) -> Result<Block> {
        let stored = self.parent.read(start, count).await?;

        Ok(self.unpack(stored))
    }

    async fn write(&self, start: &[usize], count: &[usize], data: &Block) -> Result<()> {
        let stored = self.pack(data)?;
        self.parent.write(start, count, &stored).await
    }

    async fn set_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        self.parent.set_attr(name, value).await
    }
}
