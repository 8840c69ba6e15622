use async_trait::async_trait;

use crate::{
    block::{Block, DataType},
    errors::{Error, Result},
    store::{AttrSet, AttrValue, Dimension},
};

/// The capability shared by every array-like entity: a raw stored variable, a
/// CF-transformed variable, an index view, a deferred variable, or a
/// multi-file aggregation.
///
/// Every composition layer depends only on this trait, via
/// `Arc<dyn NcArray>`, so the variants nest arbitrarily: a view over an
/// aggregation over deferred, transformed members is just another `NcArray`.
///
#[async_trait]
pub trait NcArray: Send + Sync {
    /// Dimensions in file-storage order. Callers needing a logical or
    /// reversed order apply it at a higher layer.
    fn dimensions(&self) -> Vec<Dimension>;

    fn dtype(&self) -> DataType;

    fn shape(&self) -> Vec<usize> {
        self.dimensions().into_iter().map(|d| d.len).collect()
    }

    /// The current attribute set of this entity.
    fn attrs(&self) -> AttrSet;

    fn attr(&self, name: &str) -> Option<AttrValue> {
        self.attrs().get(name).cloned()
    }

    /// Read the rectangular region `start .. start + count`, one entry per
    /// dimension.
    async fn read(&self, start: &[usize], count: &[usize]) -> Result<Block>;

    /// Write `data` into the rectangular region `start .. start + count`.
    async fn write(&self, start: &[usize], count: &[usize], data: &Block) -> Result<()>;

    async fn set_attr(&self, name: &str, value: AttrValue) -> Result<()>;
}

/// Reject a request that does not fit inside `shape`. Out-of-bounds requests
/// are surfaced as `Range` errors, never clamped.
pub(crate) fn check_bounds(
    entity: &str,
    shape: &[usize],
    start: &[usize],
    count: &[usize],
) -> Result<()> {
    if start.len() != shape.len() || count.len() != shape.len() {
        return Err(Error::range(
            entity,
            format!(
                "request rank {} does not match array rank {}",
                start.len().max(count.len()),
                shape.len()
            ),
        ));
    }
    for ((&s, &c), &len) in start.iter().zip(count).zip(shape) {
        if s + c > len {
            return Err(Error::out_of_bounds(entity, start, count, shape));
        }
    }

    Ok(())
}

/// Reject a payload whose shape does not match the requested count.
pub(crate) fn check_payload(entity: &str, count: &[usize], data: &Block) -> Result<()> {
    if data.shape() != count {
        return Err(Error::range(
            entity,
            format!(
                "payload shape {:?} does not match requested count {:?}",
                data.shape(),
                count
            ),
        ));
    }

    Ok(())
}
