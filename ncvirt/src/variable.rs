use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    array::{check_bounds, check_payload, NcArray},
    block::{Block, DataType},
    errors::{Error, Result},
    store::{AttrSet, AttrValue, Dimension, FileHandle, VarId},
};

/// A handle-like view over one stored array inside one open file resource.
///
/// Performs no semantic transformation: values move between the caller and
/// the storage capability unchanged. The file resource is shared; it stays
/// alive as long as any variable or the owning dataset does.
///
pub struct RawVariable {
    handle: Arc<dyn FileHandle>,
    id: VarId,
    name: String,
    path: String,
    dimensions: Vec<Dimension>,
    dtype: DataType,
    attrs: RwLock<AttrSet>,
}

impl RawVariable {
    pub(crate) fn new(handle: Arc<dyn FileHandle>, path: &str, name: &str) -> Result<Self> {
        let id = handle.resolve(name)?;
        let info = handle.describe(id)?;
        let lengths: HashMap<String, usize> = handle
            .dimensions()
            .into_iter()
            .map(|d| (d.name, d.len))
            .collect();
        let mut dimensions = Vec::with_capacity(info.dimensions.len());
        for dim in &info.dimensions {
            let len = lengths.get(dim).ok_or_else(|| {
                Error::resource(path, format!("variable {name} uses unknown dimension {dim}"))
            })?;
            dimensions.push(Dimension::new(dim.clone(), *len));
        }

        Ok(Self {
            handle,
            id,
            name: name.to_string(),
            path: path.to_string(),
            dimensions,
            dtype: info.dtype,
            attrs: RwLock::new(info.attributes),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `path:variable`, used to identify this entity in errors.
    pub(crate) fn ident(&self) -> String {
        format!("{}:{}", self.path, self.name)
    }
}

#[async_trait]
impl NcArray for RawVariable {
    fn dimensions(&self) -> Vec<Dimension> {
        self.dimensions.clone()
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn attrs(&self) -> AttrSet {
        self.attrs.read().clone()
    }

    async fn read(&self, start: &[usize], count: &[usize]) -> Result<Block> {
        check_bounds(&self.ident(), &self.shape(), start, count)?;
        self.handle.read_block(self.id, start, count).await
    }

    async fn write(&self, start: &[usize], count: &[usize], data: &Block) -> Result<()> {
        check_bounds(&self.ident(), &self.shape(), start, count)?;
        check_payload(&self.ident(), count, data)?;
        if data.dtype() != self.dtype {
            return Err(Error::encoding(
                self.ident(),
                format!(
                    "cannot store {:?} values in a {:?} variable",
                    data.dtype(),
                    self.dtype
                ),
            ));
        }
        self.handle.write_block(self.id, start, count, data).await
    }

    async fn set_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        self.handle
            .set_attr(Some(self.id), name, value.clone())
            .await?;
        self.attrs.write().insert(name.to_string(), value);

        Ok(())
    }
}
