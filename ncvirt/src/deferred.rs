use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    array::{check_bounds, check_payload, NcArray},
    block::{Block, DataType},
    dataset::NcDataset,
    errors::{Error, Result},
    packed::PackedVariable,
    store::{AttrSet, AttrValue, Dimension, FileHandle, OpenMode, Store, VarInfo},
};

/// A file path, an open mode, and a metadata snapshot captured once at
/// construction. No file descriptor is held as part of the resource itself;
/// a fresh handle is opened for each data access and closed again before the
/// access returns.
///
pub struct Resource {
    store: Arc<dyn Store>,
    path: String,
    mode: OpenMode,
    dimensions: Vec<Dimension>,
    attributes: AttrSet,
    variables: Vec<VarInfo>,
}

impl Resource {
    /// Open the file once, capture dimensions, attributes and per-variable
    /// metadata, and close it again.
    pub async fn capture(store: Arc<dyn Store>, path: &str, mode: OpenMode) -> Result<Self> {
        let handle = store.open(path, mode).await?;
        let gathered = (|| {
            let dimensions = handle.dimensions();
            let attributes = handle.attributes();
            let mut variables = Vec::new();
            for name in handle.variables() {
                let id = handle.resolve(&name)?;
                variables.push(handle.describe(id)?);
            }
            Ok((dimensions, attributes, variables))
        })();
        let (dimensions, attributes, variables) = finish(path, handle.as_ref(), gathered).await?;
        debug!(path, variables = variables.len(), "captured resource metadata");

        Ok(Self {
            store,
            path: path.to_string(),
            mode,
            dimensions,
            attributes,
            variables,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn dimensions(&self) -> Vec<Dimension> {
        self.dimensions.clone()
    }

    pub fn attributes(&self) -> AttrSet {
        self.attributes.clone()
    }

    async fn acquire(&self) -> Result<Box<dyn FileHandle>> {
        debug!(path = %self.path, "opening deferred resource");
        self.store.open(&self.path, self.mode).await
    }

    /// Read a block from one variable through a scoped open/act/close cycle.
    async fn read_var(&self, name: &str, start: &[usize], count: &[usize]) -> Result<Block> {
        let handle = self.acquire().await?;
        let result = async {
            let id = handle.resolve(name)?;
            handle.read_block(id, start, count).await
        }
        .await;

        finish(&self.path, handle.as_ref(), result).await
    }

    /// Write a block to one variable through a scoped open/act/close cycle.
    async fn write_var(
        &self,
        name: &str,
        start: &[usize],
        count: &[usize],
        data: &Block,
    ) -> Result<()> {
        let handle = self.acquire().await?;
        let result = async {
            let id = handle.resolve(name)?;
            handle.write_block(id, start, count, data).await
        }
        .await;

        finish(&self.path, handle.as_ref(), result).await
    }

    async fn set_var_attr(&self, name: &str, attr: &str, value: AttrValue) -> Result<()> {
        let handle = self.acquire().await?;
        let result = async {
            let id = handle.resolve(name)?;
            handle.set_attr(Some(id), attr, value).await
        }
        .await;

        finish(&self.path, handle.as_ref(), result).await
    }
}

/// Close a handle on every exit path. A close failure after a failed access
/// is logged and does not mask the access error; after a successful access it
/// is surfaced.
async fn finish<T>(path: &str, handle: &dyn FileHandle, result: Result<T>) -> Result<T> {
    let closed = handle.close().await;
    match result {
        Ok(value) => {
            closed?;
            Ok(value)
        }
        Err(err) => {
            if let Err(close_err) = closed {
                warn!(path, error = %close_err, "failed to close resource after error");
            }
            Err(err)
        }
    }
}

/// A dataset whose backing file is reopened for each data access.
///
/// Metadata queries are answered from the snapshot without touching the
/// file, so arbitrarily many deferred datasets can exist at once without
/// holding any file resources open between calls.
///
pub struct DeferredDataset {
    resource: Arc<Resource>,
}

impl DeferredDataset {
    pub async fn open(store: Arc<dyn Store>, path: &str, mode: OpenMode) -> Result<Self> {
        let resource = Arc::new(Resource::capture(store, path, mode).await?);

        Ok(Self { resource })
    }

    /// The variable as stored, without the CF transform.
    pub fn raw_variable(&self, name: &str) -> Result<DeferredVariable> {
        let info = self
            .resource
            .variables
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| {
                Error::resource(&self.resource.path, format!("no such variable: {name}"))
            })?;
        let lengths: HashMap<&str, usize> = self
            .resource
            .dimensions
            .iter()
            .map(|d| (d.name.as_str(), d.len))
            .collect();
        let mut dimensions = Vec::with_capacity(info.dimensions.len());
        for dim in &info.dimensions {
            let len = lengths.get(dim.as_str()).ok_or_else(|| {
                Error::resource(
                    &self.resource.path,
                    format!("variable {name} uses unknown dimension {dim}"),
                )
            })?;
            dimensions.push(Dimension::new(dim.clone(), *len));
        }

        Ok(DeferredVariable {
            resource: Arc::clone(&self.resource),
            name: name.to_string(),
            dimensions,
            dtype: info.dtype,
            attrs: RwLock::new(info.attributes.clone()),
        })
    }

    /// The variable with the CF transform applied.
    pub fn variable(&self, name: &str) -> Result<PackedVariable> {
        let ident = format!("{}:{name}", self.resource.path);
        let raw = self.raw_variable(name)?;

        Ok(PackedVariable::new(Arc::new(raw), ident))
    }
}

impl NcDataset for DeferredDataset {
    fn path(&self) -> &str {
        &self.resource.path
    }

    fn dimensions(&self) -> Vec<Dimension> {
        self.resource.dimensions()
    }

    fn attributes(&self) -> AttrSet {
        self.resource.attributes()
    }

    fn variable_names(&self) -> Vec<String> {
        self.resource
            .variables
            .iter()
            .map(|v| v.name.clone())
            .collect()
    }

    fn array(&self, name: &str) -> Result<Arc<dyn NcArray>> {
        Ok(Arc::new(self.variable(name)?))
    }
}

/// One variable of a deferred dataset.
///
/// Shape, element type and attributes come from the cached snapshot; every
/// read or write opens the file, re-resolves the variable, performs the
/// transfer, and closes the file again.
///
pub struct DeferredVariable {
    resource: Arc<Resource>,
    name: String,
    dimensions: Vec<Dimension>,
    dtype: DataType,
    attrs: RwLock<AttrSet>,
}

impl DeferredVariable {
    fn ident(&self) -> String {
        format!("{}:{}", self.resource.path, self.name)
    }
}

#[async_trait]
impl NcArray for DeferredVariable {
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
        self.resource.read_var(&self.name, start, count).await
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
        self.resource.write_var(&self.name, start, count, data).await
    }

    async fn set_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        self.resource
            .set_var_attr(&self.name, name, value.clone())
            .await?;
        self.attrs.write().insert(name.to_string(), value);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing;

    use ndarray::array;

    async fn deferred(store: &Arc<testing::MemStore>) -> Result<DeferredDataset> {
        testing::weather_file(store, "d.nc", &[5, 6, 7, 8]);
        let store: Arc<dyn Store> = Arc::clone(store) as Arc<dyn Store>;

        DeferredDataset::open(store, "d.nc", OpenMode::Write).await
    }

    #[tokio::test]
    async fn test_no_handles_left_open() -> Result<()> {
        let store = testing::store();
        let dataset = deferred(&store).await?;
        let var = dataset.raw_variable("temp")?;
        assert_eq!(store.live_handles(), 0);

        for i in 0..4 {
            var.read(&[i], &[1]).await?;
            var.write(&[i], &[1], &Block::I16(array![i as i16].into_dyn()))
                .await?;
        }
        assert_eq!(store.live_handles(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_metadata_does_not_open_the_file() -> Result<()> {
        let store = testing::store();
        let dataset = deferred(&store).await?;
        let var = dataset.raw_variable("temp")?;

        let opens = store.opens("d.nc");
        assert_eq!(var.shape(), vec![4]);
        assert_eq!(var.dtype(), DataType::I16);
        assert_eq!(dataset.dimensions(), vec![Dimension::new("time", 4)]);
        let _ = var.attrs();
        assert_eq!(store.opens("d.nc"), opens);

        Ok(())
    }

    #[tokio::test]
    async fn test_each_access_opens_once() -> Result<()> {
        let store = testing::store();
        let dataset = deferred(&store).await?;
        let var = dataset.raw_variable("temp")?;

        let before = store.opens("d.nc");
        var.read(&[0], &[2]).await?;
        var.read(&[2], &[2]).await?;
        assert_eq!(store.opens("d.nc"), before + 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_read_matches_storage() -> Result<()> {
        let store = testing::store();
        let dataset = deferred(&store).await?;
        let var = dataset.raw_variable("temp")?;

        assert_eq!(
            var.read(&[1], &[2]).await?,
            Block::I16(array![6, 7].into_dyn())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_open_failure_is_a_resource_error() {
        let store = testing::store();
        let result = DeferredDataset::open(
            Arc::clone(&store) as Arc<dyn Store>,
            "missing.nc",
            OpenMode::Read,
        )
        .await;
        assert!(matches!(result, Err(Error::Resource { .. })));
        assert_eq!(store.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_failed_access_still_closes() -> Result<()> {
        let store = testing::store();
        let dataset = deferred(&store).await?;
        let var = dataset.raw_variable("temp")?;

        // Delete the variable out from under the deferred entity, so the
        // access fails after the file was opened.
        store.remove_var("d.nc", "temp");
        let result = var.read(&[0], &[1]).await;
        assert!(matches!(result, Err(Error::Resource { .. })));
        assert_eq!(store.live_handles(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_cf_transform_over_deferred() -> Result<()> {
        let store = testing::store();
        testing::packed_file(&store, "p.nc", &[100, 200], 0.5, 10.0, None);
        let dataset = DeferredDataset::open(
            Arc::clone(&store) as Arc<dyn Store>,
            "p.nc",
            OpenMode::Read,
        )
        .await?;

        let var = dataset.variable("temp")?;
        assert_eq!(store.live_handles(), 0);
        let values = var.read(&[0], &[2]).await?.to_f64();
        assert_eq!(values[0], 60.0);
        assert_eq!(values[1], 110.0);
        assert_eq!(store.live_handles(), 0);

        Ok(())
    }
}
