use std::sync::Arc;

use tracing::debug;

use crate::{
    array::NcArray,
    errors::Result,
    packed::PackedVariable,
    store::{AttrSet, Dimension, FileHandle, OpenMode, Store},
    variable::RawVariable,
};

/// The dataset capability aggregation members provide: dimension and
/// attribute bookkeeping plus array access by name. Implemented by plain
/// datasets holding their file open and by deferred datasets that do not.
///
pub trait NcDataset: Send + Sync {
    fn path(&self) -> &str;

    fn dimensions(&self) -> Vec<Dimension>;

    fn attributes(&self) -> AttrSet;

    fn variable_names(&self) -> Vec<String>;

    /// The named variable with the CF transform applied.
    fn array(&self, name: &str) -> Result<Arc<dyn NcArray>>;
}

/// A single open file presented as a dictionary of dimensions, attributes
/// and variables.
///
/// The underlying file resource is shared by every variable built from this
/// dataset and stays alive as long as any of them is reachable; it is
/// released when the last owner drops it, or by an explicit `close`.
///
pub struct Dataset {
    path: String,
    handle: Arc<dyn FileHandle>,
    dimensions: Vec<Dimension>,
    attributes: AttrSet,
    variables: Vec<String>,
}

impl Dataset {
    pub async fn open(store: &dyn Store, path: &str, mode: OpenMode) -> Result<Self> {
        let handle: Arc<dyn FileHandle> = Arc::from(store.open(path, mode).await?);
        let dimensions = handle.dimensions();
        let attributes = handle.attributes();
        let variables = handle.variables();
        debug!(path, variables = variables.len(), "opened dataset");

        Ok(Self {
            path: path.to_string(),
            handle,
            dimensions,
            attributes,
            variables,
        })
    }

    /// The variable as stored, without the CF transform.
    pub fn raw_variable(&self, name: &str) -> Result<RawVariable> {
        RawVariable::new(Arc::clone(&self.handle), &self.path, name)
    }

    /// The variable with the CF transform applied. With no packing
    /// attributes configured this is a pure pass-through.
    pub fn variable(&self, name: &str) -> Result<PackedVariable> {
        let raw = self.raw_variable(name)?;
        let ident = format!("{}:{name}", self.path);

        Ok(PackedVariable::new(Arc::new(raw), ident))
    }

    /// Release the underlying file resource. Variables still holding it will
    /// fail their next access.
    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

impl NcDataset for Dataset {
    fn path(&self) -> &str {
        &self.path
    }

    fn dimensions(&self) -> Vec<Dimension> {
        self.dimensions.clone()
    }

    fn attributes(&self) -> AttrSet {
        self.attributes.clone()
    }

    fn variable_names(&self) -> Vec<String> {
        self.variables.clone()
    }

    fn array(&self, name: &str) -> Result<Arc<dyn NcArray>> {
        Ok(Arc::new(self.variable(name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{errors::Error, testing};

    #[tokio::test]
    async fn test_open_and_describe() -> Result<()> {
        let store = testing::store();
        testing::weather_file(&store, "w.nc", &[1, 2, 3]);

        let dataset = Dataset::open(store.as_ref(), "w.nc", OpenMode::Read).await?;
        assert_eq!(dataset.path(), "w.nc");
        assert_eq!(dataset.dimensions(), vec![Dimension::new("time", 3)]);
        assert_eq!(dataset.variable_names(), vec!["temp".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let store = testing::store();
        let result = Dataset::open(store.as_ref(), "nope.nc", OpenMode::Read).await;
        assert!(matches!(result, Err(Error::Resource { .. })));
    }

    #[tokio::test]
    async fn test_handle_is_shared_until_closed() -> Result<()> {
        let store = testing::store();
        testing::weather_file(&store, "w.nc", &[1, 2, 3]);

        let dataset = Dataset::open(store.as_ref(), "w.nc", OpenMode::Read).await?;
        let var = dataset.raw_variable("temp")?;
        assert_eq!(store.live_handles(), 1);

        dataset.close().await?;
        assert_eq!(store.live_handles(), 0);
        let result = var.read(&[0], &[1]).await;
        assert!(matches!(result, Err(Error::Resource { .. })));

        Ok(())
    }
}
