use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{Array1, Array2, Array3};
use parking_lot::Mutex;

use crate::{
    array::check_bounds,
    block::{region, Block},
    errors::{Error, Result},
    store::{AttrSet, AttrValue, Dimension, FileHandle, OpenMode, Store, VarId, VarInfo},
};

/// A test implementation of `Store` that keeps whole files in RAM.
///
/// Besides the capability itself it counts live handles and per-path opens,
/// so tests can assert resource-lifetime properties directly: a deferred
/// entity leaves zero handles open between calls, and an aggregated read
/// touches only the members that cover the request.
///
pub(crate) struct MemStore {
    files: Arc<Mutex<HashMap<String, MemFile>>>,
    live: Arc<Mutex<usize>>,
    opens: Arc<Mutex<HashMap<String, usize>>>,
}

struct MemFile {
    dimensions: Vec<Dimension>,
    attributes: AttrSet,
    variables: Vec<MemVar>,
}

struct MemVar {
    name: String,
    dimensions: Vec<String>,
    attributes: AttrSet,
    data: Block,
}

impl MemFile {
    fn shape_of(&self, var: &MemVar) -> Vec<usize> {
        var.dimensions
            .iter()
            .map(|name| {
                self.dimensions
                    .iter()
                    .find(|d| &d.name == name)
                    .map(|d| d.len)
                    .unwrap_or(0)
            })
            .collect()
    }
}

impl MemStore {
    pub(crate) fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            live: Arc::new(Mutex::new(0)),
            opens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handles currently open across every file.
    pub(crate) fn live_handles(&self) -> usize {
        *self.live.lock()
    }

    /// How many times `path` has been opened so far.
    pub(crate) fn opens(&self, path: &str) -> usize {
        self.opens.lock().get(path).copied().unwrap_or(0)
    }

    pub(crate) fn add_file(&self, path: &str, dimensions: Vec<Dimension>, attributes: AttrSet) {
        self.files.lock().insert(
            path.to_string(),
            MemFile {
                dimensions,
                attributes,
                variables: Vec::new(),
            },
        );
    }

    pub(crate) fn add_var(
        &self,
        path: &str,
        name: &str,
        dimensions: &[&str],
        attributes: AttrSet,
        data: Block,
    ) {
        let mut files = self.files.lock();
        let file = files.get_mut(path).expect("no such file");
        let var = MemVar {
            name: name.to_string(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            attributes,
            data,
        };
        assert_eq!(
            file.shape_of(&var),
            var.data.shape(),
            "variable data does not match its dimensions"
        );
        file.variables.push(var);
    }

    pub(crate) fn remove_var(&self, path: &str, name: &str) {
        let mut files = self.files.lock();
        let file = files.get_mut(path).expect("no such file");
        file.variables.retain(|v| v.name != name);
    }
}

#[async_trait]
impl Store for MemStore {
    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        {
            let mut files = self.files.lock();
            match mode {
                OpenMode::Create => {
                    files.insert(
                        path.to_string(),
                        MemFile {
                            dimensions: Vec::new(),
                            attributes: AttrSet::new(),
                            variables: Vec::new(),
                        },
                    );
                }
                OpenMode::Read | OpenMode::Write => {
                    if !files.contains_key(path) {
                        return Err(Error::resource(path, "no such file"));
                    }
                }
            }
        }
        *self.live.lock() += 1;
        *self.opens.lock().entry(path.to_string()).or_insert(0) += 1;

        Ok(Box::new(MemHandle {
            files: Arc::clone(&self.files),
            live: Arc::clone(&self.live),
            path: path.to_string(),
            mode,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemHandle {
    files: Arc<Mutex<HashMap<String, MemFile>>>,
    live: Arc<Mutex<usize>>,
    path: String,
    mode: OpenMode,
    closed: AtomicBool,
}

impl MemHandle {
    fn guard(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::resource(&self.path, "handle is closed"));
        }

        Ok(())
    }

    fn writable(&self) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Err(Error::resource(&self.path, "file is open read-only"));
        }

        Ok(())
    }

    fn with_var<T>(&self, var: VarId, f: impl FnOnce(&MemFile, &MemVar) -> Result<T>) -> Result<T> {
        self.guard()?;
        let files = self.files.lock();
        let file = files
            .get(&self.path)
            .ok_or_else(|| Error::resource(&self.path, "no such file"))?;
        let var = file
            .variables
            .get(var.0)
            .ok_or_else(|| Error::resource(&self.path, "stale variable identifier"))?;

        f(file, var)
    }
}

#[async_trait]
impl FileHandle for MemHandle {
    fn dimensions(&self) -> Vec<Dimension> {
        let files = self.files.lock();
        files
            .get(&self.path)
            .map(|f| f.dimensions.clone())
            .unwrap_or_default()
    }

    fn attributes(&self) -> AttrSet {
        let files = self.files.lock();
        files
            .get(&self.path)
            .map(|f| f.attributes.clone())
            .unwrap_or_default()
    }

    fn variables(&self) -> Vec<String> {
        let files = self.files.lock();
        files
            .get(&self.path)
            .map(|f| f.variables.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default()
    }

    fn resolve(&self, path: &str) -> Result<VarId> {
        self.guard()?;
        let files = self.files.lock();
        let file = files
            .get(&self.path)
            .ok_or_else(|| Error::resource(&self.path, "no such file"))?;
        file.variables
            .iter()
            .position(|v| v.name == path)
            .map(VarId)
            .ok_or_else(|| Error::resource(&self.path, format!("no such variable: {path}")))
    }

    fn describe(&self, var: VarId) -> Result<VarInfo> {
        self.with_var(var, |_, v| {
            Ok(VarInfo {
                name: v.name.clone(),
                dimensions: v.dimensions.clone(),
                dtype: v.data.dtype(),
                attributes: v.attributes.clone(),
            })
        })
    }

    async fn read_block(&self, var: VarId, start: &[usize], count: &[usize]) -> Result<Block> {
        self.with_var(var, |file, v| {
            check_bounds(
                &format!("{}:{}", self.path, v.name),
                &file.shape_of(v),
                start,
                count,
            )?;
            Ok(v.data.read_region(&region(start, count)))
        })
    }

    async fn write_block(
        &self,
        var: VarId,
        start: &[usize],
        count: &[usize],
        data: &Block,
    ) -> Result<()> {
        self.guard()?;
        self.writable()?;
        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.path)
            .ok_or_else(|| Error::resource(&self.path, "no such file"))?;
        let shape = file
            .variables
            .get(var.0)
            .map(|v| file.shape_of(v))
            .ok_or_else(|| Error::resource(&self.path, "stale variable identifier"))?;
        let v = &mut file.variables[var.0];
        check_bounds(&format!("{}:{}", self.path, v.name), &shape, start, count)?;
        v.data.write_region(&region(start, count), data)
    }

    async fn set_attr(&self, var: Option<VarId>, name: &str, value: AttrValue) -> Result<()> {
        self.guard()?;
        self.writable()?;
        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.path)
            .ok_or_else(|| Error::resource(&self.path, "no such file"))?;
        let attrs = match var {
            None => &mut file.attributes,
            Some(id) => {
                &mut file
                    .variables
                    .get_mut(id.0)
                    .ok_or_else(|| Error::resource(&self.path, "stale variable identifier"))?
                    .attributes
            }
        };
        attrs.insert(name.to_string(), value);

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.live.lock() -= 1;
        }

        Ok(())
    }
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        // Backstop for handles shared across views and dropped without an
        // explicit close.
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.live.lock() -= 1;
        }
    }
}

pub(crate) fn store() -> Arc<MemStore> {
    Arc::new(MemStore::new())
}

/// One `time` dimension and an unpacked i16 `temp` variable.
pub(crate) fn weather_file(store: &MemStore, path: &str, values: &[i16]) {
    store.add_file(
        path,
        vec![Dimension::new("time", values.len())],
        AttrSet::new(),
    );
    store.add_var(
        path,
        "temp",
        &["time"],
        AttrSet::new(),
        Block::I16(Array1::from(values.to_vec()).into_dyn()),
    );
}

/// A CF-packed i16 `temp` variable with scale, offset and an optional fill.
pub(crate) fn packed_file(
    store: &MemStore,
    path: &str,
    values: &[i16],
    scale: f64,
    offset: f64,
    fill: Option<i16>,
) {
    let mut attrs = AttrSet::new();
    attrs.insert("scale_factor".to_string(), AttrValue::F64(scale));
    attrs.insert("add_offset".to_string(), AttrValue::F64(offset));
    if let Some(fill) = fill {
        attrs.insert("_FillValue".to_string(), AttrValue::I16(fill));
    }
    store.add_file(
        path,
        vec![Dimension::new("time", values.len())],
        AttrSet::new(),
    );
    store.add_var(
        path,
        "temp",
        &["time"],
        attrs,
        Block::I16(Array1::from(values.to_vec()).into_dyn()),
    );
}

/// An f64 `temp` variable with only a fill value configured.
pub(crate) fn float_file(store: &MemStore, path: &str, values: &[f64], fill: Option<f64>) {
    let mut attrs = AttrSet::new();
    if let Some(fill) = fill {
        attrs.insert("_FillValue".to_string(), AttrValue::F64(fill));
    }
    store.add_file(
        path,
        vec![Dimension::new("time", values.len())],
        AttrSet::new(),
    );
    store.add_var(
        path,
        "temp",
        &["time"],
        attrs,
        Block::F64(Array1::from(values.to_vec()).into_dyn()),
    );
}

/// An i16 `temp` variable with only a fill value configured.
pub(crate) fn int_fill_file(store: &MemStore, path: &str, values: &[i16], fill: i16) {
    let mut attrs = AttrSet::new();
    attrs.insert("_FillValue".to_string(), AttrValue::I16(fill));
    store.add_file(
        path,
        vec![Dimension::new("time", values.len())],
        AttrSet::new(),
    );
    store.add_var(
        path,
        "temp",
        &["time"],
        attrs,
        Block::I16(Array1::from(values.to_vec()).into_dyn()),
    );
}

/// A three-dimensional f64 `grid` variable with
/// `grid[t, y, x] = t * 100 + y * 10 + x`.
pub(crate) fn grid_file(store: &MemStore, path: &str, t: usize, y: usize, x: usize) {
    store.add_file(
        path,
        vec![
            Dimension::new("time", t),
            Dimension::new("y", y),
            Dimension::new("x", x),
        ],
        AttrSet::new(),
    );
    let data = Array3::from_shape_fn((t, y, x), |(t, y, x)| (t * 100 + y * 10 + x) as f64);
    store.add_var(path, "grid", &["time", "y", "x"], AttrSet::new(), Block::F64(data.into_dyn()));
}

/// An aggregation member: `temp[t, y] = base + t * y_len + y` over
/// `(time, y)`, plus a per-file `lat` coordinate over `y`.
pub(crate) fn member_file(store: &MemStore, path: &str, time_len: usize, y_len: usize, base: f64) {
    let mut attrs = AttrSet::new();
    attrs.insert(
        "source".to_string(),
        AttrValue::Str(path.to_string()),
    );
    store.add_file(
        path,
        vec![
            Dimension::new("time", time_len),
            Dimension::new("y", y_len),
        ],
        attrs,
    );
    let temp = Array2::from_shape_fn((time_len, y_len), |(t, y)| base + (t * y_len + y) as f64);
    store.add_var(path, "temp", &["time", "y"], AttrSet::new(), Block::F64(temp.into_dyn()));
    let lat = Array1::from_shape_fn(y_len, |y| (y * 10) as f64);
    store.add_var(path, "lat", &["y"], AttrSet::new(), Block::F64(lat.into_dyn()));
}
