use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    block::{Block, DataType},
    errors::Result,
};

/// How a file resource is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Create,
}

/// A scalar attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Str(String),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl AttrValue {
    /// The numeric value as `f64`, if this attribute is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Str(_) => None,
            AttrValue::I8(v) => Some(*v as f64),
            AttrValue::I16(v) => Some(*v as f64),
            AttrValue::I32(v) => Some(*v as f64),
            AttrValue::I64(v) => Some(*v as f64),
            AttrValue::F32(v) => Some(*v as f64),
            AttrValue::F64(v) => Some(*v),
        }
    }
}

pub type AttrSet = HashMap<String, AttrValue>;

/// A named axis with a length, shared by reference across the variables of
/// one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub len: usize,
}

impl Dimension {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            len,
        }
    }
}

/// An opaque variable identifier, valid only within the handle that resolved
/// it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarId(pub usize);

/// Description of one stored variable, as reported by a handle.
#[derive(Clone, Debug)]
pub struct VarInfo {
    pub name: String,
    /// Dimension names in file-storage order.
    pub dimensions: Vec<String>,
    pub dtype: DataType,
    pub attributes: AttrSet,
}

/// The consumed low-level file-format capability.
///
/// The composition layers treat this as an opaque binding: they open a file,
/// interrogate its metadata, move rectangular blocks in and out, and close
/// it. Nothing here is specific to any particular on-disk encoding.
///
#[async_trait]
pub trait Store: Send + Sync {
    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>>;
}

/// One open file resource.
///
/// Metadata queries are answered without further I/O; block transfer is
/// asynchronous. `close` is idempotent, and implementations also release on
/// drop so that a handle shared by many views is returned exactly when the
/// last view goes away.
///
#[async_trait]
pub trait FileHandle: Send + Sync {
    fn dimensions(&self) -> Vec<Dimension>;

    fn attributes(&self) -> AttrSet;

    /// Paths of the variables stored in this file, in definition order.
    fn variables(&self) -> Vec<String>;

    /// Locate a variable by its path within the file.
    fn resolve(&self, path: &str) -> Result<VarId>;

    fn describe(&self, var: VarId) -> Result<VarInfo>;

    async fn read_block(&self, var: VarId, start: &[usize], count: &[usize]) -> Result<Block>;

    async fn write_block(
        &self,
        var: VarId,
        start: &[usize],
        count: &[usize],
        data: &Block,
    ) -> Result<()>;

    /// Set an attribute on a variable, or on the file itself when `var` is
    /// `None`.
    async fn set_attr(&self, var: Option<VarId>, name: &str, value: AttrValue) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
