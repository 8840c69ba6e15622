use std::fmt::Display;
use std::result;

use thiserror::Error;

/// Errors raised by the virtual array layers.
///
/// Every variant carries enough context to identify the offending entity (a
/// file path, a `path:variable` pair, or an aggregation member index) and the
/// reason for the failure.
///
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying open/close/resolve failure: missing file, permission
    /// denied, corrupt metadata.
    #[error("resource error: {path}: {reason}")]
    Resource { path: String, reason: String },

    /// An index out of bounds, or a packed value outside the stored type's
    /// representable range. Never clamped.
    #[error("range error: {entity}: {reason}")]
    Range { entity: String, reason: String },

    /// An aggregation member disagrees with the reference member on shape or
    /// dimensions. Raised at construction, not at first access.
    #[error("structure error: member {member}: {reason}")]
    Structure { member: usize, reason: String },

    /// A missing-value write without a configured fill value, or an element
    /// type the requested operation cannot represent.
    #[error("encoding error: {entity}: {reason}")]
    Encoding { entity: String, reason: String },
}

impl Error {
    pub fn resource(path: impl Into<String>, reason: impl Display) -> Self {
        Self::Resource {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn range(entity: impl Into<String>, reason: impl Display) -> Self {
        Self::Range {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }

    pub fn out_of_bounds(
        entity: impl Into<String>,
        start: &[usize],
        count: &[usize],
        shape: &[usize],
    ) -> Self {
        Self::Range {
            entity: entity.into(),
            reason: format!(
                "start {start:?} with count {count:?} is out of bounds for shape {shape:?}"
            ),
        }
    }

    pub fn structure(member: usize, reason: impl Display) -> Self {
        Self::Structure {
            member,
            reason: reason.to_string(),
        }
    }

    pub fn encoding(entity: impl Into<String>, reason: impl Display) -> Self {
        Self::Encoding {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
