// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `Data` tree: the value shape user target code produces and consumes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::TargetError;
use crate::{AssetId, ExecutionId};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Resolves another execution's result on demand.
///
/// Bound into an [`ExecutionHandle`] at deserialisation time; the concrete
/// implementation is a closure over the worker's channel, so the capability
/// never crosses a process boundary.
pub trait ResolveResult: Send + Sync {
    /// Block until the referenced execution has a result, then return it.
    ///
    /// Inside a suspense scope the wait is bounded; a deadline miss surfaces
    /// as [`TargetError::Suspended`].
    fn resolve(&self, id: ExecutionId) -> Result<Data, TargetError>;
}

/// Restores a persisted asset into the working directory on demand.
pub trait RestoreAsset: Send + Sync {
    /// Fetch the asset's backing blob and recreate it at `to` (or at its
    /// original path when `to` is `None`). Returns the restored path.
    fn restore(&self, id: AssetId, to: Option<&Path>) -> Result<PathBuf, TargetError>;
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A handle to another execution's eventual result.
///
/// Equality and hashing consider only the id; the bound resolver is a
/// capability, not part of the value.
#[derive(Clone)]
pub struct ExecutionHandle {
    id: ExecutionId,
    resolver: Option<Arc<dyn ResolveResult>>,
}

impl ExecutionHandle {
    /// A handle with a bound resolver.
    pub fn bound(id: ExecutionId, resolver: Arc<dyn ResolveResult>) -> Self {
        Self {
            id,
            resolver: Some(resolver),
        }
    }

    /// A handle carrying only the id. Calling [`result`](Self::result) on a
    /// detached handle is an error; detached handles exist so values can be
    /// constructed and serialised outside an execution context.
    pub fn detached(id: ExecutionId) -> Self {
        Self { id, resolver: None }
    }

    /// The server-assigned execution id.
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Resolve the referenced execution's result, blocking until available.
    pub fn result(&self) -> Result<Data, TargetError> {
        match &self.resolver {
            Some(resolver) => resolver.resolve(self.id),
            None => Err(TargetError::detached_handle("execution", self.id)),
        }
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("bound", &self.resolver.is_some())
            .finish()
    }
}

impl PartialEq for ExecutionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// A handle to a persisted filesystem artifact.
#[derive(Clone)]
pub struct AssetHandle {
    id: AssetId,
    restorer: Option<Arc<dyn RestoreAsset>>,
}

impl AssetHandle {
    /// A handle with a bound restorer.
    pub fn bound(id: AssetId, restorer: Arc<dyn RestoreAsset>) -> Self {
        Self {
            id,
            restorer: Some(restorer),
        }
    }

    /// A handle carrying only the id.
    pub fn detached(id: AssetId) -> Self {
        Self { id, restorer: None }
    }

    /// The server-assigned asset id.
    pub fn id(&self) -> AssetId {
        self.id
    }

    /// Restore the asset into the working directory.
    ///
    /// `to` must resolve inside the working directory; `None` restores to
    /// the path the asset was captured from.
    pub fn restore(&self, to: Option<&Path>) -> Result<PathBuf, TargetError> {
        match &self.restorer {
            Some(restorer) => restorer.restore(self.id, to),
            None => Err(TargetError::detached_handle("asset", self.id)),
        }
    }
}

impl fmt::Debug for AssetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetHandle")
            .field("id", &self.id)
            .field("bound", &self.restorer.is_some())
            .finish()
    }
}

impl PartialEq for AssetHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// The polymorphic value tree passed to and returned from targets.
///
/// Scalars, lists, dicts, sets, and tuples map onto the JSON envelope
/// directly (dicts/sets/tuples as tagged objects). Handles become entries in
/// the envelope's reference list. `Bytes`, `Table`, and `Record` have no
/// JSON form and are carried as fragment references through the codec chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// The null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A double-precision float.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// An ordered list.
    List(Vec<Data>),
    /// An insertion-ordered mapping with arbitrary keys.
    Dict(Vec<(Data, Data)>),
    /// An insertion-ordered set of unique values.
    Set(Vec<Data>),
    /// A fixed-length tuple.
    Tuple(Vec<Data>),
    /// A handle to another execution's result.
    Execution(ExecutionHandle),
    /// A handle to a persisted asset.
    Asset(AssetHandle),
    /// Opaque binary content.
    Bytes(Vec<u8>),
    /// Columnar records: one row per entry, cells aligned with `columns`.
    Table {
        /// Column names, in order.
        columns: Vec<String>,
        /// Row-major cells; every row has `columns.len()` entries.
        rows: Vec<Vec<Data>>,
    },
    /// A named record validated against a registered model schema.
    Record {
        /// Model name the fields are validated against.
        model: String,
        /// Insertion-ordered field values.
        fields: Vec<(String, Data)>,
    },
}

impl Data {
    /// Shorthand for `Data::String`.
    pub fn string(s: impl Into<String>) -> Self {
        Data::String(s.into())
    }

    /// Returns `true` if the tree contains no handle and no codec-only
    /// variant, i.e. it round-trips through plain JSON.
    pub fn is_plain(&self) -> bool {
        match self {
            Data::Null | Data::Bool(_) | Data::Int(_) | Data::Float(_) | Data::String(_) => true,
            Data::List(items) | Data::Set(items) | Data::Tuple(items) => {
                items.iter().all(Data::is_plain)
            }
            Data::Dict(pairs) => pairs.iter().all(|(k, v)| k.is_plain() && v.is_plain()),
            Data::Execution(_)
            | Data::Asset(_)
            | Data::Bytes(_)
            | Data::Table { .. }
            | Data::Record { .. } => false,
        }
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

impl From<i64> for Data {
    fn from(value: i64) -> Self {
        Data::Int(value)
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Float(value)
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::String(value.to_string())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::String(value)
    }
}

impl<T: Into<Data>> From<Vec<T>> for Data {
    fn from(value: Vec<T>) -> Self {
        Data::List(value.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(Data);

    impl ResolveResult for FixedResolver {
        fn resolve(&self, _id: ExecutionId) -> Result<Data, TargetError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn handle_equality_ignores_capability() {
        let detached = ExecutionHandle::detached(7);
        let bound = ExecutionHandle::bound(7, Arc::new(FixedResolver(Data::Null)));
        assert_eq!(detached, bound);
        assert_ne!(detached, ExecutionHandle::detached(8));
    }

    #[test]
    fn detached_handle_errors_on_use() {
        let handle = ExecutionHandle::detached(3);
        assert!(handle.result().is_err());
        let asset = AssetHandle::detached(3);
        assert!(asset.restore(None).is_err());
    }

    #[test]
    fn bound_handle_resolves() {
        let handle = ExecutionHandle::bound(1, Arc::new(FixedResolver(Data::Int(42))));
        assert_eq!(handle.result().unwrap(), Data::Int(42));
    }

    #[test]
    fn plain_classification() {
        assert!(Data::List(vec![Data::Int(1), Data::string("x")]).is_plain());
        assert!(!Data::List(vec![Data::Bytes(vec![1])]).is_plain());
        assert!(!Data::Execution(ExecutionHandle::detached(1)).is_plain());
    }
}
