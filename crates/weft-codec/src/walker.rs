// SPDX-License-Identifier: MIT OR Apache-2.0
//! The composite tree walker: `Data` ⇄ `Value` envelopes.
//!
//! The walk is type-directed for known shapes (scalars, lists, dicts, sets,
//! tuples, handles) and falls back to the codec chain for everything else.
//! Handles are flattened into the envelope's reference list; a handle that
//! appears many times in the tree deduplicates to one entry.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Map, Value as Json};
use weft_blob::{key_of, BlobStore};
use weft_core::{
    AssetHandle, BlobKey, Data, ExecutionHandle, Metadata, Reference, ResolveResult, RestoreAsset,
    Value,
};

use crate::{CodecError, SerialiserRegistry};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Capabilities bound into handles during deserialisation.
///
/// Without them the walk still succeeds, producing detached handles that
/// error on use; that is the right behaviour outside an execution context.
#[derive(Clone, Default)]
pub struct Capabilities {
    /// Resolves execution references.
    pub resolver: Option<Arc<dyn ResolveResult>>,
    /// Restores asset references.
    pub restorer: Option<Arc<dyn RestoreAsset>>,
}

impl Capabilities {
    /// Capabilities that produce detached handles.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Capabilities with both a resolver and a restorer.
    pub fn bound(resolver: Arc<dyn ResolveResult>, restorer: Arc<dyn RestoreAsset>) -> Self {
        Self {
            resolver: Some(resolver),
            restorer: Some(restorer),
        }
    }

    fn execution(&self, id: weft_core::ExecutionId) -> Data {
        match &self.resolver {
            Some(resolver) => Data::Execution(ExecutionHandle::bound(id, resolver.clone())),
            None => Data::Execution(ExecutionHandle::detached(id)),
        }
    }

    fn asset(&self, id: weft_core::AssetId) -> Data {
        match &self.restorer {
            Some(restorer) => Data::Asset(AssetHandle::bound(id, restorer.clone())),
            None => Data::Asset(AssetHandle::detached(id)),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialise
// ---------------------------------------------------------------------------

enum Pending {
    Execution(weft_core::ExecutionId),
    Asset(weft_core::AssetId),
    Fragment {
        serialiser: String,
        content: Vec<u8>,
        key: BlobKey,
        metadata: Metadata,
    },
}

impl Pending {
    fn matches(&self, other: &Pending) -> bool {
        match (self, other) {
            (Pending::Execution(a), Pending::Execution(b)) => a == b,
            (Pending::Asset(a), Pending::Asset(b)) => a == b,
            (
                Pending::Fragment {
                    serialiser: tag_a,
                    key: key_a,
                    ..
                },
                Pending::Fragment {
                    serialiser: tag_b,
                    key: key_b,
                    ..
                },
            ) => tag_a == tag_b && key_a == key_b,
            _ => false,
        }
    }
}

fn intern(pending: &mut Vec<Pending>, candidate: Pending) -> usize {
    match pending.iter().position(|existing| existing.matches(&candidate)) {
        Some(index) => index,
        None => {
            pending.push(candidate);
            pending.len() - 1
        }
    }
}

fn ref_placeholder(index: usize) -> Json {
    json!({"type": "ref", "index": index})
}

fn tagged(kind: &str, items: Vec<Json>) -> Json {
    let mut object = Map::new();
    object.insert("type".into(), json!(kind));
    object.insert("items".into(), Json::Array(items));
    Json::Object(object)
}

fn encode_tree(
    data: &Data,
    registry: &SerialiserRegistry,
    pending: &mut Vec<Pending>,
) -> Result<Json, CodecError> {
    match data {
        Data::Null => Ok(Json::Null),
        Data::Bool(b) => Ok(json!(b)),
        Data::Int(i) => Ok(json!(i)),
        Data::Float(f) => Ok(json!(f)),
        Data::String(s) => Ok(json!(s)),
        Data::List(items) => Ok(Json::Array(
            items
                .iter()
                .map(|item| encode_tree(item, registry, pending))
                .collect::<Result<_, _>>()?,
        )),
        Data::Dict(pairs) => {
            // Flat alternating [k, v, k, v, …]; JSON objects can't carry
            // arbitrary keys.
            let mut items = Vec::with_capacity(pairs.len() * 2);
            for (key, value) in pairs {
                items.push(encode_tree(key, registry, pending)?);
                items.push(encode_tree(value, registry, pending)?);
            }
            Ok(tagged("dict", items))
        }
        Data::Set(items) => Ok(tagged(
            "set",
            items
                .iter()
                .map(|item| encode_tree(item, registry, pending))
                .collect::<Result<_, _>>()?,
        )),
        Data::Tuple(items) => Ok(tagged(
            "tuple",
            items
                .iter()
                .map(|item| encode_tree(item, registry, pending))
                .collect::<Result<_, _>>()?,
        )),
        Data::Execution(handle) => {
            let index = intern(pending, Pending::Execution(handle.id()));
            Ok(ref_placeholder(index))
        }
        Data::Asset(handle) => {
            let index = intern(pending, Pending::Asset(handle.id()));
            Ok(ref_placeholder(index))
        }
        other => {
            let (serialiser, content, metadata) = registry.serialise(other)?;
            let key = key_of(&content);
            let index = intern(
                pending,
                Pending::Fragment {
                    serialiser,
                    content,
                    key,
                    metadata,
                },
            );
            Ok(ref_placeholder(index))
        }
    }
}

/// Serialise a value into its envelope, offloading fragments and oversize
/// trees to `store`.
///
/// The envelope is `Raw` when the canonical JSON of the tree is within
/// `threshold` bytes, `Blob` otherwise.
pub async fn serialise(
    data: &Data,
    registry: &SerialiserRegistry,
    store: &dyn BlobStore,
    threshold: usize,
) -> Result<Value, CodecError> {
    let mut pending = Vec::new();
    let tree = encode_tree(data, registry, &mut pending)?;

    let mut references = Vec::with_capacity(pending.len());
    for entry in pending {
        let reference = match entry {
            Pending::Execution(id) => Reference::Execution { id },
            Pending::Asset(id) => Reference::Asset { id },
            Pending::Fragment {
                serialiser,
                content,
                key: _,
                metadata,
            } => {
                let size = content.len() as u64;
                let blob_key = store.put(Bytes::from(content)).await?;
                Reference::Fragment {
                    serialiser,
                    blob_key,
                    size,
                    metadata,
                }
            }
        };
        references.push(reference);
    }

    let canonical = serde_json::to_vec(&tree)?;
    if canonical.len() > threshold {
        let size = canonical.len() as u64;
        let key = store.put(Bytes::from(canonical)).await?;
        Ok(Value::Blob {
            key,
            size,
            references,
        })
    } else {
        Ok(Value::Raw {
            data: tree,
            references,
        })
    }
}

// ---------------------------------------------------------------------------
// Deserialise
// ---------------------------------------------------------------------------

fn decode_items(
    items: &[Json],
    resolved: &[Data],
) -> Result<Vec<Data>, CodecError> {
    items
        .iter()
        .map(|item| decode_tree(item, resolved))
        .collect()
}

fn decode_tree(tree: &Json, resolved: &[Data]) -> Result<Data, CodecError> {
    match tree {
        Json::Null => Ok(Data::Null),
        Json::Bool(b) => Ok(Data::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Data::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Data::Float(f))
            } else {
                Err(CodecError::UnexpectedTree(tree.to_string()))
            }
        }
        Json::String(s) => Ok(Data::String(s.clone())),
        Json::Array(items) => Ok(Data::List(decode_items(items, resolved)?)),
        Json::Object(object) => {
            let kind = object
                .get("type")
                .and_then(Json::as_str)
                .ok_or_else(|| CodecError::UnexpectedTree(tree.to_string()))?;
            match kind {
                "ref" => {
                    let index = object
                        .get("index")
                        .and_then(Json::as_u64)
                        .ok_or_else(|| CodecError::UnexpectedTree(tree.to_string()))?
                        as usize;
                    resolved
                        .get(index)
                        .cloned()
                        .ok_or(CodecError::ReferenceOutOfBounds {
                            index,
                            len: resolved.len(),
                        })
                }
                "dict" | "set" | "tuple" => {
                    let items = object
                        .get("items")
                        .and_then(Json::as_array)
                        .ok_or_else(|| CodecError::UnexpectedTree(tree.to_string()))?;
                    match kind {
                        "dict" => {
                            if items.len() % 2 != 0 {
                                return Err(CodecError::UnexpectedTree(tree.to_string()));
                            }
                            let decoded = decode_items(items, resolved)?;
                            let mut pairs = Vec::with_capacity(decoded.len() / 2);
                            let mut iter = decoded.into_iter();
                            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                                pairs.push((key, value));
                            }
                            Ok(Data::Dict(pairs))
                        }
                        "set" => Ok(Data::Set(decode_items(items, resolved)?)),
                        _ => Ok(Data::Tuple(decode_items(items, resolved)?)),
                    }
                }
                other => Err(CodecError::UnexpectedTree(format!(
                    "unknown tagged object '{other}'"
                ))),
            }
        }
    }
}

/// Deserialise an envelope back into a value, fetching blob-form trees and
/// fragment contents from `store` and binding `caps` into rebuilt handles.
pub async fn deserialise(
    value: &Value,
    registry: &SerialiserRegistry,
    store: &dyn BlobStore,
    caps: &Capabilities,
) -> Result<Data, CodecError> {
    let tree: Json = match value {
        Value::Raw { data, .. } => data.clone(),
        Value::Blob { key, .. } => serde_json::from_slice(&store.get(key).await?)?,
    };

    let mut resolved = Vec::with_capacity(value.references().len());
    for reference in value.references() {
        let data = match reference {
            Reference::Execution { id } => caps.execution(*id),
            Reference::Asset { id } => caps.asset(*id),
            Reference::Fragment {
                serialiser,
                blob_key,
                metadata,
                ..
            } => {
                let content = store.get(blob_key).await?;
                registry.by_tag(serialiser)?.deserialise(&content, metadata)?
            }
        };
        resolved.push(data);
    }

    decode_tree(&tree, &resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_blob::MemoryStore;
    use weft_core::TargetError;

    struct StubResolver;

    impl ResolveResult for StubResolver {
        fn resolve(&self, id: weft_core::ExecutionId) -> Result<Data, TargetError> {
            Ok(Data::Int(id as i64))
        }
    }

    struct StubRestorer;

    impl RestoreAsset for StubRestorer {
        fn restore(
            &self,
            _id: weft_core::AssetId,
            _to: Option<&std::path::Path>,
        ) -> Result<std::path::PathBuf, TargetError> {
            Ok(std::path::PathBuf::from("restored"))
        }
    }

    fn caps() -> Capabilities {
        Capabilities::bound(Arc::new(StubResolver), Arc::new(StubRestorer))
    }

    async fn round_trip(data: Data, threshold: usize) -> (Data, Value, MemoryStore) {
        let registry = SerialiserRegistry::standard();
        let store = MemoryStore::new();
        let value = serialise(&data, &registry, &store, threshold).await.unwrap();
        let back = deserialise(&value, &registry, &store, &caps()).await.unwrap();
        (back, value, store)
    }

    #[tokio::test]
    async fn plain_tree_stays_raw() {
        let data = Data::Dict(vec![
            (Data::string("xs"), Data::List(vec![Data::Int(1), Data::Int(2)])),
            (Data::Int(3), Data::Tuple(vec![Data::Bool(true), Data::Null])),
        ]);
        let (back, value, store) = round_trip(data.clone(), 1024).await;
        assert_eq!(back, data);
        assert!(matches!(value, Value::Raw { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn oversize_tree_tiers_to_blob() {
        let data = Data::String("x".repeat(1000));
        let (back, value, store) = round_trip(data.clone(), 200).await;
        assert_eq!(back, data);
        let Value::Blob { key, size, .. } = &value else {
            panic!("expected blob envelope, got {value:?}");
        };
        // 1000 chars plus the enclosing quotes.
        assert_eq!(*size, 1002);
        assert_eq!(store.get(key).await.unwrap().len(), 1002);
        // The blob key is the content hash.
        assert_eq!(*key, key_of(&store.get(key).await.unwrap()));
    }

    #[tokio::test]
    async fn repeated_serialisation_uploads_once() {
        let registry = SerialiserRegistry::standard();
        let store = MemoryStore::new();
        let data = Data::String("y".repeat(500));
        let a = serialise(&data, &registry, &store, 100).await.unwrap();
        let b = serialise(&data, &registry, &store, 100).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.puts(), 1);
    }

    #[tokio::test]
    async fn handles_flatten_and_dedup() {
        let handle = Data::Execution(ExecutionHandle::detached(9));
        let data = Data::List(vec![handle.clone(), handle.clone(), Data::Asset(AssetHandle::detached(2))]);
        let (back, value, _) = round_trip(data, 1024).await;

        assert_eq!(
            value.references(),
            &[Reference::Execution { id: 9 }, Reference::Asset { id: 2 }]
        );
        let Value::Raw { data: tree, .. } = &value else {
            panic!("expected raw envelope");
        };
        assert_eq!(tree[0], json!({"type": "ref", "index": 0}));
        assert_eq!(tree[1], json!({"type": "ref", "index": 0}));
        assert_eq!(tree[2], json!({"type": "ref", "index": 1}));

        // Handles come back bound to the supplied capabilities.
        let Data::List(items) = back else { panic!() };
        let Data::Execution(rebuilt) = &items[0] else { panic!() };
        assert_eq!(rebuilt.result().unwrap(), Data::Int(9));
        let Data::Asset(asset) = &items[2] else { panic!() };
        assert_eq!(asset.restore(None).unwrap().to_str(), Some("restored"));
    }

    #[tokio::test]
    async fn opaque_values_become_fragments() {
        let data = Data::List(vec![Data::Bytes(vec![1, 2, 3]), Data::Bytes(vec![1, 2, 3])]);
        let (back, value, store) = round_trip(data.clone(), 1024).await;
        assert_eq!(back, data);

        // Identical opaques share one fragment entry and one blob.
        assert_eq!(value.references().len(), 1);
        let Reference::Fragment { serialiser, blob_key, size, .. } = &value.references()[0] else {
            panic!("expected fragment, got {:?}", value.references());
        };
        assert_eq!(serialiser, "cbor");
        assert_eq!(store.get(blob_key).await.unwrap().len() as u64, *size);
    }

    #[tokio::test]
    async fn structural_equality_gives_byte_equal_envelopes() {
        let registry = SerialiserRegistry::standard();
        let store = MemoryStore::new();
        let make = || {
            Data::Dict(vec![
                (Data::string("a"), Data::Int(1)),
                (Data::string("b"), Data::Set(vec![Data::Int(2)])),
            ])
        };
        let a = serialise(&make(), &registry, &store, 1024).await.unwrap();
        let b = serialise(&make(), &registry, &store, 1024).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&a.to_json()).unwrap(),
            serde_json::to_vec(&b.to_json()).unwrap()
        );
    }

    #[tokio::test]
    async fn ref_out_of_bounds_is_reported() {
        let registry = SerialiserRegistry::standard();
        let store = MemoryStore::new();
        let value = Value::Raw {
            data: json!({"type": "ref", "index": 3}),
            references: vec![],
        };
        let err = deserialise(&value, &registry, &store, &Capabilities::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::ReferenceOutOfBounds { index: 3, .. }));
    }

    #[tokio::test]
    async fn unknown_tagged_object_is_rejected() {
        let registry = SerialiserRegistry::standard();
        let store = MemoryStore::new();
        let value = Value::raw(json!({"type": "frozenset", "items": []}));
        let err = deserialise(&value, &registry, &store, &Capabilities::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedTree(_)));
    }
}
