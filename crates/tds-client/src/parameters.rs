//! Command parameters.
//!
//! Source [`Parameter`]s are resolved once per execution into a
//! [`ParameterContext`]: an immutable array of wire-ready values whose
//! backing `Vec` is rented from a shared [`ParameterArena`] and handed back
//! when the context is dropped. A [`ParameterCache`] reuses contexts for
//! structurally equal parameter lists.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use lru::LruCache;
use parking_lot::Mutex;
use tds_protocol::rpc::{NVARCHAR_MAX_INLINE, nvarchar_type_for};
use tds_protocol::{BufferWriter, RpcParam, TypeId, TypeInfo};

use crate::error::{Error, Result};

/// Longest parameter name, in UTF-16 code units.
pub const MAX_NAME_CHARS: usize = 128;

/// Largest value accepted, in wire bytes.
pub const MAX_VALUE_BYTES: usize = i32::MAX as usize;

/// Largest inline `VARBINARY`, in bytes.
const VARBINARY_MAX_INLINE: usize = 8000;

/// A parameter value.
#[derive(Debug, Clone)]
pub enum ParameterValue {
    /// SQL NULL.
    Null,
    /// `bit`.
    Bool(bool),
    /// `int`.
    I32(i32),
    /// `bigint`.
    I64(i64),
    /// `float`.
    F64(f64),
    /// `nvarchar`.
    String(String),
    /// `varbinary`.
    Binary(Bytes),
}

impl PartialEq for ParameterValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            // Bitwise, so the relation stays reflexive for NaN.
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ParameterValue {}

impl Hash for ParameterValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::I32(v) => v.hash(state),
            Self::I64(v) => v.hash(state),
            Self::F64(v) => v.to_bits().hash(state),
            Self::String(v) => v.hash(state),
            Self::Binary(v) => v.hash(state),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Bytes> for ParameterValue {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

impl From<Vec<u8>> for ParameterValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(v))
    }
}

impl<T: Into<ParameterValue>> From<Option<T>> for ParameterValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A named parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Parameter {
    /// Name, with or without the leading `@`.
    pub name: String,
    /// Value.
    pub value: ParameterValue,
}

impl Parameter {
    /// Create a parameter.
    pub fn new(name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn wire_name(&self) -> String {
        if self.name.is_empty() || self.name.starts_with('@') {
            self.name.clone()
        } else {
            format!("@{}", self.name)
        }
    }

    /// Resolve to a wire type and encoded value.
    pub fn resolve(&self) -> Result<ResolvedParameter> {
        // Counted in UTF-16 code units, as the name goes out as a B_VARCHAR.
        let units = self.name.trim_start_matches('@').encode_utf16().count();
        if units > MAX_NAME_CHARS {
            return Err(Error::Validation(format!(
                "parameter name has {units} UTF-16 code units, limit is {MAX_NAME_CHARS}"
            )));
        }

        let (type_info, value, value_dependent) = match &self.value {
            ParameterValue::Null => (nvarchar_type_for(0), None, false),
            ParameterValue::Bool(v) => (
                TypeInfo::nullable(TypeId::BitN, 1),
                Some(Bytes::copy_from_slice(&[u8::from(*v)])),
                false,
            ),
            ParameterValue::I32(v) => (
                TypeInfo::nullable(TypeId::IntN, 4),
                Some(Bytes::copy_from_slice(&v.to_le_bytes())),
                false,
            ),
            ParameterValue::I64(v) => (
                TypeInfo::nullable(TypeId::IntN, 8),
                Some(Bytes::copy_from_slice(&v.to_le_bytes())),
                false,
            ),
            ParameterValue::F64(v) => (
                TypeInfo::nullable(TypeId::FloatN, 8),
                Some(Bytes::copy_from_slice(&v.to_le_bytes())),
                false,
            ),
            ParameterValue::String(s) => {
                check_size(&self.name, s.len().saturating_mul(2))?;
                let mut buf = BytesMut::with_capacity(s.len() * 2);
                buf.write_utf16(s);
                check_size(&self.name, buf.len())?;
                (nvarchar_type_for(buf.len()), Some(buf.freeze()), true)
            }
            ParameterValue::Binary(b) => {
                check_size(&self.name, b.len())?;
                let type_info = if b.len() > VARBINARY_MAX_INLINE {
                    TypeInfo::varbinary(0xFFFF)
                } else {
                    TypeInfo::varbinary(VARBINARY_MAX_INLINE as u16)
                };
                (type_info, Some(b.clone()), true)
            }
        };

        Ok(ResolvedParameter {
            name: self.wire_name(),
            is_null: value.is_none(),
            type_info,
            value,
            value_dependent,
        })
    }
}

fn check_size(name: &str, len: usize) -> Result<()> {
    if len > MAX_VALUE_BYTES {
        return Err(Error::Validation(format!(
            "parameter {name} is {len} bytes, limit is {MAX_VALUE_BYTES}"
        )));
    }
    Ok(())
}

/// A parameter resolved for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParameter {
    /// Wire name (`@name`).
    pub name: String,
    /// Wire type.
    pub type_info: TypeInfo,
    /// Encoded value; `None` is NULL.
    pub value: Option<Bytes>,
    /// Whether the value is NULL.
    pub is_null: bool,
    /// Whether the wire type depends on the value's length.
    pub value_dependent: bool,
}

impl ResolvedParameter {
    /// Wire type id.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_info.type_id
    }

    /// Check if the value needs the `(max)` form of its type.
    #[must_use]
    pub fn is_plp(&self) -> bool {
        self.value_dependent
            && self
                .value
                .as_ref()
                .is_some_and(|v| v.len() > NVARCHAR_MAX_INLINE)
    }

    /// Build the RPC parameter.
    #[must_use]
    pub fn to_rpc_param(&self) -> RpcParam {
        RpcParam::new(self.name.clone(), self.type_info.clone(), self.value.clone())
    }
}

/// Shared pool of parameter arrays.
#[derive(Debug)]
pub struct ParameterArena {
    free: Mutex<Vec<Vec<ResolvedParameter>>>,
    max_pooled: usize,
    outstanding: AtomicUsize,
}

impl ParameterArena {
    /// Create an arena keeping up to `max_pooled` idle arrays.
    #[must_use]
    pub fn new(max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
            outstanding: AtomicUsize::new(0),
        })
    }

    fn rent(&self, capacity: usize) -> Vec<ResolvedParameter> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let mut items = self.free.lock().pop().unwrap_or_default();
        items.reserve(capacity);
        items
    }

    fn give_back(&self, mut items: Vec<ResolvedParameter>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        items.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(items);
        }
    }

    /// Arrays currently rented out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Idle arrays kept for reuse.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

/// Returns a rented array to its arena when dropped.
struct Lease {
    arena: Arc<ParameterArena>,
    items: Vec<ResolvedParameter>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.arena.give_back(std::mem::take(&mut self.items));
    }
}

/// Immutable resolved parameters for one execution.
pub struct ParameterContext {
    lease: Lease,
}

impl ParameterContext {
    /// Resolve `params`. Any validation failure returns the rented array
    /// before reporting.
    pub fn build(arena: &Arc<ParameterArena>, params: &[Parameter]) -> Result<Self> {
        let mut lease = Lease {
            arena: Arc::clone(arena),
            items: arena.rent(params.len()),
        };
        for param in params {
            lease.items.push(param.resolve()?);
        }
        Ok(Self { lease })
    }

    /// An empty context.
    #[must_use]
    pub fn empty(arena: &Arc<ParameterArena>) -> Self {
        Self {
            lease: Lease {
                arena: Arc::clone(arena),
                items: arena.rent(0),
            },
        }
    }

    /// The resolved parameters.
    #[must_use]
    pub fn parameters(&self) -> &[ResolvedParameter] {
        &self.lease.items
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lease.items.len()
    }

    /// Check if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lease.items.is_empty()
    }

    /// Build the RPC parameters.
    #[must_use]
    pub fn rpc_params(&self) -> Vec<RpcParam> {
        self.lease
            .items
            .iter()
            .map(ResolvedParameter::to_rpc_param)
            .collect()
    }
}

impl std::fmt::Debug for ParameterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.parameters()).finish()
    }
}

/// Reuses parameter contexts for structurally equal parameter lists.
///
/// Full caches evict the least recently used list.
pub struct ParameterCache {
    arena: Arc<ParameterArena>,
    /// `None` when caching is disabled.
    entries: Mutex<Option<LruCache<Vec<Parameter>, Arc<ParameterContext>>>>,
    capacity: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ParameterCache {
    /// Create a cache holding up to `capacity` contexts.
    #[must_use]
    pub fn new(arena: Arc<ParameterArena>, capacity: usize) -> Self {
        Self {
            arena,
            entries: Mutex::new(NonZeroUsize::new(capacity).map(LruCache::new)),
            capacity,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// The arena contexts are built from.
    #[must_use]
    pub fn arena(&self) -> &Arc<ParameterArena> {
        &self.arena
    }

    /// Get the context for `params`, building it on a miss.
    pub fn get_or_build(&self, params: &[Parameter]) -> Result<Arc<ParameterContext>> {
        let mut entries = self.entries.lock();
        if let Some(context) = entries.as_mut().and_then(|cache| cache.get(params)) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(context));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let context = Arc::new(ParameterContext::build(&self.arena, params)?);
        if let Some(cache) = entries.as_mut() {
            cache.put(params.to_vec(), Arc::clone(&context));
        }
        Ok(context)
    }

    /// Number of cached contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().as_ref().map_or(0, LruCache::len)
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookups served from the cache.
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that built a new context.
    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    /// Drop every cached context.
    pub fn clear(&self) {
        if let Some(cache) = self.entries.lock().as_mut() {
            cache.clear();
        }
    }
}

impl std::fmt::Debug for ParameterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::LengthKind;

    #[test]
    fn test_resolution() {
        let int = Parameter::new("id", 42).resolve().unwrap();
        assert_eq!(int.name, "@id");
        assert_eq!(int.type_id(), TypeId::IntN);
        assert_eq!(int.value.as_deref(), Some(&42i32.to_le_bytes()[..]));
        assert!(!int.value_dependent);

        let big = Parameter::new("@n", 7i64).resolve().unwrap();
        assert_eq!(big.type_info.max_length, Some(8));

        let text = Parameter::new("name", "héllo").resolve().unwrap();
        assert_eq!(text.type_id(), TypeId::NVarChar);
        assert_eq!(text.value.as_ref().unwrap().len(), 10);
        assert!(text.value_dependent);
        assert!(!text.is_plp());

        let null = Parameter::new("x", None::<i32>).resolve().unwrap();
        assert!(null.is_null);
        assert!(null.value.is_none());
    }

    #[test]
    fn test_long_values_use_max_types() {
        let text = Parameter::new("doc", "a".repeat(4001)).resolve().unwrap();
        assert_eq!(text.type_info.length_kind, LengthKind::Plp);
        assert!(text.is_plp());

        let blob = Parameter::new("b", vec![0u8; 8001]).resolve().unwrap();
        assert_eq!(blob.type_info.length_kind, LengthKind::Plp);

        let small = Parameter::new("b", vec![0u8; 10]).resolve().unwrap();
        assert_eq!(small.type_info.length_kind, LengthKind::UShort);
    }

    #[test]
    fn test_name_too_long_is_rejected() {
        let err = Parameter::new("p".repeat(129), 1).resolve().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(Parameter::new(format!("@{}", "p".repeat(128)), 1).resolve().is_ok());

        // 100 characters, 200 code units on the wire.
        let wide = "\u{1F600}".repeat(100);
        let err = Parameter::new(wide, 1).resolve().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        let a = ParameterValue::F64(f64::NAN);
        assert_eq!(a, a.clone());
        assert_ne!(ParameterValue::F64(0.0), ParameterValue::F64(-0.0));
        assert_ne!(ParameterValue::I32(1), ParameterValue::I64(1));
    }

    #[test]
    fn test_context_returns_array_once() {
        let arena = ParameterArena::new(4);
        {
            let ctx = ParameterContext::build(&arena, &[Parameter::new("a", 1)]).unwrap();
            assert_eq!(arena.outstanding(), 1);
            assert_eq!(ctx.len(), 1);
            assert_eq!(ctx.rpc_params()[0].name, "@a");
        }
        assert_eq!(arena.outstanding(), 0);
        assert_eq!(arena.pooled(), 1);

        let reused = ParameterContext::empty(&arena);
        assert_eq!(arena.pooled(), 0);
        drop(reused);
        assert_eq!(arena.pooled(), 1);
    }

    #[test]
    fn test_failed_build_returns_array() {
        let arena = ParameterArena::new(4);
        let params = [Parameter::new("ok", 1), Parameter::new("x".repeat(200), 2)];
        assert!(ParameterContext::build(&arena, &params).is_err());
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn test_cache_reuses_equal_lists() {
        let cache = ParameterCache::new(ParameterArena::new(8), 2);
        let params = vec![Parameter::new("a", 1), Parameter::new("b", "x")];

        let first = cache.get_or_build(&params).unwrap();
        let second = cache.get_or_build(&params.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.hits(), 1);

        let other = cache.get_or_build(&[Parameter::new("a", 2)]).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(cache.len(), 2);

        cache.get_or_build(&[Parameter::new("c", 3)]).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let arena = ParameterArena::new(8);
        let cache = ParameterCache::new(Arc::clone(&arena), 2);
        let a = [Parameter::new("a", 1)];
        let b = [Parameter::new("b", 2)];

        let first_a = cache.get_or_build(&a).unwrap();
        cache.get_or_build(&b).unwrap();
        // Touch `a` so `b` is the oldest.
        cache.get_or_build(&a).unwrap();
        cache.get_or_build(&[Parameter::new("c", 3)]).unwrap();
        assert_eq!(cache.len(), 2);

        assert!(Arc::ptr_eq(&first_a, &cache.get_or_build(&a).unwrap()));
        let misses = cache.misses();
        cache.get_or_build(&b).unwrap();
        assert_eq!(cache.misses(), misses + 1, "`b` was evicted");
    }

    #[test]
    fn test_disabled_cache_builds_every_time() {
        let cache = ParameterCache::new(ParameterArena::new(8), 0);
        let params = [Parameter::new("a", 1)];
        let first = cache.get_or_build(&params).unwrap();
        let second = cache.get_or_build(&params).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(cache.is_empty());
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn test_cache_entries_release_on_clear() {
        let arena = ParameterArena::new(8);
        let cache = ParameterCache::new(Arc::clone(&arena), 4);
        cache.get_or_build(&[Parameter::new("a", 1)]).unwrap();
        assert_eq!(arena.outstanding(), 1);
        cache.clear();
        assert_eq!(arena.outstanding(), 0);
    }
}
