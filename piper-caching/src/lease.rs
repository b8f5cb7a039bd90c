//! Read access to a cached object

use piper_core::{deserialize_from_bytes, DType, NdArray, Value};

use crate::errors::{CacheError, CacheResult};
use crate::protocol::{CacheEntry, SharedKind};
use crate::shm::Mapping;

/// Borrowed view of a cached payload
#[derive(Debug, PartialEq)]
pub enum CachedView<'a> {
    Array {
        shape: &'a [usize],
        dtype: DType,
        data: &'a [u8],
    },
    List(Vec<Value>),
    Tuple(Vec<Value>),
}

/// A mapped cache entry
///
/// The segment stays mapped until the lease is released or dropped, even if
/// the manager unlinks it in the meantime.
#[derive(Debug)]
pub struct Lease {
    key: String,
    entry: CacheEntry,
    mapping: Mapping,
}

impl Lease {
    pub(crate) fn open(key: &str, entry: CacheEntry) -> CacheResult<Self> {
        let mapping = Mapping::open(&entry.shm_name, entry.size)?;
        Ok(Self {
            key: key.to_string(),
            entry,
            mapping,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// Reattach the payload
    pub fn view(&self) -> CacheResult<CachedView<'_>> {
        let bytes = self.mapping.as_slice();
        match self.entry.kind {
            SharedKind::SharedArray => {
                let dtype = self.entry.dtype.ok_or_else(|| {
                    CacheError::DeserializationError(format!("array {} has no dtype", self.key))
                })?;
                Ok(CachedView::Array {
                    shape: &self.entry.shape,
                    dtype,
                    data: bytes,
                })
            }
            SharedKind::SharedList | SharedKind::SharedTuple => {
                let items = match deserialize_from_bytes(bytes)? {
                    Value::List(items) | Value::Tuple(items) => items,
                    other => {
                        return Err(CacheError::DeserializationError(format!(
                            "expected a sequence in {}, found {}",
                            self.key,
                            other.type_name()
                        )))
                    }
                };
                Ok(match self.entry.kind {
                    SharedKind::SharedTuple => CachedView::Tuple(items),
                    _ => CachedView::List(items),
                })
            }
        }
    }

    /// Copy the payload out into an owned value
    pub fn to_value(&self) -> CacheResult<Value> {
        Ok(match self.view()? {
            CachedView::Array { shape, dtype, data } => {
                Value::Array(NdArray::new(shape.to_vec(), dtype, data.to_vec())?)
            }
            CachedView::List(items) => Value::List(items),
            CachedView::Tuple(items) => Value::Tuple(items),
        })
    }

    /// Unmap the segment
    pub fn release(self) {
        drop(self);
    }
}
