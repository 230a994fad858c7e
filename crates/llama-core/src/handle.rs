//! Opaque handles for resources owned by a [`ResourceRegistry`].
//!
//! Inside Rust the three handle types are distinct, so a context handle can
//! never be passed where a model is expected.  At a host boundary they all
//! travel as a [`RawHandle`]: a `u64` whose top 16 bits carry the resource
//! kind and whose low 48 bits carry the id.  Converting a raw handle back
//! checks the tag before anything is looked up.
//!
//! The id itself is split again: 16 bits name the registry that issued it
//! and 32 bits are a per-table serial, so a handle taken to a different
//! registry is rejected instead of resolving to an unrelated resource.
//!
//! [`ResourceRegistry`]: crate::registry::ResourceRegistry

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{LlamaError, Result};

const ID_BITS: u32 = 48;
const ID_MASK: u64 = (1 << ID_BITS) - 1;
const SERIAL_BITS: u32 = 32;
const SERIAL_MASK: u64 = (1 << SERIAL_BITS) - 1;

static NEXT_OWNER: AtomicU16 = AtomicU16::new(1);

/// Identity for a new registry.  Owner 0 is never handed out; after 65535
/// registries the counter wraps.
pub(crate) fn next_owner() -> u16 {
    loop {
        let owner = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        if owner != 0 {
            return owner;
        }
    }
}

pub(crate) fn compose_id(owner: u16, serial: u64) -> u64 {
    (u64::from(owner) << SERIAL_BITS) | (serial & SERIAL_MASK)
}

fn owner_of(id: u64) -> u16 {
    ((id & ID_MASK) >> SERIAL_BITS) as u16
}

fn serial_of(id: u64) -> u64 {
    id & SERIAL_MASK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Model,
    Context,
    Sampler,
}

impl ResourceKind {
    pub const fn tag(self) -> u16 {
        match self {
            Self::Model => 0x4D4C,   // "ML"
            Self::Context => 0x4358, // "CX"
            Self::Sampler => 0x534D, // "SM"
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        [Self::Model, Self::Context, Self::Sampler]
            .into_iter()
            .find(|k| k.tag() == tag)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Context => write!(f, "context"),
            Self::Sampler => write!(f, "sampler"),
        }
    }
}

/// Kind-tagged handle as it crosses a host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawHandle(pub u64);

impl RawHandle {
    fn new(kind: ResourceKind, id: u64) -> Self {
        Self((u64::from(kind.tag()) << ID_BITS) | (id & ID_MASK))
    }

    pub fn tag(self) -> u16 {
        (self.0 >> ID_BITS) as u16
    }

    pub fn id(self) -> u64 {
        self.0 & ID_MASK
    }

    pub fn kind(self) -> Option<ResourceKind> {
        ResourceKind::from_tag(self.tag())
    }

    fn expect_kind(self, expected: ResourceKind) -> Result<u64> {
        match self.kind() {
            Some(kind) if kind == expected => {}
            Some(kind) => {
                return Err(LlamaError::InvalidHandle(format!(
                    "expected a {expected} handle, got a {kind} handle"
                )));
            }
            None => {
                return Err(LlamaError::InvalidHandle(format!(
                    "{:#018x} is not a handle (unknown tag {:#06x})",
                    self.0,
                    self.tag()
                )));
            }
        }
        if self.id() == 0 {
            return Err(LlamaError::InvalidHandle(format!(
                "{expected} handle has a null id"
            )));
        }
        Ok(self.id())
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const KIND: ResourceKind = $kind;

            pub(crate) fn from_id(id: u64) -> Self {
                Self(id)
            }

            pub fn id(self) -> u64 {
                self.0
            }

            pub fn raw(self) -> RawHandle {
                RawHandle::new(Self::KIND, self.0)
            }
        }

        impl From<$name> for RawHandle {
            fn from(h: $name) -> Self {
                h.raw()
            }
        }

        impl TryFrom<RawHandle> for $name {
            type Error = LlamaError;

            fn try_from(raw: RawHandle) -> Result<Self> {
                raw.expect_kind(Self::KIND).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}.{}", Self::KIND, owner_of(self.0), serial_of(self.0))
            }
        }
    };
}

typed_handle!(
    /// A loaded model.
    ModelHandle,
    ResourceKind::Model
);
typed_handle!(
    /// An inference context.
    ContextHandle,
    ResourceKind::Context
);
typed_handle!(
    /// A sampler chain.
    SamplerHandle,
    ResourceKind::Sampler
);

//  HandleTable

/// Id-keyed storage for one resource kind.
///
/// Serials are issued from a monotonic counter and never reused, so a freed
/// handle can be told apart from one that was never issued and can never
/// alias a newer resource.  Every id also carries the table's `owner`.
/// Entries are `Arc`s: removing an entry while a caller still holds a
/// clone defers the native free to that caller.
pub struct HandleTable<T> {
    kind: ResourceKind,
    owner: u16,
    next: AtomicU64,
    entries: RwLock<HashMap<u64, Arc<T>>>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: ResourceKind, owner: u16) -> Self {
        Self {
            kind,
            owner,
            next: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, value: T) -> Result<u64> {
        let serial = self.next.fetch_add(1, Ordering::Relaxed);
        if serial > SERIAL_MASK {
            return Err(LlamaError::AllocationFailed(format!(
                "{} handle ids exhausted",
                self.kind
            )));
        }
        let id = compose_id(self.owner, serial);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(value));
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<Arc<T>> {
        self.check_owner(id)?;
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| self.missing(id))
    }

    /// Remove an entry.  Removing an already-freed id is `Ok(None)`.
    pub fn remove(&self, id: u64) -> Result<Option<Arc<T>>> {
        self.check_owner(id)?;
        if !self.was_issued(id) {
            return Err(self.missing(id));
        }
        Ok(self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every live entry out of the table.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, v)| v)
            .collect()
    }

    fn check_owner(&self, id: u64) -> Result<()> {
        match owner_of(id) {
            owner if owner == self.owner => Ok(()),
            owner => Err(LlamaError::InvalidHandle(format!(
                "{} #{} belongs to registry {owner}, not registry {}",
                self.kind,
                serial_of(id),
                self.owner
            ))),
        }
    }

    fn was_issued(&self, id: u64) -> bool {
        let serial = serial_of(id);
        serial != 0 && serial < self.next.load(Ordering::Relaxed)
    }

    fn missing(&self, id: u64) -> LlamaError {
        let serial = serial_of(id);
        if self.was_issued(id) {
            LlamaError::InvalidHandle(format!("{} #{serial} has already been freed", self.kind))
        } else {
            LlamaError::InvalidHandle(format!("{} #{serial} was never issued", self.kind))
        }
    }
}
