// Copyright 2025 the Scoria Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reference-counted wrappers around backend GPU objects.
//!
//! A [`Resource`] is a cloneable handle over a backend allocation (texture,
//! buffer, pipeline, ...). The cache and command buffers keep their own
//! counts distinct from consumer handles, so "the recording thread is done
//! with this" and "the GPU is done with this" can be observed separately.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use crate::resource_cache::ReturnQueue;

/// Backend capability seam: the one thing a GPU object must expose for the
/// cache to manage it. Freeing the underlying allocation is the
/// implementor's `Drop`.
pub trait GpuObject: Send + Sync + 'static {
    /// GPU memory footprint in bytes. Zero is legal for objects with no
    /// meaningful allocation (descriptor sets, pipelines); the cache never
    /// proactively purges those.
    fn size_in_bytes(&self) -> u64;

    /// Category label used by memory diagnostics ("texture", "buffer", ...).
    fn resource_type(&self) -> &'static str;

    /// Optional debug label.
    fn label(&self) -> &str {
        ""
    }
}

/// Whether a resource's bytes count against the cache budget.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Budgeted {
    No,
    Yes,
}

/// Whether multiple simultaneous holders of the same keyed resource are
/// legal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Shareable {
    /// Unique use: only fully idle resources can be handed out.
    No,
    /// Anonymous intra-frame reuse; the caller filters already-claimed
    /// candidates with a scratch set.
    Scratch,
    /// Persistent cross-frame sharing; any number of holders.
    Yes,
}

/// Which kind of reference dropped to zero and triggered a return.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum LastRemovedRef {
    Usage,
    CommandBuffer,
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique per-object identity, distinct from the fungible [`ResourceKey`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceId(NonZeroU64);

impl ResourceId {
    pub(crate) fn next() -> Self {
        let val = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(val + 1).unwrap())
    }
}

/// An immutable key identifying fungible resources ("a 256x256 RGBA8
/// texture"). Equality compares the encoded words; hashing uses a
/// precomputed 32-bit hash.
#[derive(Clone, Debug)]
pub struct ResourceKey {
    words: SmallVec<[u32; 6]>,
    hash: u32,
}

impl ResourceKey {
    pub fn new(words: &[u32]) -> Self {
        // FNV-1a over the word bytes.
        let mut hash: u32 = 0x811c_9dc5;
        for word in words {
            for byte in word.to_le_bytes() {
                hash ^= u32::from(byte);
                hash = hash.wrapping_mul(0x0100_0193);
            }
        }
        Self {
            words: SmallVec::from_slice(words),
            hash,
        }
    }

    pub fn hash32(&self) -> u32 {
        self.hash
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.words == other.words
    }
}

impl Eq for ResourceKey {}

impl std::hash::Hash for ResourceKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

/// `cache_index` encoding: `>= 0` is a slot in the purgeable priority
/// queue, negative values encode a slot `i` in the non-purgeable array as
/// `-(i + 1)`, and `INDEX_NONE` means the cache holds no reference.
pub(crate) const INDEX_NONE: i32 = i32::MIN;

pub(crate) struct ResourceInner {
    gpu: Box<dyn GpuObject>,
    id: ResourceId,
    key: Option<ResourceKey>,
    size: u64,
    shareable: Shareable,
    budgeted: AtomicBool,
    usage_refs: AtomicU32,
    command_buffer_refs: AtomicU32,
    // Cache bookkeeping. Mutated only by the owning cache thread; atomics
    // because handles (and thus the shared record) cross threads.
    last_use_token: AtomicU32,
    last_access_micros: AtomicU64,
    cache_index: AtomicI32,
    return_queue: Weak<ReturnQueue>,
}

impl ResourceInner {
    pub(crate) fn new(
        gpu: Box<dyn GpuObject>,
        key: Option<ResourceKey>,
        budgeted: Budgeted,
        shareable: Shareable,
        return_queue: Weak<ReturnQueue>,
    ) -> Arc<Self> {
        let size = gpu.size_in_bytes();
        Arc::new(Self {
            gpu,
            id: ResourceId::next(),
            key,
            size,
            shareable,
            budgeted: AtomicBool::new(budgeted == Budgeted::Yes),
            usage_refs: AtomicU32::new(1),
            command_buffer_refs: AtomicU32::new(0),
            last_use_token: AtomicU32::new(0),
            last_access_micros: AtomicU64::new(0),
            cache_index: AtomicI32::new(INDEX_NONE),
            return_queue,
        })
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn key(&self) -> Option<&ResourceKey> {
        self.key.as_ref()
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn shareable(&self) -> Shareable {
        self.shareable
    }

    pub(crate) fn gpu(&self) -> &dyn GpuObject {
        &*self.gpu
    }

    pub(crate) fn is_budgeted(&self) -> bool {
        self.budgeted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_budgeted(&self, budgeted: bool) {
        self.budgeted.store(budgeted, Ordering::Relaxed);
    }

    pub(crate) fn has_any_refs(&self) -> bool {
        self.usage_refs.load(Ordering::Acquire) > 0
            || self.command_buffer_refs.load(Ordering::Acquire) > 0
    }

    pub(crate) fn last_use_token(&self) -> u32 {
        self.last_use_token.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_use_token(&self, token: u32) {
        self.last_use_token.store(token, Ordering::Relaxed);
    }

    pub(crate) fn last_access_micros(&self) -> u64 {
        self.last_access_micros.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_access_micros(&self, micros: u64) {
        self.last_access_micros.store(micros, Ordering::Relaxed);
    }

    pub(crate) fn cache_index(&self) -> i32 {
        self.cache_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cache_index(&self, index: i32) {
        self.cache_index.store(index, Ordering::Relaxed);
    }

    pub(crate) fn in_purgeable_queue(&self) -> bool {
        self.cache_index() >= 0
    }
}

fn route_return(inner: &Arc<ResourceInner>, last_ref: LastRemovedRef) {
    if let Some(queue) = inner.return_queue.upgrade() {
        // A false return means the cache has shut down and will not take the
        // resource back; the backend object is freed when the final shared
        // reference drops.
        let _ = queue.return_resource(inner.clone(), last_ref);
    }
}

/// A usage reference to a GPU resource. Cloning takes another usage
/// reference; dropping the last one routes the resource back to its cache
/// (if any) so it can be recycled rather than freed.
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    /// Wrap a backend object that never participates in a cache. Useful for
    /// externally owned allocations that still need to flow through command
    /// buffer tracking.
    pub fn wrap(gpu: Box<dyn GpuObject>) -> Self {
        Self {
            inner: ResourceInner::new(gpu, None, Budgeted::No, Shareable::No, Weak::new()),
        }
    }

    /// The first handle for a freshly registered resource; the usage count
    /// was initialized to one by `ResourceInner::new`.
    pub(crate) fn from_first_ref(inner: Arc<ResourceInner>) -> Self {
        debug_assert_eq!(inner.usage_refs.load(Ordering::Relaxed), 1);
        Self { inner }
    }

    /// Take a new usage reference on a cached resource.
    pub(crate) fn from_new_ref(inner: &Arc<ResourceInner>) -> Self {
        inner.usage_refs.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: inner.clone(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id()
    }

    pub fn key(&self) -> Option<&ResourceKey> {
        self.inner.key()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.inner.size()
    }

    pub fn shareable(&self) -> Shareable {
        self.inner.shareable()
    }

    pub fn gpu(&self) -> &dyn GpuObject {
        self.inner.gpu()
    }

    pub(crate) fn inner(&self) -> &Arc<ResourceInner> {
        &self.inner
    }

    /// Take a command-buffer reference, held until the command buffer's
    /// tracked list is released after GPU completion.
    pub(crate) fn track_for_command_buffer(&self) -> TrackedResource {
        self.inner
            .command_buffer_refs
            .fetch_add(1, Ordering::Relaxed);
        TrackedResource {
            inner: self.inner.clone(),
        }
    }
}

impl Clone for Resource {
    fn clone(&self) -> Self {
        Self::from_new_ref(&self.inner)
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if self.inner.usage_refs.fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            route_return(&self.inner, LastRemovedRef::Usage);
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.inner.id())
            .field("type", &self.inner.gpu().resource_type())
            .field("size", &self.inner.size())
            .finish_non_exhaustive()
    }
}

/// A command-buffer reference; see [`Resource::track_for_command_buffer`].
pub(crate) struct TrackedResource {
    inner: Arc<ResourceInner>,
}

impl Drop for TrackedResource {
    fn drop(&mut self) {
        if self
            .inner
            .command_buffer_refs
            .fetch_sub(1, Ordering::Release)
            == 1
        {
            std::sync::atomic::fence(Ordering::Acquire);
            route_return(&self.inner, LastRemovedRef::CommandBuffer);
        }
    }
}
