// Copyright 2025 the Scoria Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Budget-aware cache of reusable GPU resources.
//!
//! The cache owns every resource reachable by key and partitions them into
//! a purgeable set (idle, evictable, LRU-ordered) and a non-purgeable set
//! (referenced by consumers or in-flight command buffers). All mutating
//! operations take `&mut self`; the one cross-thread entry point is the
//! return queue, which GPU completion callbacks reach through resource
//! handle drops.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::resource::{
    Budgeted, GpuObject, LastRemovedRef, Resource, ResourceId, ResourceInner, ResourceKey,
    Shareable, INDEX_NONE,
};

/// Use token assigned to zero-size resources when they go purgeable. It
/// sorts after every real token, so budget pressure never reaches them.
pub(crate) const SENTINEL_USE_TOKEN: u32 = u32::MAX;

/// Scratch resources already claimed earlier in the current recording pass.
/// The caller threads one set through a frame's worth of
/// [`ResourceCache::find_and_ref_resource`] calls.
pub type ScratchResourceSet = HashSet<ResourceId>;

/// Read-only sink for [`ResourceCache::dump_memory_statistics`].
pub trait MemoryDump {
    fn dump_item(&mut self, label: &str, resource_type: &'static str, size: u64, purgeable: bool);
}

/// The thread-safe half of the cache: a mutex-guarded queue of resources
/// whose last consumer or command-buffer reference dropped. Only the queue
/// is touched under the lock; all structural work happens when the owning
/// thread drains it.
pub(crate) struct ReturnQueue {
    state: Mutex<ReturnQueueState>,
}

#[derive(Default)]
struct ReturnQueueState {
    is_shutdown: bool,
    returns: Vec<(Arc<ResourceInner>, LastRemovedRef)>,
}

impl ReturnQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReturnQueueState::default()),
        })
    }

    /// Returns false once the cache has shut down; the resource then frees
    /// itself with its final reference.
    pub(crate) fn return_resource(
        &self,
        resource: Arc<ResourceInner>,
        last_ref: LastRemovedRef,
    ) -> bool {
        let mut state = self.state.lock();
        if state.is_shutdown {
            return false;
        }
        state.returns.push((resource, last_ref));
        true
    }

    fn take_returns(&self) -> Vec<(Arc<ResourceInner>, LastRemovedRef)> {
        mem::take(&mut self.state.lock().returns)
    }

    fn shutdown(&self) -> Vec<(Arc<ResourceInner>, LastRemovedRef)> {
        let mut state = self.state.lock();
        state.is_shutdown = true;
        mem::take(&mut state.returns)
    }
}

/// Min-heap over the last-use token, with each resource recording its heap
/// slot so removal from the middle stays O(log n).
struct PurgeableQueue {
    heap: Vec<Arc<ResourceInner>>,
}

impl PurgeableQueue {
    fn new() -> Self {
        Self { heap: Vec::new() }
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn peek(&self) -> Option<&Arc<ResourceInner>> {
        self.heap.first()
    }

    fn push(&mut self, resource: Arc<ResourceInner>) {
        let index = self.heap.len();
        resource.set_cache_index(index as i32);
        self.heap.push(resource);
        self.sift_up(index);
    }

    fn pop(&mut self) -> Option<Arc<ResourceInner>> {
        if self.heap.is_empty() {
            return None;
        }
        let resource = self.heap.swap_remove(0);
        resource.set_cache_index(INDEX_NONE);
        if !self.heap.is_empty() {
            self.heap[0].set_cache_index(0);
            self.sift_down(0);
        }
        Some(resource)
    }

    fn remove(&mut self, resource: &Arc<ResourceInner>) {
        let index = resource.cache_index();
        debug_assert!(index >= 0);
        let index = index as usize;
        debug_assert!(Arc::ptr_eq(&self.heap[index], resource));
        let last = self.heap.len() - 1;
        self.heap.swap(index, last);
        self.heap.pop();
        resource.set_cache_index(INDEX_NONE);
        if index < self.heap.len() {
            self.heap[index].set_cache_index(index as i32);
            self.sift_down(index);
            self.sift_up(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[parent].last_use_token() <= self.heap[index].last_use_token() {
                break;
            }
            self.swap_slots(parent, index);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let child = if right < self.heap.len()
                && self.heap[right].last_use_token() < self.heap[left].last_use_token()
            {
                right
            } else {
                left
            };
            if self.heap[index].last_use_token() <= self.heap[child].last_use_token() {
                break;
            }
            self.swap_slots(index, child);
            index = child;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.heap[a].set_cache_index(a as i32);
        self.heap[b].set_cache_index(b as i32);
    }
}

/// Central authority for resource reuse, eviction, and budget enforcement.
///
/// The budget is soft: `purge_as_needed` runs after every operation that
/// can grow it, but when everything purgeable is exhausted the cache stays
/// transiently overbudget rather than failing.
pub struct ResourceCache {
    resource_map: HashMap<ResourceKey, Vec<Arc<ResourceInner>>>,
    purgeable_queue: PurgeableQueue,
    nonpurgeable: Vec<Arc<ResourceInner>>,
    return_queue: Arc<ReturnQueue>,
    max_bytes: u64,
    budgeted_bytes: u64,
    purgeable_bytes: u64,
    use_token: u32,
    epoch: Instant,
    is_shutdown: bool,
}

impl ResourceCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            resource_map: HashMap::new(),
            purgeable_queue: PurgeableQueue::new(),
            nonpurgeable: Vec::new(),
            return_queue: ReturnQueue::new(),
            max_bytes,
            budgeted_bytes: 0,
            purgeable_bytes: 0,
            use_token: 0,
            epoch: Instant::now(),
            is_shutdown: false,
        }
    }

    /// Register a newly created backend object. Must be called exactly once
    /// per object, at creation time; the returned handle is the caller's
    /// usage reference. Shareable resources must carry a key, or nothing
    /// could ever find them again.
    pub fn insert_resource(
        &mut self,
        gpu: Box<dyn GpuObject>,
        key: Option<ResourceKey>,
        budgeted: Budgeted,
        shareable: Shareable,
    ) -> Resource {
        debug_assert!(!self.is_shutdown);
        debug_assert!(
            key.is_some() || shareable == Shareable::No,
            "shareable resources must carry a key"
        );
        self.process_returned_resources();
        let inner = ResourceInner::new(
            gpu,
            key,
            budgeted,
            shareable,
            Arc::downgrade(&self.return_queue),
        );
        self.stamp_use(&inner);
        if let Some(key) = inner.key().cloned() {
            self.resource_map.entry(key).or_default().push(inner.clone());
        }
        if budgeted == Budgeted::Yes {
            self.budgeted_bytes += inner.size();
        }
        self.add_to_nonpurgeable(inner.clone());
        self.purge_as_needed();
        self.validate();
        Resource::from_first_ref(inner)
    }

    /// Find a resource matching `key`, take a usage reference on it, and
    /// promote it to most-recently-used.
    ///
    /// Availability depends on the shareable mode the resource was
    /// registered with, which must match the request: `No` requires a fully
    /// idle resource, `Scratch` requires absence from the caller's
    /// `unavailable` set, `Yes` always matches. Among several candidates
    /// the first available one in key-bucket order wins; buckets keep
    /// insertion order, so this is the oldest surviving resource for the
    /// key.
    ///
    /// Requesting `Budgeted::Yes` for a resource registered non-budgeted
    /// moves its bytes into the budget; the reverse request changes
    /// nothing.
    pub fn find_and_ref_resource(
        &mut self,
        key: &ResourceKey,
        budgeted: Budgeted,
        shareable: Shareable,
        unavailable: Option<&ScratchResourceSet>,
    ) -> Option<Resource> {
        debug_assert!(!self.is_shutdown);
        debug_assert!(
            shareable != Shareable::Scratch || unavailable.is_some(),
            "scratch requests must supply the frame's unavailable set"
        );
        self.process_returned_resources();
        let found = self.resource_map.get(key).and_then(|bucket| {
            bucket
                .iter()
                .find(|inner| {
                    if inner.shareable() != shareable {
                        return false;
                    }
                    match shareable {
                        Shareable::No => !inner.has_any_refs(),
                        Shareable::Scratch => {
                            unavailable.map_or(true, |set| !set.contains(&inner.id()))
                        }
                        Shareable::Yes => true,
                    }
                })
                .cloned()
        })?;
        let handle = self.ref_and_make_mru(&found, budgeted);
        self.validate();
        Some(handle)
    }

    /// Drain the return queue and fold each entry into the cache: idle
    /// keyed resources become purgeable, idle keyless resources leave the
    /// cache, anything still referenced stays where it is. Returns whether
    /// any entry was drained.
    pub(crate) fn process_returned_resources(&mut self) -> bool {
        let returns = self.return_queue.take_returns();
        if returns.is_empty() {
            return false;
        }
        for (resource, _last_ref) in returns {
            self.process_returned_resource(resource);
        }
        self.purge_as_needed();
        self.validate();
        true
    }

    fn process_returned_resource(&mut self, resource: Arc<ResourceInner>) {
        // The resource may have been re-referenced, or already handled via
        // an earlier queue entry, between enqueue and drain.
        if resource.has_any_refs()
            || resource.in_purgeable_queue()
            || resource.cache_index() == INDEX_NONE
        {
            return;
        }
        if resource.key().is_none() {
            // Nothing can find it again; release the cache's reference.
            self.remove_from_nonpurgeable(&resource);
            if resource.is_budgeted() {
                self.budgeted_bytes -= resource.size();
            }
            return;
        }
        self.remove_from_nonpurgeable(&resource);
        let token = if resource.size() == 0 {
            SENTINEL_USE_TOKEN
        } else {
            self.next_use_token()
        };
        resource.set_last_use_token(token);
        resource.set_last_access_micros(self.now_micros());
        self.purgeable_bytes += resource.size();
        self.purgeable_queue.push(resource);
    }

    /// Evict every purgeable resource with a nonzero footprint.
    pub fn purge_resources(&mut self) {
        self.process_returned_resources();
        self.purge_resources_walk(None);
        self.validate();
    }

    /// Evict purgeable resources whose last use precedes `purge_time`.
    /// Zero-size resources are never evicted.
    pub fn purge_resources_not_used_since(&mut self, purge_time: Instant) {
        self.process_returned_resources();
        self.purge_resources_walk(Some(purge_time));
        self.validate();
    }

    fn purge_resources_walk(&mut self, purge_time: Option<Instant>) {
        let cutoff_micros =
            purge_time.map(|t| t.saturating_duration_since(self.epoch).as_micros() as u64);
        while let Some(head) = self.purgeable_queue.peek() {
            // The sentinel region sorts last; reaching it ends every walk.
            if head.last_use_token() == SENTINEL_USE_TOKEN {
                break;
            }
            if let Some(cutoff) = cutoff_micros {
                if head.last_access_micros() >= cutoff {
                    break;
                }
            }
            let resource = self.purgeable_queue.pop().unwrap();
            self.purge_resource(resource);
        }
    }

    fn purge_as_needed(&mut self) {
        while self.overbudget() {
            let Some(head) = self.purgeable_queue.peek() else {
                // Everything left is pinned; stay overbudget until returns
                // come in.
                break;
            };
            if head.last_use_token() == SENTINEL_USE_TOKEN {
                break;
            }
            let resource = self.purgeable_queue.pop().unwrap();
            self.purge_resource(resource);
        }
    }

    fn purge_resource(&mut self, resource: Arc<ResourceInner>) {
        debug_assert!(!resource.has_any_refs());
        self.remove_from_resource_map(&resource);
        self.purgeable_bytes -= resource.size();
        if resource.is_budgeted() {
            self.budgeted_bytes -= resource.size();
        }
    }

    pub fn get_max_budget(&self) -> u64 {
        self.max_bytes
    }

    /// Update the budget ceiling and immediately purge down to it.
    pub fn set_max_budget(&mut self, bytes: u64) {
        self.max_bytes = bytes;
        self.process_returned_resources();
        self.purge_as_needed();
        self.validate();
    }

    pub fn current_budgeted_bytes(&self) -> u64 {
        self.budgeted_bytes
    }

    pub fn current_purgeable_bytes(&self) -> u64 {
        self.purgeable_bytes
    }

    pub fn get_resource_count(&self) -> usize {
        self.purgeable_queue.len() + self.nonpurgeable.len()
    }

    /// Report every resource's size and purgeable classification to a
    /// diagnostics sink.
    pub fn dump_memory_statistics(&self, dump: &mut dyn MemoryDump) {
        for resource in &self.nonpurgeable {
            let gpu = resource.gpu();
            dump.dump_item(gpu.label(), gpu.resource_type(), resource.size(), false);
        }
        for resource in &self.purgeable_queue.heap {
            let gpu = resource.gpu();
            dump.dump_item(gpu.label(), gpu.resource_type(), resource.size(), true);
        }
    }

    /// Mark the cache terminal. Resources already queued for return are
    /// released along with everything the cache holds; later returns are
    /// rejected and those resources free themselves with their final
    /// handle. Also runs on drop.
    pub fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        self.is_shutdown = true;
        let pending = self.return_queue.shutdown();
        log::debug!(
            "resource cache shutdown: {} resources, {} queued returns",
            self.get_resource_count(),
            pending.len()
        );
        drop(pending);
        for resource in self.nonpurgeable.drain(..) {
            resource.set_cache_index(INDEX_NONE);
        }
        while self.purgeable_queue.pop().is_some() {}
        self.resource_map.clear();
        self.budgeted_bytes = 0;
        self.purgeable_bytes = 0;
    }

    fn overbudget(&self) -> bool {
        self.budgeted_bytes > self.max_bytes
    }

    fn ref_and_make_mru(&mut self, inner: &Arc<ResourceInner>, budgeted: Budgeted) -> Resource {
        if inner.in_purgeable_queue() {
            self.purgeable_queue.remove(inner);
            self.purgeable_bytes -= inner.size();
            self.add_to_nonpurgeable(inner.clone());
        }
        self.stamp_use(inner);
        let mut upgraded = false;
        if budgeted == Budgeted::Yes && !inner.is_budgeted() {
            inner.set_budgeted(true);
            self.budgeted_bytes += inner.size();
            upgraded = true;
        }
        let handle = Resource::from_new_ref(inner);
        if upgraded {
            self.purge_as_needed();
        }
        handle
    }

    fn stamp_use(&mut self, inner: &Arc<ResourceInner>) {
        let token = self.next_use_token();
        inner.set_last_use_token(token);
        inner.set_last_access_micros(self.now_micros());
    }

    fn next_use_token(&mut self) -> u32 {
        let token = self.use_token;
        self.use_token += 1;
        debug_assert_ne!(token, SENTINEL_USE_TOKEN);
        token
    }

    fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn add_to_nonpurgeable(&mut self, resource: Arc<ResourceInner>) {
        resource.set_cache_index(-(self.nonpurgeable.len() as i32) - 1);
        self.nonpurgeable.push(resource);
    }

    fn remove_from_nonpurgeable(&mut self, resource: &Arc<ResourceInner>) {
        let encoded = resource.cache_index();
        debug_assert!(encoded < 0 && encoded != INDEX_NONE);
        let index = (-encoded - 1) as usize;
        debug_assert!(Arc::ptr_eq(&self.nonpurgeable[index], resource));
        self.nonpurgeable.swap_remove(index);
        if index < self.nonpurgeable.len() {
            self.nonpurgeable[index].set_cache_index(-(index as i32) - 1);
        }
        resource.set_cache_index(INDEX_NONE);
    }

    fn remove_from_resource_map(&mut self, resource: &Arc<ResourceInner>) {
        let Some(key) = resource.key() else {
            return;
        };
        let Some(bucket) = self.resource_map.get_mut(key) else {
            return;
        };
        if let Some(pos) = bucket.iter().position(|r| Arc::ptr_eq(r, resource)) {
            // Ordered removal keeps the bucket in insertion order, which
            // the find tie-break relies on.
            bucket.remove(pos);
        }
        if bucket.is_empty() {
            self.resource_map.remove(key);
        }
    }

    #[cfg(debug_assertions)]
    fn validate(&self) {
        let mut budgeted = 0u64;
        let mut purgeable = 0u64;
        for (i, resource) in self.nonpurgeable.iter().enumerate() {
            assert_eq!(resource.cache_index(), -(i as i32) - 1);
            if resource.is_budgeted() {
                budgeted += resource.size();
            }
        }
        for (i, resource) in self.purgeable_queue.heap.iter().enumerate() {
            assert_eq!(resource.cache_index(), i as i32);
            assert!(!resource.has_any_refs());
            if resource.is_budgeted() {
                budgeted += resource.size();
            }
            purgeable += resource.size();
        }
        assert_eq!(budgeted, self.budgeted_bytes);
        assert_eq!(purgeable, self.purgeable_bytes);
        for bucket in self.resource_map.values() {
            for resource in bucket {
                assert_ne!(resource.cache_index(), INDEX_NONE);
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn validate(&self) {}

    #[cfg(test)]
    pub(crate) fn return_queue(&self) -> &Arc<ReturnQueue> {
        &self.return_queue
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
