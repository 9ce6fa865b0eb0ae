// Copyright 2025 the Scoria Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! GPU resource lifetime and caching primitives for a 2D renderer.
//!
//! This crate provides the pieces a GPU backend needs to manage object
//! lifetimes across asynchronous, multi-frame command submission:
//!
//! - [`ResourceCache`]: a budget-aware cache that partitions resources into
//!   purgeable (idle, evictable in LRU order) and non-purgeable (in use)
//!   sets, with a thread-safe return path for GPU completion callbacks.
//! - [`CommandBuffer`]: pins every resource referenced by queued GPU work
//!   until the submission layer confirms completion.
//! - [`RasterPathAtlas`]: packs rasterized coverage masks into shared page
//!   textures with independent LRU eviction for cached and uncached
//!   shapes.
//!
//! Actual GPU backends plug in behind three seams: [`GpuObject`] for
//! allocations, [`BackendEncoder`] for command encoding, and
//! [`AtlasTextureProvider`] for atlas page textures. The cache itself is
//! single-owner: all mutating operations take `&mut self`, and only the
//! internal return queue is shared across threads.

mod command_buffer;
mod geom;
mod path_atlas;
mod resource;
mod resource_cache;
mod task;

pub use command_buffer::{
    BackendEncoder, BufferTextureCopyData, CommandBuffer, ComputePassDesc, FinishedProc,
    RenderPassDesc,
};
pub use geom::{IPoint, IRect};
pub use path_atlas::{
    AtlasConfig, AtlasError, AtlasSlot, AtlasTextureProvider, AtlasUpload, RasterPathAtlas,
    ShapeKey,
};
pub use resource::{Budgeted, GpuObject, Resource, ResourceId, ResourceKey, Shareable};
pub use resource_cache::{MemoryDump, ResourceCache, ScratchResourceSet};
pub use task::{CopyTextureToBufferTask, CopyTextureToTextureTask, Task};
