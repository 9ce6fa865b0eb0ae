// Copyright 2025 the Scoria Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Command buffer resource tracking.
//!
//! A recording thread can be logically done with a resource long before the
//! GPU executes the commands referencing it. The command buffer pins every
//! resource its queued work touches and releases them all at once when the
//! surrounding submission layer confirms GPU completion.

use crate::geom::{IPoint, IRect};
use crate::resource::{Resource, TrackedResource};

/// Minimal render pass description; attachment formats and load/store
/// behavior belong to the backend.
#[derive(Clone, Copy, Debug)]
pub struct RenderPassDesc {
    pub width: u32,
    pub height: u32,
    pub clear_color: Option<[f32; 4]>,
}

#[derive(Clone, Copy, Debug)]
pub struct ComputePassDesc {
    pub label: &'static str,
}

/// One region of a buffer-to-texture copy.
#[derive(Clone, Copy, Debug)]
pub struct BufferTextureCopyData {
    pub buffer_offset: u64,
    pub buffer_row_bytes: u64,
    pub rect: IRect,
}

/// Backend seam: each GPU backend encodes the actual commands. Every hook
/// returns whether encoding succeeded; on failure the command buffer
/// guarantees no resource was tracked for the failed operation.
pub trait BackendEncoder {
    /// Opaque recorded draw work, owned by the draw-pass layer.
    type DrawPass;

    fn on_add_render_pass(
        &mut self,
        desc: &RenderPassDesc,
        color_texture: &Resource,
        resolve_texture: Option<&Resource>,
        depth_stencil_texture: Option<&Resource>,
        draw_passes: &[Self::DrawPass],
    ) -> bool;

    fn on_add_compute_pass(
        &mut self,
        desc: &ComputePassDesc,
        pipeline: &Resource,
        bindings: &[Resource],
    ) -> bool;

    fn on_copy_texture_to_buffer(
        &mut self,
        texture: &Resource,
        src_rect: IRect,
        buffer: &Resource,
        buffer_offset: u64,
        buffer_row_bytes: u64,
    ) -> bool;

    fn on_copy_buffer_to_texture(
        &mut self,
        buffer: &Resource,
        texture: &Resource,
        copies: &[BufferTextureCopyData],
    ) -> bool;

    fn on_copy_texture_to_texture(
        &mut self,
        src: &Resource,
        src_rect: IRect,
        dst: &Resource,
        dst_point: IPoint,
    ) -> bool;

    /// `None` means the encode step failed; `Some(did_work)` reports
    /// whether the synchronization produced GPU work.
    fn on_synchronize_buffer_to_cpu(&mut self, buffer: &Resource) -> Option<bool>;

    /// Prepare the encoder for reuse after [`CommandBuffer::reset`].
    fn on_reset(&mut self) {}
}

/// Client-visible completion callback. Fires exactly once, when dropped,
/// with success unless a failure was recorded first; submission failures
/// are reported rather than silently swallowed.
pub struct FinishedProc {
    callback: Option<Box<dyn FnOnce(bool) + Send>>,
    failed: bool,
}

impl FinishedProc {
    pub fn new(callback: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            failed: false,
        }
    }

    fn set_failure(&mut self) {
        self.failed = true;
    }
}

impl Drop for FinishedProc {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(!self.failed);
        }
    }
}

/// A recorded batch of GPU work plus the resources pinned for its
/// execution window.
pub struct CommandBuffer<E: BackendEncoder> {
    encoder: E,
    tracked_resources: Vec<TrackedResource>,
    finished_procs: Vec<FinishedProc>,
    has_work: bool,
}

impl<E: BackendEncoder> CommandBuffer<E> {
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            tracked_resources: Vec::new(),
            finished_procs: Vec::new(),
            has_work: false,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Whether any encode succeeded since creation or the last reset.
    pub fn has_work(&self) -> bool {
        self.has_work
    }

    /// Pin `resource` until [`Self::release_resources`]. The command buffer
    /// holds its own reference kind, so the submitter dropping its handle
    /// does not make the resource recyclable early.
    pub fn track_resource(&mut self, resource: Resource) {
        self.tracked_resources.push(resource.track_for_command_buffer());
    }

    /// Drop every tracked reference at once. The submission layer calls
    /// this only after confirming GPU completion; it is the single point
    /// where "GPU is done" becomes "safe to recycle". Also runs on drop.
    pub fn release_resources(&mut self) {
        self.tracked_resources.clear();
    }

    /// Release resources and prepare the buffer for re-recording.
    pub fn reset(&mut self) {
        self.release_resources();
        self.encoder.on_reset();
        self.has_work = false;
    }

    pub fn add_finished_proc(&mut self, finished_proc: FinishedProc) {
        self.finished_procs.push(finished_proc);
    }

    /// Notify and clear all registered completion callbacks.
    pub fn call_finished_procs(&mut self, success: bool) {
        if !success {
            for finished_proc in &mut self.finished_procs {
                finished_proc.set_failure();
            }
        }
        self.finished_procs.clear();
    }

    pub fn add_render_pass(
        &mut self,
        desc: &RenderPassDesc,
        color_texture: Resource,
        resolve_texture: Option<Resource>,
        depth_stencil_texture: Option<Resource>,
        draw_passes: &[E::DrawPass],
    ) -> bool {
        if !self.encoder.on_add_render_pass(
            desc,
            &color_texture,
            resolve_texture.as_ref(),
            depth_stencil_texture.as_ref(),
            draw_passes,
        ) {
            return false;
        }
        self.track_resource(color_texture);
        if let Some(texture) = resolve_texture {
            self.track_resource(texture);
        }
        if let Some(texture) = depth_stencil_texture {
            self.track_resource(texture);
        }
        self.has_work = true;
        true
    }

    pub fn add_compute_pass(
        &mut self,
        desc: &ComputePassDesc,
        pipeline: Resource,
        bindings: Vec<Resource>,
    ) -> bool {
        if !self.encoder.on_add_compute_pass(desc, &pipeline, &bindings) {
            return false;
        }
        self.track_resource(pipeline);
        for binding in bindings {
            self.track_resource(binding);
        }
        self.has_work = true;
        true
    }

    pub fn copy_texture_to_buffer(
        &mut self,
        texture: Resource,
        src_rect: IRect,
        buffer: Resource,
        buffer_offset: u64,
        buffer_row_bytes: u64,
    ) -> bool {
        if !self.encoder.on_copy_texture_to_buffer(
            &texture,
            src_rect,
            &buffer,
            buffer_offset,
            buffer_row_bytes,
        ) {
            return false;
        }
        self.track_resource(texture);
        self.track_resource(buffer);
        self.has_work = true;
        true
    }

    /// The transfer buffer stays owned by the caller's upload machinery and
    /// is not tracked; only the destination texture is pinned.
    pub fn copy_buffer_to_texture(
        &mut self,
        buffer: &Resource,
        texture: Resource,
        copies: &[BufferTextureCopyData],
    ) -> bool {
        debug_assert!(!copies.is_empty());
        if !self
            .encoder
            .on_copy_buffer_to_texture(buffer, &texture, copies)
        {
            return false;
        }
        self.track_resource(texture);
        self.has_work = true;
        true
    }

    pub fn copy_texture_to_texture(
        &mut self,
        src: Resource,
        src_rect: IRect,
        dst: Resource,
        dst_point: IPoint,
    ) -> bool {
        if !self
            .encoder
            .on_copy_texture_to_texture(&src, src_rect, &dst, dst_point)
        {
            return false;
        }
        self.track_resource(src);
        self.track_resource(dst);
        self.has_work = true;
        true
    }

    pub fn synchronize_buffer_to_cpu(&mut self, buffer: Resource) -> bool {
        match self.encoder.on_synchronize_buffer_to_cpu(&buffer) {
            None => false,
            Some(true) => {
                self.track_resource(buffer);
                self.has_work = true;
                true
            }
            // No GPU work queued, so nothing to pin.
            Some(false) => true,
        }
    }
}
