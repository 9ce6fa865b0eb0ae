// Copyright 2025 the Scoria Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recorded work that retains resources between recording and encoding.
//!
//! A task is created while a frame is being recorded and holds usage
//! references on everything it will touch. When the frame is snapped into a
//! command buffer, the task hands those references over; from then on the
//! command buffer's tracking covers the GPU execution window.

use log::error;

use crate::command_buffer::{BackendEncoder, CommandBuffer};
use crate::geom::{IPoint, IRect};
use crate::resource::Resource;

pub trait Task<E: BackendEncoder> {
    /// Validate inputs before any encoding happens. A false return aborts
    /// the task without side effects.
    fn prepare_resources(&mut self) -> bool {
        true
    }

    /// Encode the task's commands, transferring its resource references to
    /// the command buffer. A false return means nothing was queued and
    /// nothing was tracked.
    fn add_commands(&mut self, command_buffer: &mut CommandBuffer<E>) -> bool;
}

/// Read back a texture region into a buffer.
pub struct CopyTextureToBufferTask {
    texture: Option<Resource>,
    src_rect: IRect,
    buffer: Option<Resource>,
    buffer_offset: u64,
    buffer_row_bytes: u64,
}

impl CopyTextureToBufferTask {
    pub fn new(
        texture: Resource,
        src_rect: IRect,
        buffer: Resource,
        buffer_offset: u64,
        buffer_row_bytes: u64,
    ) -> Self {
        Self {
            texture: Some(texture),
            src_rect,
            buffer: Some(buffer),
            buffer_offset,
            buffer_row_bytes,
        }
    }
}

impl<E: BackendEncoder> Task<E> for CopyTextureToBufferTask {
    fn prepare_resources(&mut self) -> bool {
        if self.src_rect.is_empty() {
            error!("empty source rect for texture-to-buffer copy");
            return false;
        }
        true
    }

    fn add_commands(&mut self, command_buffer: &mut CommandBuffer<E>) -> bool {
        let (Some(texture), Some(buffer)) = (self.texture.take(), self.buffer.take()) else {
            error!("texture-to-buffer copy task encoded more than once");
            return false;
        };
        command_buffer.copy_texture_to_buffer(
            texture,
            self.src_rect,
            buffer,
            self.buffer_offset,
            self.buffer_row_bytes,
        )
    }
}

/// Blit a texture region into another texture.
pub struct CopyTextureToTextureTask {
    src: Option<Resource>,
    src_rect: IRect,
    dst: Option<Resource>,
    dst_point: IPoint,
}

impl CopyTextureToTextureTask {
    pub fn new(src: Resource, src_rect: IRect, dst: Resource, dst_point: IPoint) -> Self {
        Self {
            src: Some(src),
            src_rect,
            dst: Some(dst),
            dst_point,
        }
    }
}

impl<E: BackendEncoder> Task<E> for CopyTextureToTextureTask {
    fn prepare_resources(&mut self) -> bool {
        if self.src_rect.is_empty() {
            error!("empty source rect for texture-to-texture copy");
            return false;
        }
        true
    }

    fn add_commands(&mut self, command_buffer: &mut CommandBuffer<E>) -> bool {
        let (Some(src), Some(dst)) = (self.src.take(), self.dst.take()) else {
            error!("texture-to-texture copy task encoded more than once");
            return false;
        };
        command_buffer.copy_texture_to_texture(src, self.src_rect, dst, self.dst_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_buffer::{BufferTextureCopyData, ComputePassDesc, RenderPassDesc};
    use crate::resource::{Budgeted, GpuObject, ResourceKey, Shareable};
    use crate::resource_cache::ResourceCache;

    struct TestObject(u64);

    impl GpuObject for TestObject {
        fn size_in_bytes(&self) -> u64 {
            self.0
        }

        fn resource_type(&self) -> &'static str {
            "test"
        }
    }

    #[derive(Default)]
    struct MockEncoder {
        fail: bool,
    }

    impl BackendEncoder for MockEncoder {
        type DrawPass = ();

        fn on_add_render_pass(
            &mut self,
            _: &RenderPassDesc,
            _: &Resource,
            _: Option<&Resource>,
            _: Option<&Resource>,
            _: &[()],
        ) -> bool {
            !self.fail
        }

        fn on_add_compute_pass(
            &mut self,
            _: &ComputePassDesc,
            _: &Resource,
            _: &[Resource],
        ) -> bool {
            !self.fail
        }

        fn on_copy_texture_to_buffer(
            &mut self,
            _: &Resource,
            _: IRect,
            _: &Resource,
            _: u64,
            _: u64,
        ) -> bool {
            !self.fail
        }

        fn on_copy_buffer_to_texture(
            &mut self,
            _: &Resource,
            _: &Resource,
            _: &[BufferTextureCopyData],
        ) -> bool {
            !self.fail
        }

        fn on_copy_texture_to_texture(
            &mut self,
            _: &Resource,
            _: IRect,
            _: &Resource,
            _: IPoint,
        ) -> bool {
            !self.fail
        }

        fn on_synchronize_buffer_to_cpu(&mut self, _: &Resource) -> Option<bool> {
            if self.fail {
                None
            } else {
                Some(true)
            }
        }
    }

    fn cached(cache: &mut ResourceCache, size: u64, key_word: u32) -> Resource {
        cache.insert_resource(
            Box::new(TestObject(size)),
            Some(ResourceKey::new(&[key_word])),
            Budgeted::Yes,
            Shareable::No,
        )
    }

    #[test]
    fn copy_task_hands_refs_to_the_command_buffer() {
        let mut cache = ResourceCache::new(u64::MAX);
        let texture = cached(&mut cache, 100, 1);
        let buffer = cached(&mut cache, 40, 2);
        let mut task =
            CopyTextureToBufferTask::new(texture, IRect::from_xywh(0, 0, 4, 4), buffer, 0, 16);
        let mut cb = CommandBuffer::new(MockEncoder::default());

        assert!(Task::<MockEncoder>::prepare_resources(&mut task));
        assert!(task.add_commands(&mut cb));
        cache.process_returned_resources();
        // The task's references now live in the command buffer.
        assert_eq!(cache.current_purgeable_bytes(), 0);

        cb.release_resources();
        cache.process_returned_resources();
        assert_eq!(cache.current_purgeable_bytes(), 140);
    }

    #[test]
    fn copy_task_rejects_empty_rect_before_encoding() {
        let mut cache = ResourceCache::new(u64::MAX);
        let src = cached(&mut cache, 100, 1);
        let dst = cached(&mut cache, 100, 2);
        let mut task = CopyTextureToTextureTask::new(src, IRect::EMPTY, dst, IPoint::new(0, 0));
        assert!(!Task::<MockEncoder>::prepare_resources(&mut task));
    }

    #[test]
    fn failed_encode_leaves_no_tracked_refs() {
        let mut cache = ResourceCache::new(u64::MAX);
        let src = cached(&mut cache, 100, 1);
        let dst = cached(&mut cache, 100, 2);
        let mut task = CopyTextureToTextureTask::new(
            src,
            IRect::from_xywh(0, 0, 4, 4),
            dst,
            IPoint::new(8, 8),
        );
        let mut cb = CommandBuffer::new(MockEncoder { fail: true });

        assert!(!task.add_commands(&mut cb));
        drop(cb);
        cache.process_returned_resources();
        // Nothing pinned anywhere once the failed submission is dropped.
        assert_eq!(cache.current_purgeable_bytes(), 200);
    }
}
