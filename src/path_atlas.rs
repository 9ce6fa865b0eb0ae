// Copyright 2025 the Scoria Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared-texture atlas for rasterized coverage masks.
//!
//! Complex vector masks are rasterized once and packed into shared A8 page
//! textures so later frames can reuse them. Pages live on two LRU lists:
//! keyed shapes (cacheable across frames) go to cached pages, anonymous
//! shapes to uncached pages, and pressure on one list never evicts pages
//! from the other.

use std::collections::HashMap;

use guillotiere::{size2, AtlasAllocator};
use thiserror::Error;

use crate::geom::IRect;
use crate::resource::Resource;

/// Backend factory seam: pages request their texture lazily, on the first
/// shape placed into them.
pub trait AtlasTextureProvider {
    /// Create an A8 texture for a page. `None` signals a backend
    /// allocation failure.
    fn create_atlas_texture(&mut self, width: u32, height: u32) -> Option<Resource>;
}

/// Identity of a rasterized shape (shape geometry, transform, and stroke
/// folded into one hash by the caller).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ShapeKey(pub u64);

#[derive(Clone, Copy, Debug)]
pub struct AtlasConfig {
    /// Width and height of each square page texture.
    pub page_size: u32,
    pub max_cached_pages: usize,
    pub max_uncached_pages: usize,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_cached_pages: 6,
            max_uncached_pages: 2,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AtlasError {
    /// The mask exceeds the page dimension; the caller must fall back to a
    /// non-atlased rendering path.
    #[error("mask too large ({width}x{height}) for a {page_size}x{page_size} page")]
    MaskTooLarge {
        width: u32,
        height: u32,
        page_size: u32,
    },
    #[error("no page can fit the mask")]
    NoSpaceAvailable,
    #[error("atlas page texture creation failed")]
    TextureCreationFailed,
}

/// Where a mask landed: which page texture and at what offset.
#[derive(Clone, Debug)]
pub struct AtlasSlot {
    pub texture: Resource,
    pub origin: (u16, u16),
    pub page: u16,
}

/// A dirty sub-region of a page that must be re-uploaded, with its pixels
/// copied out as tightly packed rows.
#[derive(Clone, Debug)]
pub struct AtlasUpload {
    pub texture: Resource,
    pub rect: IRect,
    pub data: Vec<u8>,
    pub row_bytes: u32,
}

struct Page {
    identifier: u16,
    rectanizer: AtlasAllocator,
    texture: Option<Resource>,
    pixels: Vec<u8>,
    dirty_rect: IRect,
    cached_shapes: HashMap<ShapeKey, (u16, u16)>,
}

impl Page {
    fn new(page_size: u32, identifier: u16) -> Self {
        Self {
            identifier,
            rectanizer: AtlasAllocator::new(size2(page_size as i32, page_size as i32)),
            texture: None,
            pixels: Vec::new(),
            dirty_rect: IRect::EMPTY,
            cached_shapes: HashMap::new(),
        }
    }

    fn ensure_texture(&mut self, provider: &mut dyn AtlasTextureProvider, page_size: u32) -> bool {
        if self.texture.is_some() {
            return true;
        }
        match provider.create_atlas_texture(page_size, page_size) {
            Some(texture) => {
                self.texture = Some(texture);
                self.pixels = vec![0; (page_size * page_size) as usize];
                true
            }
            None => false,
        }
    }

    fn allocate(&mut self, width: u32, height: u32) -> Option<(u16, u16)> {
        let alloc = self.rectanizer.allocate(size2(width as i32, height as i32))?;
        Some((alloc.rectangle.min.x as u16, alloc.rectangle.min.y as u16))
    }

    fn blit(&mut self, page_size: u32, origin: (u16, u16), mask_size: (u16, u16), mask: &[u8]) {
        let stride = page_size as usize;
        let (x, y) = (origin.0 as usize, origin.1 as usize);
        let (w, h) = (mask_size.0 as usize, mask_size.1 as usize);
        for row in 0..h {
            let dst = (y + row) * stride + x;
            self.pixels[dst..dst + w].copy_from_slice(&mask[row * w..(row + 1) * w]);
        }
        self.dirty_rect
            .join(IRect::from_xywh(x as i32, y as i32, w as i32, h as i32));
    }

    /// Clear packing state so the page accepts new shapes. The texture and
    /// pixel storage are kept for immediate reuse; in-flight GPU work
    /// reading the old contents is covered by command buffer tracking.
    fn reset(&mut self) {
        self.rectanizer.clear();
        self.cached_shapes.clear();
        self.dirty_rect = IRect::EMPTY;
    }
}

/// Packs rasterized coverage masks into shared page textures with
/// per-list LRU eviction.
pub struct RasterPathAtlas {
    config: AtlasConfig,
    pages: Vec<Page>,
    // MRU at the front. Pages are permanently assigned to one list.
    cached_list: Vec<usize>,
    uncached_list: Vec<usize>,
}

impl Default for RasterPathAtlas {
    fn default() -> Self {
        Self::new(AtlasConfig::default())
    }
}

impl RasterPathAtlas {
    pub fn new(config: AtlasConfig) -> Self {
        assert!(config.page_size > 0);
        assert!(config.max_cached_pages > 0 && config.max_uncached_pages > 0);
        let total = config.max_cached_pages + config.max_uncached_pages;
        let pages = (0..total)
            .map(|i| Page::new(config.page_size, i as u16))
            .collect();
        Self {
            config,
            pages,
            cached_list: (0..config.max_cached_pages).collect(),
            uncached_list: (config.max_cached_pages..total).collect(),
        }
    }

    /// Place a rasterized mask into the atlas.
    ///
    /// A keyed mask that is already resident short-circuits to its existing
    /// slot. Otherwise the mask is packed into the appropriate list's pages
    /// MRU-first; when every page is full, the list's LRU page is reset and
    /// the placement retried once. `mask` is `mask_size.0 * mask_size.1`
    /// A8 bytes, row-major.
    pub fn add_shape(
        &mut self,
        provider: &mut dyn AtlasTextureProvider,
        key: Option<ShapeKey>,
        mask_size: (u16, u16),
        mask: &[u8],
    ) -> Result<AtlasSlot, AtlasError> {
        let (width, height) = (u32::from(mask_size.0), u32::from(mask_size.1));
        debug_assert!(width > 0 && height > 0);
        debug_assert_eq!(mask.len(), (width * height) as usize);
        if width > self.config.page_size || height > self.config.page_size {
            return Err(AtlasError::MaskTooLarge {
                width,
                height,
                page_size: self.config.page_size,
            });
        }

        if let Some(key) = key {
            for pos in 0..self.cached_list.len() {
                let page_index = self.cached_list[pos];
                if let Some(&origin) = self.pages[page_index].cached_shapes.get(&key) {
                    self.make_mru(true, page_index);
                    return Ok(self.slot(page_index, origin));
                }
            }
        }

        self.add_rect(provider, key, mask_size, mask)
    }

    /// Flush every page's dirty region as an incremental upload and clear
    /// the dirty tracking. The caller feeds these to its upload task.
    pub fn record_uploads(&mut self) -> Vec<AtlasUpload> {
        let stride = self.config.page_size as usize;
        let mut uploads = Vec::new();
        for page in &mut self.pages {
            if page.dirty_rect.is_empty() {
                continue;
            }
            let Some(texture) = page.texture.clone() else {
                continue;
            };
            let rect = page.dirty_rect;
            let (w, h) = (rect.width() as usize, rect.height() as usize);
            let mut data = Vec::with_capacity(w * h);
            for row in 0..h {
                let start = (rect.top as usize + row) * stride + rect.left as usize;
                data.extend_from_slice(&page.pixels[start..start + w]);
            }
            page.dirty_rect = IRect::EMPTY;
            uploads.push(AtlasUpload {
                texture,
                rect,
                data,
                row_bytes: rect.width() as u32,
            });
        }
        uploads
    }

    fn add_rect(
        &mut self,
        provider: &mut dyn AtlasTextureProvider,
        key: Option<ShapeKey>,
        mask_size: (u16, u16),
        mask: &[u8],
    ) -> Result<AtlasSlot, AtlasError> {
        let cached = key.is_some();
        let order = if cached {
            self.cached_list.clone()
        } else {
            self.uncached_list.clone()
        };
        for page_index in order {
            if let Some(slot) = self.try_place(provider, page_index, key, mask_size, mask)? {
                self.make_mru(cached, page_index);
                return Ok(slot);
            }
        }

        // Every page on this list is full; evict its own LRU page and retry
        // once. The other list is never touched.
        let list = if cached {
            &self.cached_list
        } else {
            &self.uncached_list
        };
        let lru = *list.last().expect("page lists are never empty");
        log::debug!("atlas page {} full, resetting for reuse", self.pages[lru].identifier);
        self.pages[lru].reset();
        match self.try_place(provider, lru, key, mask_size, mask)? {
            Some(slot) => {
                self.make_mru(cached, lru);
                Ok(slot)
            }
            None => Err(AtlasError::NoSpaceAvailable),
        }
    }

    fn try_place(
        &mut self,
        provider: &mut dyn AtlasTextureProvider,
        page_index: usize,
        key: Option<ShapeKey>,
        mask_size: (u16, u16),
        mask: &[u8],
    ) -> Result<Option<AtlasSlot>, AtlasError> {
        let page_size = self.config.page_size;
        let page = &mut self.pages[page_index];
        if !page.ensure_texture(provider, page_size) {
            return Err(AtlasError::TextureCreationFailed);
        }
        let Some(origin) = page.allocate(u32::from(mask_size.0), u32::from(mask_size.1)) else {
            return Ok(None);
        };
        page.blit(page_size, origin, mask_size, mask);
        if let Some(key) = key {
            page.cached_shapes.insert(key, origin);
        }
        Ok(Some(self.slot(page_index, origin)))
    }

    fn slot(&self, page_index: usize, origin: (u16, u16)) -> AtlasSlot {
        let page = &self.pages[page_index];
        AtlasSlot {
            texture: page
                .texture
                .clone()
                .expect("placed shapes have an instantiated page texture"),
            origin,
            page: page.identifier,
        }
    }

    fn make_mru(&mut self, cached: bool, page_index: usize) {
        let list = if cached {
            &mut self.cached_list
        } else {
            &mut self.uncached_list
        };
        if list.first() == Some(&page_index) {
            return;
        }
        if let Some(pos) = list.iter().position(|&p| p == page_index) {
            list.remove(pos);
            list.insert(0, page_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::GpuObject;

    struct TestTexture {
        size: u64,
    }

    impl GpuObject for TestTexture {
        fn size_in_bytes(&self) -> u64 {
            self.size
        }

        fn resource_type(&self) -> &'static str {
            "texture"
        }
    }

    #[derive(Default)]
    struct MockProvider {
        fail: bool,
        created: usize,
    }

    impl AtlasTextureProvider for MockProvider {
        fn create_atlas_texture(&mut self, width: u32, height: u32) -> Option<Resource> {
            if self.fail {
                return None;
            }
            self.created += 1;
            Some(Resource::wrap(Box::new(TestTexture {
                size: u64::from(width) * u64::from(height),
            })))
        }
    }

    fn config(page_size: u32, cached: usize, uncached: usize) -> AtlasConfig {
        AtlasConfig {
            page_size,
            max_cached_pages: cached,
            max_uncached_pages: uncached,
        }
    }

    fn mask(w: u16, h: u16) -> Vec<u8> {
        vec![0xff; usize::from(w) * usize::from(h)]
    }

    #[test]
    fn pages_instantiate_textures_lazily() {
        let mut atlas = RasterPathAtlas::new(config(64, 2, 1));
        let mut provider = MockProvider::default();
        assert_eq!(provider.created, 0);

        atlas
            .add_shape(&mut provider, Some(ShapeKey(1)), (16, 16), &mask(16, 16))
            .unwrap();
        assert_eq!(provider.created, 1);

        // A second shape on the same page does not create another texture.
        atlas
            .add_shape(&mut provider, Some(ShapeKey(2)), (16, 16), &mask(16, 16))
            .unwrap();
        assert_eq!(provider.created, 1);
    }

    #[test]
    fn cached_shape_reuses_its_slot() {
        let mut atlas = RasterPathAtlas::new(config(64, 2, 1));
        let mut provider = MockProvider::default();

        let first = atlas
            .add_shape(&mut provider, Some(ShapeKey(7)), (16, 16), &mask(16, 16))
            .unwrap();
        // Flush so a pure cache hit leaves nothing dirty.
        assert_eq!(atlas.record_uploads().len(), 1);

        let again = atlas
            .add_shape(&mut provider, Some(ShapeKey(7)), (16, 16), &mask(16, 16))
            .unwrap();
        assert_eq!(first.origin, again.origin);
        assert_eq!(first.page, again.page);
        assert!(atlas.record_uploads().is_empty());
    }

    #[test]
    fn oversized_mask_is_rejected() {
        let mut atlas = RasterPathAtlas::new(config(64, 2, 1));
        let mut provider = MockProvider::default();
        let err = atlas
            .add_shape(&mut provider, None, (65, 8), &mask(65, 8))
            .unwrap_err();
        assert_eq!(
            err,
            AtlasError::MaskTooLarge {
                width: 65,
                height: 8,
                page_size: 64,
            }
        );
    }

    #[test]
    fn texture_creation_failure_surfaces() {
        let mut atlas = RasterPathAtlas::new(config(64, 1, 1));
        let mut provider = MockProvider {
            fail: true,
            ..Default::default()
        };
        let err = atlas
            .add_shape(&mut provider, None, (16, 16), &mask(16, 16))
            .unwrap_err();
        assert_eq!(err, AtlasError::TextureCreationFailed);
    }

    #[test]
    fn scenario_full_list_evicts_exactly_its_lru_page() {
        // Two cached pages, four 32x32 shapes per 64x64 page.
        let mut atlas = RasterPathAtlas::new(config(64, 2, 1));
        let mut provider = MockProvider::default();
        for i in 0..8 {
            atlas
                .add_shape(&mut provider, Some(ShapeKey(i)), (32, 32), &mask(32, 32))
                .unwrap();
        }
        // Shapes 0-3 landed on page 0, shapes 4-7 on page 1 which is now
        // MRU.
        assert_eq!(atlas.pages[0].cached_shapes.len(), 4);
        assert_eq!(atlas.pages[1].cached_shapes.len(), 4);
        assert_eq!(atlas.cached_list, vec![1, 0]);

        // A ninth shape must reset the LRU page (page 0) and succeed on
        // retry.
        let slot = atlas
            .add_shape(&mut provider, Some(ShapeKey(8)), (32, 32), &mask(32, 32))
            .unwrap();
        assert_eq!(slot.page, 0);
        assert_eq!(atlas.pages[0].cached_shapes.len(), 1);
        assert!(atlas.pages[0].cached_shapes.contains_key(&ShapeKey(8)));
        // The MRU page kept all its shapes, and the uncached page was never
        // touched (or even instantiated).
        assert_eq!(atlas.pages[1].cached_shapes.len(), 4);
        assert!(atlas.pages[2].texture.is_none());
        assert_eq!(atlas.cached_list, vec![0, 1]);
    }

    #[test]
    fn uncached_pressure_never_evicts_cached_pages() {
        let mut atlas = RasterPathAtlas::new(config(64, 1, 1));
        let mut provider = MockProvider::default();

        let keyed = atlas
            .add_shape(&mut provider, Some(ShapeKey(1)), (32, 32), &mask(32, 32))
            .unwrap();

        // Five anonymous shapes overflow the single uncached page.
        for _ in 0..5 {
            atlas
                .add_shape(&mut provider, None, (32, 32), &mask(32, 32))
                .unwrap();
        }

        // The cached page still holds the keyed shape at its old slot.
        let again = atlas
            .add_shape(&mut provider, Some(ShapeKey(1)), (32, 32), &mask(32, 32))
            .unwrap();
        assert_eq!(keyed.origin, again.origin);
        assert_eq!(keyed.page, again.page);
    }

    #[test]
    fn page_reset_retains_the_texture() {
        let mut atlas = RasterPathAtlas::new(config(64, 1, 1));
        let mut provider = MockProvider::default();

        for i in 0..5 {
            atlas
                .add_shape(&mut provider, Some(ShapeKey(i)), (32, 32), &mask(32, 32))
                .unwrap();
        }
        // The overflow reset page 0 but did not reallocate its texture.
        assert_eq!(provider.created, 1);
    }

    #[test]
    fn record_uploads_covers_only_the_dirty_region() {
        let mut atlas = RasterPathAtlas::new(config(64, 1, 1));
        let mut provider = MockProvider::default();

        atlas
            .add_shape(&mut provider, Some(ShapeKey(1)), (16, 16), &mask(16, 16))
            .unwrap();
        let uploads = atlas.record_uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].rect.width(), 16);
        assert_eq!(uploads[0].rect.height(), 16);
        assert_eq!(uploads[0].row_bytes, 16);
        assert_eq!(uploads[0].data.len(), 256);
        assert!(uploads[0].data.iter().all(|&b| b == 0xff));

        // The next flush only carries the incremental placement.
        atlas
            .add_shape(&mut provider, Some(ShapeKey(2)), (16, 16), &mask(16, 16))
            .unwrap();
        let uploads = atlas.record_uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].rect.width(), 16);
        assert_eq!(uploads[0].rect.height(), 16);

        // Nothing dirty, nothing to upload.
        assert!(atlas.record_uploads().is_empty());
    }
}
