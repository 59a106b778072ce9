// SPDX-FileCopyrightText: 2025 rpica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Null texture runtime: refuses every allocation and ignores every
//! operation. Useful for headless runs and for exercising the cache's
//! allocation-failure paths.

use rpica_common::Rectangle;

use super::super::pixel_format::PixelFormat;
use super::super::surface_params::SurfaceParams;
use super::{
    Allocation, BufferTextureCopy, SharedRecycler, StagingData, TextureBlit, TextureClear,
    TextureCopy, TextureRuntime,
};

#[derive(Default)]
pub struct NullRuntime {
    recycler: SharedRecycler,
}

impl NullRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TextureRuntime for NullRuntime {
    fn recycler(&self) -> &SharedRecycler {
        &self.recycler
    }

    fn find_staging(&mut self, size: usize, _upload: bool) -> StagingData {
        StagingData {
            size,
            data: vec![0; size],
        }
    }

    fn recycle_staging(&mut self, _staging: StagingData) {}

    fn allocate(&mut self, _params: &SurfaceParams) -> Option<Allocation> {
        None
    }

    fn upload(&mut self, _alloc: &Allocation, _copy: &BufferTextureCopy, _staging: &StagingData) {}

    fn download(
        &mut self,
        _alloc: &Allocation,
        _copy: &BufferTextureCopy,
        _staging: &mut StagingData,
    ) {
    }

    fn clear_texture(&mut self, _alloc: &Allocation, _clear: &TextureClear) {}

    fn copy_textures(&mut self, _src: &Allocation, _dst: &Allocation, _copy: &TextureCopy) {}

    fn blit_textures(&mut self, _src: &Allocation, _dst: &Allocation, _blit: &TextureBlit) {}

    fn generate_mipmaps(&mut self, _alloc: &Allocation, _max_level: u32) {}

    fn reinterpretation_sources(&self, _dest_format: PixelFormat) -> Vec<PixelFormat> {
        Vec::new()
    }

    fn reinterpret(
        &mut self,
        _src: &Allocation,
        _src_rect: Rectangle<u32>,
        _dst: &Allocation,
        _dst_rect: Rectangle<u32>,
    ) -> bool {
        false
    }
}
