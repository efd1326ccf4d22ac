//! Partially resident textures.
//!
//! A [`SparseTexture`] reserves the full virtual footprint of an image and
//! tracks a page table of `[layer][mip][page]`. Pages are bound and evicted
//! one at a time; the changes are batched until [`SparseTexture::commit_changes`]
//! hands them to the driver. Mips from the device's mip-tail threshold down
//! are not paged and share one opaque allocation per layer (or one for the
//! whole image when the device reports a single mip tail).

use std::sync::Arc;

use ash::vk;
use cgfx_core::config::SparseConfig;
use cgfx_core::DriverHandle;
use tracing::{debug, info, warn};

use crate::barrier::{BarrierDomain, BarrierInfo, PipelineStage, TextureSubresource};
use crate::command::CommandBuffer;
use crate::driver::{
    Driver, GpuAlloc, SparseBindInfo, SparseImageDesc, SparseImageRequirements, SparseOpaqueBind,
    SparsePageBind,
};
use crate::error::{DriverError, DriverResult};
use crate::submission::SubmissionContext;

/// One page of a sparse mip. `alloc` is either a full page of memory or
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparsePage {
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
    pub alloc: Option<GpuAlloc>,
}

impl SparsePage {
    pub fn is_resident(&self) -> bool {
        self.alloc.is_some()
    }

    pub fn contains(&self, x: u32, y: u32, z: u32) -> bool {
        let inside = |coord: u32, offset: i32, extent: u32| {
            let offset = offset as u32;
            coord >= offset && coord < offset + extent
        };
        inside(x, self.offset.x, self.extent.width)
            && inside(y, self.offset.y, self.extent.height)
            && inside(z, self.offset.z, self.extent.depth)
    }
}

pub struct SparseTexture {
    driver: Arc<dyn Driver>,
    name: String,
    image: DriverHandle,
    desc: SparseImageDesc,
    reqs: SparseImageRequirements,
    /// `[layer][mip][page]`; mips inside the tail have no pages
    pages: Vec<Vec<Vec<SparsePage>>>,
    /// Pages per axis for each mip
    bind_counts: Vec<[u32; 3]>,
    mip_tail: Vec<GpuAlloc>,
    pending_pages: Vec<SparsePageBind>,
    pending_opaque: Vec<SparseOpaqueBind>,
    /// Memory evicted since the last commit, still bound until it lands
    unbound: Vec<GpuAlloc>,
    max_pages_per_commit: usize,
}

fn mip_extent(extent: vk::Extent3D, mip: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: (extent.width >> mip).max(1),
        height: (extent.height >> mip).max(1),
        depth: (extent.depth >> mip).max(1),
    }
}

/// Tile one mip with pages of `granularity`, clipping the last page on each
/// axis to the mip's edge. Pages are laid out x-fastest.
fn tile_mip(extent: vk::Extent3D, granularity: vk::Extent3D) -> ([u32; 3], Vec<SparsePage>) {
    let counts = [
        extent.width.div_ceil(granularity.width),
        extent.height.div_ceil(granularity.height),
        extent.depth.div_ceil(granularity.depth),
    ];
    let mut pages = Vec::with_capacity((counts[0] * counts[1] * counts[2]) as usize);
    for z in 0..counts[2] {
        for y in 0..counts[1] {
            for x in 0..counts[0] {
                let offset = vk::Offset3D {
                    x: (x * granularity.width) as i32,
                    y: (y * granularity.height) as i32,
                    z: (z * granularity.depth) as i32,
                };
                pages.push(SparsePage {
                    offset,
                    extent: vk::Extent3D {
                        width: granularity.width.min(extent.width - offset.x as u32),
                        height: granularity.height.min(extent.height - offset.y as u32),
                        depth: granularity.depth.min(extent.depth - offset.z as u32),
                    },
                    alloc: None,
                });
            }
        }
    }
    (counts, pages)
}

impl SparseTexture {
    /// Create the image, build its page table and bind the mip tail.
    ///
    /// `cmd` must be recording; it receives the transition of the whole image
    /// out of its initial state.
    pub fn create(
        driver: Arc<dyn Driver>,
        name: &str,
        desc: &SparseImageDesc,
        cmd: &mut CommandBuffer,
        config: &SparseConfig,
    ) -> DriverResult<Self> {
        if !config.enabled {
            return Err(DriverError::Unsupported(format!(
                "sparse texture '{}': sparse residency is disabled",
                name
            )));
        }
        let image = driver.create_sparse_image(desc)?;
        let reqs = match driver.sparse_requirements(image) {
            Ok(reqs) => reqs,
            Err(e) => {
                driver.destroy(image);
                return Err(e);
            }
        };
        let limits = driver.device_limits();
        assert!(
            reqs.memory_size <= limits.sparse_address_space_size,
            "sparse texture '{}' needs {} bytes, device address space is {}",
            name,
            reqs.memory_size,
            limits.sparse_address_space_size
        );
        assert!(
            reqs.granularity.width > 0 && reqs.granularity.height > 0 && reqs.granularity.depth > 0,
            "sparse texture '{}' has an empty page granularity",
            name
        );

        let paged_mips = desc.mips.min(reqs.mip_tail_first_lod);
        let mut bind_counts = vec![[0u32; 3]; desc.mips as usize];
        let mut pages = Vec::with_capacity(desc.layers as usize);
        for _ in 0..desc.layers {
            let mut layer_pages = Vec::with_capacity(desc.mips as usize);
            for mip in 0..desc.mips {
                if mip < paged_mips {
                    let (counts, mip_pages) =
                        tile_mip(mip_extent(desc.extent, mip), reqs.granularity);
                    bind_counts[mip as usize] = counts;
                    layer_pages.push(mip_pages);
                } else {
                    layer_pages.push(Vec::new());
                }
            }
            pages.push(layer_pages);
        }

        let mut texture = SparseTexture {
            driver,
            name: name.to_string(),
            image,
            desc: *desc,
            reqs,
            pages,
            bind_counts,
            mip_tail: Vec::new(),
            pending_pages: Vec::new(),
            pending_opaque: Vec::new(),
            unbound: Vec::new(),
            max_pages_per_commit: config.max_pages_per_commit as usize,
        };
        // Nothing has been recorded against the image yet, so a failure here
        // can release everything immediately.
        if let Err(e) = texture.bind_initial() {
            texture.release_now();
            return Err(e);
        }

        cmd.barrier(
            BarrierInfo::new(
                PipelineStage::ImageInitial,
                PipelineStage::AllShadersRead,
                BarrierDomain::Global,
            )
            .texture(
                image,
                TextureSubresource {
                    aspect: reqs.aspect,
                    mip: 0,
                    mip_count: desc.mips,
                    layer: 0,
                    layer_count: desc.layers,
                },
            ),
        );

        info!(
            name = %texture.name,
            width = desc.extent.width,
            height = desc.extent.height,
            mips = desc.mips,
            layers = desc.layers,
            paged_mips,
            "sparse texture created"
        );
        Ok(texture)
    }

    fn bind_initial(&mut self) -> DriverResult<()> {
        self.bind_mip_tail()?;
        let unbound = self.commit_changes()?;
        debug_assert!(unbound.is_empty());
        Ok(())
    }

    /// Free the image and its memory without waiting on the GPU. Only for
    /// textures that no submitted work has seen.
    fn release_now(self) {
        for alloc in self.allocations() {
            self.driver.free_memory(alloc);
        }
        self.driver.destroy(self.image);
        warn!(name = %self.name, "sparse texture creation failed, resources released");
    }

    /// Every allocation the texture owns: resident pages, the mip tail and
    /// evicted pages not yet returned.
    fn allocations(&self) -> Vec<GpuAlloc> {
        let pages = self
            .pages
            .iter()
            .flatten()
            .flatten()
            .filter_map(|page| page.alloc);
        pages
            .chain(self.mip_tail.iter().copied())
            .chain(self.unbound.iter().copied())
            .collect()
    }

    fn bind_mip_tail(&mut self) -> DriverResult<()> {
        if self.reqs.mip_tail_first_lod >= self.desc.mips || self.reqs.mip_tail_size == 0 {
            return Ok(());
        }
        let tails = if self.reqs.single_mip_tail {
            1
        } else {
            self.desc.layers
        };
        for layer in 0..tails {
            let alloc = self
                .driver
                .allocate_memory(self.reqs.mip_tail_size, self.reqs.alignment)?;
            self.pending_opaque.push(SparseOpaqueBind {
                resource_offset: self.reqs.mip_tail_offset
                    + layer as u64 * self.reqs.mip_tail_stride,
                size: self.reqs.mip_tail_size,
                memory: Some(alloc),
            });
            self.mip_tail.push(alloc);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> DriverHandle {
        self.image
    }

    pub fn requirements(&self) -> &SparseImageRequirements {
        &self.reqs
    }

    /// Page extent in texels.
    pub fn page_size(&self) -> vk::Extent3D {
        self.reqs.granularity
    }

    /// Pages per axis of `mip`; zero for mips inside the tail.
    pub fn bind_counts(&self, mip: u32) -> [u32; 3] {
        self.bind_counts[mip as usize]
    }

    pub fn is_paged(&self, mip: u32) -> bool {
        mip < self.desc.mips && mip < self.reqs.mip_tail_first_lod
    }

    /// Index of the page holding texel `(x, y, z)` of `mip`, or `None` for
    /// mip-tail mips and coordinates outside the mip.
    pub fn page_index(&self, layer: u32, mip: u32, x: u32, y: u32, z: u32) -> Option<u32> {
        if layer >= self.desc.layers || !self.is_paged(mip) {
            return None;
        }
        let extent = mip_extent(self.desc.extent, mip);
        if x >= extent.width || y >= extent.height || z >= extent.depth {
            return None;
        }
        let g = self.reqs.granularity;
        let [count_x, count_y, _] = self.bind_counts[mip as usize];
        Some(x / g.width + count_x * (y / g.height + count_y * (z / g.depth)))
    }

    pub fn pages(&self, layer: u32, mip: u32) -> &[SparsePage] {
        &self.pages[layer as usize][mip as usize]
    }

    #[track_caller]
    pub fn page(&self, layer: u32, mip: u32, index: u32) -> &SparsePage {
        &self.pages[layer as usize][mip as usize][index as usize]
    }

    #[track_caller]
    fn page_mut(&mut self, layer: u32, mip: u32, index: u32) -> &mut SparsePage {
        assert!(
            self.is_paged(mip),
            "sparse texture '{}': mip {} is in the mip tail",
            self.name,
            mip
        );
        &mut self.pages[layer as usize][mip as usize][index as usize]
    }

    fn page_bind(&self, layer: u32, mip: u32, page: &SparsePage) -> SparsePageBind {
        SparsePageBind {
            aspect: self.reqs.aspect,
            mip,
            layer,
            offset: page.offset,
            extent: page.extent,
            memory: page.alloc,
        }
    }

    /// Back one page with memory. The page must not be resident.
    #[track_caller]
    pub fn make_resident(&mut self, layer: u32, mip: u32, index: u32) -> DriverResult<()> {
        let resident = self.page_mut(layer, mip, index).is_resident();
        assert!(
            !resident,
            "sparse texture '{}': page {} of layer {} mip {} is already resident",
            self.name,
            index,
            layer,
            mip
        );
        let alloc = self
            .driver
            .allocate_memory(self.reqs.page_size, self.reqs.alignment)?;
        let page = self.page_mut(layer, mip, index);
        page.alloc = Some(alloc);
        let page = *page;
        let bind = self.page_bind(layer, mip, &page);
        self.pending_pages.push(bind);
        Ok(())
    }

    /// Unbind one page. The page must be resident. Its memory is returned by
    /// the next commit.
    #[track_caller]
    pub fn evict(&mut self, layer: u32, mip: u32, index: u32) {
        let resident = self.page_mut(layer, mip, index).is_resident();
        assert!(
            resident,
            "sparse texture '{}': page {} of layer {} mip {} is not resident",
            self.name,
            index,
            layer,
            mip
        );
        let page = self.page_mut(layer, mip, index);
        let alloc = page.alloc.take();
        let page = *page;
        self.unbound.extend(alloc);
        let bind = self.page_bind(layer, mip, &page);
        self.pending_pages.push(bind);
    }

    /// Make every page of `mip` resident, skipping pages that already are.
    pub fn make_mip_resident(&mut self, layer: u32, mip: u32) -> DriverResult<()> {
        let count = self.pages(layer, mip).len() as u32;
        for index in 0..count {
            if !self.page(layer, mip, index).is_resident() {
                self.make_resident(layer, mip, index)?;
            }
        }
        Ok(())
    }

    /// Evict every resident page of `mip`.
    pub fn evict_mip(&mut self, layer: u32, mip: u32) {
        let count = self.pages(layer, mip).len() as u32;
        for index in 0..count {
            if self.page(layer, mip, index).is_resident() {
                self.evict(layer, mip, index);
            }
        }
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending_pages.is_empty() || !self.pending_opaque.is_empty()
    }

    /// Flush pending binds to the driver. Returns the memory of pages evicted
    /// since the last commit; the GPU may still be reading it, so it belongs
    /// in a [`SubmissionContext`] rather than being freed directly.
    ///
    /// When a split commit fails partway, the chunks that landed are dropped
    /// from the pending list and a retry submits only the rest. Evicted
    /// memory is held back until a commit completes.
    #[must_use = "evicted memory must be freed"]
    pub fn commit_changes(&mut self) -> DriverResult<Vec<GpuAlloc>> {
        if !self.has_pending_changes() {
            return Ok(Vec::new());
        }
        let chunk = if self.max_pages_per_commit == 0 {
            self.pending_pages.len().max(1)
        } else {
            self.max_pages_per_commit
        };
        let mut opaque_sent = false;
        let mut committed = 0;
        let mut result = Ok(());
        if self.pending_pages.is_empty() {
            result = self.driver.bind_sparse(&SparseBindInfo {
                image: self.image,
                page_binds: &[],
                opaque_binds: &self.pending_opaque,
            });
            opaque_sent = result.is_ok();
        }
        for page_binds in self.pending_pages.chunks(chunk) {
            let opaque_binds: &[SparseOpaqueBind] = if opaque_sent {
                &[]
            } else {
                &self.pending_opaque
            };
            result = self.driver.bind_sparse(&SparseBindInfo {
                image: self.image,
                page_binds,
                opaque_binds,
            });
            if result.is_err() {
                break;
            }
            opaque_sent = true;
            committed += page_binds.len();
        }

        let pages = self.pending_pages.len();
        let opaque = self.pending_opaque.len();
        self.pending_pages.drain(..committed);
        if opaque_sent {
            self.pending_opaque.clear();
        }
        if let Err(e) = result {
            warn!(
                name = %self.name,
                committed,
                remaining = self.pending_pages.len(),
                "sparse commit failed: {}",
                e
            );
            return Err(e);
        }
        debug!(name = %self.name, pages, opaque, "sparse binds committed");
        Ok(std::mem::take(&mut self.unbound))
    }

    /// Hand the image and all of its memory to `ctx` for deferred release.
    pub fn destroy(self, ctx: &mut SubmissionContext) {
        for alloc in self.allocations() {
            ctx.free_memory(alloc);
        }
        ctx.free_texture(self.image);
        debug!(name = %self.name, "sparse texture destroyed");
    }
}
