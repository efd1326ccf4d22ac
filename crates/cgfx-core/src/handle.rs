use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque handle naming an object owned by the graphics driver.
/// The engine never dereferences these; only the driver that issued a handle
/// can resolve it to a native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverHandle {
    /// Driver-assigned identifier, unique per driver instance
    pub raw: u64,
    /// Type tag for debugging and validation
    pub kind: ResourceKind,
}

impl DriverHandle {
    /// Create a null/invalid handle.
    pub const fn null() -> Self {
        Self {
            raw: 0,
            kind: ResourceKind::None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw == 0
    }

    /// Panics unless the handle is non-null and tagged with `kind`.
    #[track_caller]
    pub fn expect_kind(&self, kind: ResourceKind) -> Self {
        assert!(
            !self.is_null() && self.kind == kind,
            "expected a {:?} handle, got {:?}",
            kind,
            self
        );
        *self
    }
}

impl Default for DriverHandle {
    fn default() -> Self {
        Self::null()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    None,
    Buffer,
    Image,
    ImageView,
    CommandBuffer,
    Pipeline,
    PipelineLayout,
    RenderPass,
    Framebuffer,
    DescriptorSet,
    ShaderModule,
    Event,
    Memory,
    QueryPool,
    Semaphore,
}

/// Issues unique driver handles. Ids start at 1 so that 0 stays the null handle.
pub struct HandleAllocator {
    next_id: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a new handle with the given resource kind.
    pub fn alloc(&self, kind: ResourceKind) -> DriverHandle {
        DriverHandle {
            raw: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
