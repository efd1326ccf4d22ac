//! The object that owns the process-wide graphics state.
//!
//! One [`GraphicsContext`] is created per device. Subsystems that need the
//! pipeline database, the shader feature registry or named barriers borrow
//! them from here instead of reaching for globals.

use std::sync::Arc;
use std::time::Duration;

use cgfx_core::GraphicsConfig;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::barrier::{BarrierId, BarrierInfo, BarrierTable};
use crate::command::{CommandBuffer, CommandBufferCreateInfo, CommandBufferPoolInfo};
use crate::driver::{Driver, QueueType, SparseImageDesc};
use crate::error::{DriverError, DriverResult};
use crate::pipeline_db::PipelineDatabase;
use crate::shader_feature::{ShaderFeatureMask, ShaderFeatureRegistry};
use crate::sparse::SparseTexture;
use crate::submission::{SubmissionContext, SubmissionContextCreateInfo};

/// How long a cycle may block on one slot before it is treated as a hang.
const SLOT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GraphicsContext {
    driver: Arc<dyn Driver>,
    config: GraphicsConfig,
    pipelines: PipelineDatabase,
    features: RwLock<ShaderFeatureRegistry>,
    barriers: Mutex<BarrierTable>,
}

impl GraphicsContext {
    pub fn init(driver: Arc<dyn Driver>, config: GraphicsConfig) -> DriverResult<Self> {
        config
            .validate()
            .map_err(|e| DriverError::Config(e.to_string()))?;
        info!(
            buffered_frames = config.submission.buffered_frames,
            timeline = config.submission.use_timeline,
            sparse = config.sparse.enabled,
            "graphics context initialized"
        );
        Ok(Self {
            pipelines: PipelineDatabase::new(
                driver.clone(),
                config.pipelines.warn_on_compile_in_frame,
            ),
            driver,
            config,
            features: RwLock::new(ShaderFeatureRegistry::new()),
            barriers: Mutex::new(BarrierTable::new()),
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    pub fn pipelines(&self) -> &PipelineDatabase {
        &self.pipelines
    }

    // ── Shader features ─────────────────────────────────────

    /// Mask for `features`, registering names not seen before.
    #[track_caller]
    pub fn feature_mask(&self, features: &str) -> ShaderFeatureMask {
        self.features.write().string_to_mask(features)
    }

    pub fn feature_string(&self, mask: ShaderFeatureMask) -> String {
        self.features.read().mask_to_string(mask)
    }

    pub fn features(&self) -> &RwLock<ShaderFeatureRegistry> {
        &self.features
    }

    // ── Named barriers ──────────────────────────────────────

    #[track_caller]
    pub fn create_barrier(&self, info: BarrierInfo) -> BarrierId {
        self.barriers.lock().create(info)
    }

    #[track_caller]
    pub fn destroy_barrier(&self, id: BarrierId) {
        self.barriers.lock().destroy(id);
    }

    /// The barrier table, for `CommandBuffer::barrier_push_named`.
    pub fn barriers(&self) -> MutexGuard<'_, BarrierTable> {
        self.barriers.lock()
    }

    // ── Submission ──────────────────────────────────────────

    /// A frame ring on `queue` with one slot per buffered frame.
    pub fn create_submission_context(&self, name: &str, queue: QueueType) -> SubmissionContext {
        SubmissionContext::new(
            self.driver.clone(),
            SubmissionContextCreateInfo {
                name: name.to_string(),
                num_buffers: self.config.submission.buffered_frames,
                pool: CommandBufferPoolInfo {
                    queue,
                    resettable: true,
                    short_lived: true,
                },
                buffer: CommandBufferCreateInfo {
                    name: name.to_string(),
                    markers: self.config.debug.markers,
                    ..Default::default()
                },
            },
        )
    }

    /// Block until `queue` has reached `value`. Without timelines the whole
    /// device is drained instead.
    pub fn wait(&self, queue: QueueType, value: u64) -> DriverResult<()> {
        if !self.config.submission.use_timeline {
            return self.driver.wait_idle();
        }
        if self.driver.wait_timeline(queue, value, SLOT_WAIT_TIMEOUT)? {
            return Ok(());
        }
        Err(DriverError::Timeout(format!(
            "{:?} queue did not reach {} within {:?}",
            queue, value, SLOT_WAIT_TIMEOUT
        )))
    }

    /// Advance `ctx` to its next slot, waiting for the GPU to release it.
    /// Returns the timeline value of the slot left behind. If the wait
    /// fails the ring is not advanced and nothing is freed.
    pub fn next_cycle(&self, ctx: &mut SubmissionContext) -> DriverResult<u64> {
        let next = (ctx.current_index() + 1) % ctx.num_buffers();
        let value = ctx.timeline_index(next);
        if value != 0 {
            self.wait(ctx.queue(), value)?;
        }
        Ok(ctx.next_cycle(|_| {}))
    }

    /// Free whatever slots of `ctx` the GPU has already finished with.
    pub fn poll(&self, ctx: &mut SubmissionContext) -> usize {
        let queue = ctx.queue();
        let reached = match self.driver.timeline_value(queue) {
            Ok(value) => value,
            Err(e) => {
                warn!(context = ctx.name(), "timeline query failed: {}", e);
                return 0;
            }
        };
        ctx.poll(|value| value <= reached)
    }

    /// Queue pipelines replaced by rebuilds for deferred destruction.
    pub fn flush_retired_pipelines(&self, ctx: &mut SubmissionContext) -> usize {
        let retired = self.pipelines.take_retired_pipelines();
        let count = retired.len();
        for pipeline in retired {
            ctx.free_pipeline(pipeline);
        }
        if count > 0 {
            debug!(context = ctx.name(), count, "retired pipelines deferred");
        }
        count
    }

    // ── Sparse ──────────────────────────────────────────────

    pub fn create_sparse_texture(
        &self,
        name: &str,
        desc: &SparseImageDesc,
        cmd: &mut CommandBuffer,
    ) -> DriverResult<SparseTexture> {
        SparseTexture::create(self.driver.clone(), name, desc, cmd, &self.config.sparse)
    }

    // ── Lifecycle ───────────────────────────────────────────

    /// Rebuild device objects after the device was lost and recreated.
    pub fn recover_device_lost(&self) -> DriverResult<()> {
        match self.driver.wait_idle() {
            Ok(()) | Err(DriverError::DeviceLost) => {}
            Err(e) => return Err(e),
        }
        self.pipelines.recreate_pipelines();
        warn!("recovered from device loss");
        Ok(())
    }

    pub fn shutdown(self) {
        if let Err(e) = self.driver.wait_idle() {
            error!("wait_idle failed during shutdown: {}", e);
        }
        self.pipelines.destroy();
        let barriers = self.barriers.lock().len();
        if barriers > 0 {
            debug!(barriers, "named barriers still registered at shutdown");
        }
        info!("graphics context shut down");
    }
}
