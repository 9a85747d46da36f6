//! Typed failure modes for the GSG core.
//!
//! The teacher backend (`lume-rhi`) propagates `Result<_, String>` from every
//! fallible call. That loses the distinction between "the device is gone,
//! stop rendering" and "this one allocation failed, try a bigger page" that
//! the render loop needs to make. `Error` is a closed enum over exactly the
//! failure categories the GSG control plane has to branch on.

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The logical device is gone (driver reset, surprise removal). Terminal:
    /// no further GSG call is expected to succeed after this.
    #[error("device lost")]
    DeviceLost,

    /// A Vulkan allocation (`vkAllocateMemory`, descriptor pool, command
    /// pool) failed to produce the requested resource.
    #[error("out of memory: {0:?}")]
    OutOfMemory(vk::Result),

    /// `vkAcquireNextImageKHR`/`vkQueuePresentKHR` returned `ERROR_OUT_OF_DATE_KHR`.
    /// The swapchain must be recreated before the next `begin_frame`.
    #[error("surface out of date")]
    SurfaceOutOfDate,

    /// `vkQueuePresentKHR` returned `SUBOPTIMAL_KHR`. Not fatal; the frame
    /// still presented, but the swapchain should be recreated soon.
    #[error("swapchain suboptimal")]
    Suboptimal,

    /// A validation layer callback reported a usage error in debug builds.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The sub-allocator could not satisfy a request from any existing or
    /// newly grown page.
    #[error("allocation failed: requested {requested} bytes, largest free range {largest_free}")]
    AllocationFailed { requested: u64, largest_free: u64 },

    /// SPIR-V reflection or `ModuleTransform` rewriting rejected the module.
    #[error("shader compile/reflect failed: {0}")]
    ShaderCompileFailed(String),

    /// `vkCreateGraphicsPipelines`/`vkCreateComputePipelines` failed.
    #[error("pipeline create failed: {0:?}")]
    PipelineCreateFailed(vk::Result),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Error::SurfaceOutOfDate,
            vk::Result::SUBOPTIMAL_KHR => Error::Suboptimal,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Error::OutOfMemory(result)
            }
            other => Error::OutOfMemory(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
