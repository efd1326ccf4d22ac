use ash::vk;

/// Failures reported by a [`Driver`](crate::driver::Driver).
///
/// Precondition violations are not represented here; those panic at the
/// call site.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("device lost")]
    DeviceLost,

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("driver error {code}: {message}")]
    Driver { code: i32, message: String },
}

impl From<vk::Result> for DriverError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => DriverError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DriverError::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => DriverError::OutOfHostMemory,
            other => DriverError::Driver {
                code: other.as_raw(),
                message: format!("{:?}", other),
            },
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
