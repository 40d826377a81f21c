use candle_core::{DType, Device};
use layers::PrecisionPolicy;

/// Placement and storage dtype for model parameters.
///
/// This carries no hyperparameters; two models built from the same config on
/// different contexts compute the same function.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub device: Device,
    pub dtype: DType,
}

impl DeviceContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn policy(&self) -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(self.dtype)
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }
}
