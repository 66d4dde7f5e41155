//! Device strings: `cpu`, `cuda`, `cuda:N`, `cuda_if_available`, `metal`, `metal:N`, `mps`.

use candle_core::Device;
use tracing::{info, warn};

use crate::error::{CebraError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    /// CUDA device 0, or the CPU when CUDA cannot be initialized.
    CudaIfAvailable,
    Metal(usize),
}

pub fn parse_device_spec(spec: &str) -> Result<DeviceSpec> {
    let spec = spec.trim().to_ascii_lowercase();
    let ordinal = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| CebraError::InvalidConfig(format!("invalid device ordinal in '{spec}'")))
    };
    match spec.as_str() {
        "cpu" => Ok(DeviceSpec::Cpu),
        "cuda" => Ok(DeviceSpec::Cuda(0)),
        "cuda_if_available" => Ok(DeviceSpec::CudaIfAvailable),
        "metal" | "mps" => Ok(DeviceSpec::Metal(0)),
        other => {
            if let Some(n) = other.strip_prefix("cuda:") {
                Ok(DeviceSpec::Cuda(ordinal(n)?))
            } else if let Some(n) = other.strip_prefix("metal:") {
                Ok(DeviceSpec::Metal(ordinal(n)?))
            } else {
                Err(CebraError::InvalidConfig(format!(
                    "unknown device '{other}', expected cpu, cuda, cuda:N, cuda_if_available, metal[:N] or mps"
                )))
            }
        }
    }
}

pub fn resolve_device(spec: &str) -> Result<Device> {
    let device = match parse_device_spec(spec)? {
        DeviceSpec::Cpu => Device::Cpu,
        DeviceSpec::Cuda(n) => Device::new_cuda(n)?,
        DeviceSpec::Metal(n) => Device::new_metal(n)?,
        DeviceSpec::CudaIfAvailable => match Device::new_cuda(0) {
            Ok(d) => {
                info!("using device: CUDA(0)");
                d
            }
            Err(e) => {
                warn!("CUDA not available ({e}), using CPU");
                Device::Cpu
            }
        },
    };
    Ok(device)
}
