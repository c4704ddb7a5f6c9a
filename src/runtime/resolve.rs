/**
 * Device / precision resolution.
 *
 * Maps the operator's preferences onto what the host can actually run. The
 * decision is a pure function of the requested values and a [`Capabilities`]
 * probe; the loader is responsible for logging the returned warnings.
 */
use std::fmt;

use serde::Serialize;

use crate::config::{DevicePreference, Precision};

/// Concrete device a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Accelerator,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Floating point width of the weights that get loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericPrecision {
    Fp32,
    Fp16,
}

impl fmt::Display for NumericPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp16 => write!(f, "fp16"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedRuntimeParams {
    pub device: Device,
    pub precision: NumericPrecision,
    pub quantized: bool,
}

impl ResolvedRuntimeParams {
    /// Label reported by the metadata endpoint.
    pub fn precision_label(&self) -> String {
        if self.quantized {
            "int8".to_string()
        } else {
            self.precision.to_string()
        }
    }
}

/// Fallbacks taken during resolution. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionWarning {
    /// fp16 was requested but the runtime is on the CPU.
    Fp16OnCpu,
    /// int8 was requested but no quantized artifacts are available.
    QuantizationUnavailable { fallback: NumericPrecision },
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp16OnCpu => write!(f, "fp16 requested on CPU; falling back to fp32"),
            Self::QuantizationUnavailable { fallback } => write!(
                f,
                "int8 quantization backend unavailable; falling back to {fallback}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub params: ResolvedRuntimeParams,
    pub warnings: Vec<ResolutionWarning>,
}

/// What the host can do. Implemented by the ONNX backend; faked in tests.
pub trait Capabilities {
    fn accelerator_available(&self) -> bool;
    fn quantization_available(&self) -> bool;
}

/// Fixed capabilities, handy for tests and for reporting before load.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCapabilities {
    pub accelerator: bool,
    pub quantization: bool,
}

impl Capabilities for StaticCapabilities {
    fn accelerator_available(&self) -> bool {
        self.accelerator
    }

    fn quantization_available(&self) -> bool {
        self.quantization
    }
}

pub fn resolve_device(preferred: Option<DevicePreference>, caps: &dyn Capabilities) -> Device {
    match preferred {
        Some(DevicePreference::Cpu) => Device::Cpu,
        Some(DevicePreference::Accelerator) => Device::Accelerator,
        None if caps.accelerator_available() => Device::Accelerator,
        None => Device::Cpu,
    }
}

fn auto_precision(device: Device) -> NumericPrecision {
    match device {
        Device::Accelerator => NumericPrecision::Fp16,
        Device::Cpu => NumericPrecision::Fp32,
    }
}

pub fn resolve(
    preferred: Option<DevicePreference>,
    precision: Precision,
    caps: &dyn Capabilities,
) -> Resolution {
    let device = resolve_device(preferred, caps);
    let mut warnings = Vec::new();

    let (precision, quantized) = match precision {
        Precision::Fp32 => (NumericPrecision::Fp32, false),
        Precision::Fp16 if device == Device::Cpu => {
            warnings.push(ResolutionWarning::Fp16OnCpu);
            (NumericPrecision::Fp32, false)
        }
        Precision::Fp16 => (NumericPrecision::Fp16, false),
        Precision::Auto => (auto_precision(device), false),
        Precision::Int8 if caps.quantization_available() => (auto_precision(device), true),
        Precision::Int8 => {
            let fallback = auto_precision(device);
            warnings.push(ResolutionWarning::QuantizationUnavailable { fallback });
            (fallback, false)
        }
    };

    Resolution {
        params: ResolvedRuntimeParams {
            device,
            precision,
            quantized,
        },
        warnings,
    }
}
