pub mod intel;
pub mod mig;
pub mod nvidia;

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use crate::config::GpuSelection;
use crate::context::Context;
use crate::utils::command::tool_exists;
use crate::utils::errors::Result;

pub use intel::IntelXpu;
pub use mig::{MigPartition, MigProcessUsage, MigTable};
pub use nvidia::NvidiaGpu;

/// Token nvidia-smi prints for utilization while MIG is enabled.
pub const NOT_APPLICABLE: &str = "[N/A]";

/// Device utilization as reported by the vendor tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpuUtilization {
    Percent(f64),
    /// MIG is enabled; usage is only available per partition.
    NotApplicable,
}

impl fmt::Display for GpuUtilization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuUtilization::Percent(value) => write!(f, "{value}"),
            GpuUtilization::NotApplicable => f.write_str(NOT_APPLICABLE),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuDevice {
    /// Ordinal as reported by the vendor tool.
    pub index: u32,
    pub uuid: String,
    pub total_vram_mib: f64,
    pub utilization: GpuUtilization,
    /// MIG partitions, empty unless MIG is enabled on this device.
    pub partitions: Vec<MigPartition>,
}

/// One row of the vendor's per-process VRAM listing.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuProcessUsage {
    pub gpu_uuid: String,
    pub vram_used_mib: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Intel,
}

impl GpuVendor {
    /// NVIDIA reports VRAM per process, so a job's rows add up. Intel only
    /// reports a device-wide figure, which is taken as-is.
    pub fn sums_process_vram(self) -> bool {
        matches!(self, GpuVendor::Nvidia)
    }

    /// Decimal places of the VRAM share, `None` for unrounded.
    pub fn share_precision(self) -> Option<i32> {
        match self {
            GpuVendor::Nvidia => None,
            GpuVendor::Intel => Some(1),
        }
    }
}

/// One point-in-time view of the GPUs on this host.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuSnapshot {
    pub vendor: GpuVendor,
    /// Devices keyed by UUID.
    pub devices: HashMap<String, GpuDevice>,
    /// Per-pid VRAM rows; a pid on several GPUs has several rows.
    pub processes: HashMap<u32, Vec<GpuProcessUsage>>,
    /// MIG partition usage, populated only when some device is in MIG mode.
    pub mig: MigTable,
}

impl GpuSnapshot {
    pub fn empty(vendor: GpuVendor) -> Self {
        Self {
            vendor,
            devices: HashMap::new(),
            processes: HashMap::new(),
            mig: MigTable::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Reads GPU devices and their process tables from a vendor tool.
#[async_trait]
pub trait GpuResolver: Send + Sync {
    fn vendor(&self) -> GpuVendor;

    /// Take one snapshot. A missing or failing tool yields an empty snapshot;
    /// only output that cannot be understood is an error.
    async fn snapshot(&self, ctx: &Context) -> Result<GpuSnapshot>;
}

/// Pick the GPU resolver once for this invocation.
pub async fn select(ctx: &Context, selection: GpuSelection) -> Option<Box<dyn GpuResolver>> {
    match selection {
        GpuSelection::Nvidia => Some(Box::new(NvidiaGpu)),
        GpuSelection::Intel => Some(Box::new(IntelXpu::new())),
        GpuSelection::None => None,
        GpuSelection::Auto => detect(ctx).await,
    }
}

async fn detect(ctx: &Context) -> Option<Box<dyn GpuResolver>> {
    if tool_exists(ctx.runner.as_ref(), nvidia::NVIDIA_SMI).await {
        debug!("Using NVIDIA GPU resolver");
        return Some(Box::new(NvidiaGpu));
    }
    if tool_exists(ctx.runner.as_ref(), intel::XPUMCLI).await {
        debug!("Using Intel XPU resolver");
        return Some(Box::new(IntelXpu::new()));
    }
    debug!("No GPU tooling found");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{context, MockInspector, MockRunner};

    #[tokio::test]
    async fn detect_prefers_nvidia() {
        let runner = MockRunner::new()
            .reply("which nvidia-smi", "/usr/bin/nvidia-smi\n")
            .reply("which xpumcli", "/usr/bin/xpumcli\n");
        let ctx = context(runner, MockInspector::new(), "c1");
        let resolver = select(&ctx, GpuSelection::Auto).await.unwrap();
        assert_eq!(resolver.vendor(), GpuVendor::Nvidia);
    }

    #[tokio::test]
    async fn detect_falls_back_to_intel() {
        let runner = MockRunner::new().reply("which xpumcli", "/usr/bin/xpumcli\n");
        let ctx = context(runner, MockInspector::new(), "c1");
        let resolver = select(&ctx, GpuSelection::Auto).await.unwrap();
        assert_eq!(resolver.vendor(), GpuVendor::Intel);
    }

    #[tokio::test]
    async fn no_tools_no_resolver() {
        let ctx = context(MockRunner::new(), MockInspector::new(), "c1");
        assert!(select(&ctx, GpuSelection::Auto).await.is_none());
        assert!(select(&ctx, GpuSelection::None).await.is_none());
    }

    #[test]
    fn utilization_display_keeps_sentinel() {
        assert_eq!(GpuUtilization::NotApplicable.to_string(), "[N/A]");
        assert_eq!(GpuUtilization::Percent(37.0).to_string(), "37");
    }
}
