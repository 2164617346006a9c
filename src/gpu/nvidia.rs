use async_trait::async_trait;
use csv::{ReaderBuilder, Trim};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use crate::context::Context;
use crate::gpu::mig::{parse_mig_xml, MigTable};
use crate::gpu::{GpuDevice, GpuProcessUsage, GpuResolver, GpuSnapshot, GpuUtilization, GpuVendor, NOT_APPLICABLE};
use crate::utils::command::{argv, Privilege};
use crate::utils::errors::{MonitoringError, Result};
use crate::utils::psutils::parse_pid;

pub const NVIDIA_SMI: &str = "nvidia-smi";

const QUERY_GPU: [&str; 3] = [
    NVIDIA_SMI,
    "--query-gpu=index,uuid,memory.total,utilization.gpu",
    "--format=csv,noheader,nounits",
];
const QUERY_COMPUTE_APPS: [&str; 3] = [
    NVIDIA_SMI,
    "--query-compute-apps=gpu_uuid,pid,used_memory",
    "--format=csv,noheader,nounits",
];
const QUERY_XML: [&str; 3] = [NVIDIA_SMI, "-q", "-x"];

#[derive(Debug, Deserialize)]
struct DeviceRow {
    index: u32,
    uuid: String,
    memory_total: f64,
    utilization: String,
}

#[derive(Debug, Deserialize)]
struct ProcessRow {
    gpu_uuid: String,
    pid: String,
    used_memory: String,
}

/// NVIDIA GPUs through `nvidia-smi` CSV queries, plus the XML dump when any
/// device is in MIG mode.
pub struct NvidiaGpu;

#[async_trait]
impl GpuResolver for NvidiaGpu {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Nvidia
    }

    async fn snapshot(&self, ctx: &Context) -> Result<GpuSnapshot> {
        let devices_out = ctx.runner.run(&argv(QUERY_GPU), Privilege::Inherit).await;
        let apps_out = ctx.runner.run(&argv(QUERY_COMPUTE_APPS), Privilege::Inherit).await;
        if !devices_out.success() || !apps_out.has_output() {
            debug!(
                "nvidia-smi gave no device or process table: {}{}",
                devices_out.stderr.trim(),
                apps_out.stderr.trim()
            );
            return Ok(GpuSnapshot::empty(GpuVendor::Nvidia));
        }

        let mut devices = parse_devices(&devices_out.stdout)?;
        let processes = parse_processes(&apps_out.stdout, &devices)?;

        let mig_active = devices
            .values()
            .any(|device| device.utilization == GpuUtilization::NotApplicable);
        let mig = if mig_active {
            mig_table(ctx).await?
        } else {
            MigTable::default()
        };
        for device in devices.values_mut() {
            if let Some(partitions) = mig.partitions.get(&device.index) {
                device.partitions = partitions.clone();
            }
        }

        Ok(GpuSnapshot {
            vendor: GpuVendor::Nvidia,
            devices,
            processes,
            mig,
        })
    }
}

async fn mig_table(ctx: &Context) -> Result<MigTable> {
    let out = ctx.runner.run(&argv(QUERY_XML), Privilege::Inherit).await;
    if !out.has_output() {
        warn!("Get GPU detail failed: {}, command is: {}", out.stderr.trim(), QUERY_XML.join(" "));
        return Ok(MigTable::default());
    }
    parse_mig_xml(&out.stdout)
}

fn csv_reader(text: &str) -> csv::Reader<&[u8]> {
    ReaderBuilder::new()
        .has_headers(false)
        .trim(Trim::All)
        .from_reader(text.trim().as_bytes())
}

/// Parse `--query-gpu` rows into devices keyed by UUID.
pub fn parse_devices(text: &str) -> Result<HashMap<String, GpuDevice>> {
    let mut devices = HashMap::new();
    for row in csv_reader(text).deserialize::<DeviceRow>() {
        let row = row?;
        // A card that cannot report utilization drops out alone.
        let utilization = match parse_utilization(&row.utilization) {
            Ok(utilization) => utilization,
            Err(err) => {
                warn!("Skipping GPU {} ({}): {err}", row.index, row.uuid);
                continue;
            }
        };
        devices.insert(
            row.uuid.clone(),
            GpuDevice {
                index: row.index,
                uuid: row.uuid,
                total_vram_mib: row.memory_total,
                utilization,
                partitions: Vec::new(),
            },
        );
    }
    Ok(devices)
}

/// Parse `--query-compute-apps` rows into per-pid VRAM usage, ignoring rows
/// for GPUs missing from the device table.
pub fn parse_processes(
    text: &str,
    devices: &HashMap<String, GpuDevice>,
) -> Result<HashMap<u32, Vec<GpuProcessUsage>>> {
    let mut processes: HashMap<u32, Vec<GpuProcessUsage>> = HashMap::new();
    for row in csv_reader(text).deserialize::<ProcessRow>() {
        let row = row?;
        if !devices.contains_key(&row.gpu_uuid) {
            continue;
        }
        let Some(pid) = parse_pid(&row.pid) else {
            warn!("Skipping GPU process with pid `{}`", row.pid);
            continue;
        };
        // MIG devices report [N/A] here; their usage comes from the XML dump.
        let vram_used_mib = row.used_memory.parse().unwrap_or(0.0);
        processes.entry(pid).or_default().push(GpuProcessUsage {
            gpu_uuid: row.gpu_uuid,
            vram_used_mib,
        });
    }
    Ok(processes)
}

pub fn parse_utilization(value: &str) -> Result<GpuUtilization> {
    if value == NOT_APPLICABLE {
        return Ok(GpuUtilization::NotApplicable);
    }
    value
        .parse()
        .map(GpuUtilization::Percent)
        .map_err(|_| MonitoringError::Parse(format!("GPU utilization `{value}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mig::tests::MIG_XML;
    use crate::testutil::{context, MockInspector, MockRunner};

    const DEVICES: &str = "0, GPU-aaa, 16384, 37\n1, GPU-bbb, 16384, 0\n";
    const APPS: &str = "GPU-aaa, 5000, 2048\nGPU-bbb, 5000, 1024\nGPU-aaa, 5001, 512\nGPU-zzz, 9, 1\n";
    const MIG_DEVICES: &str = "0, GPU-mig, 81920, [N/A]\n1, GPU-bbb, 16384, 12\n";
    const MIG_APPS: &str = "GPU-mig, 5000, [N/A]\nGPU-bbb, 8000, 100\n";

    fn runner(devices: &str, apps: &str) -> MockRunner {
        MockRunner::new()
            .reply(&QUERY_GPU.join(" "), devices)
            .reply(&QUERY_COMPUTE_APPS.join(" "), apps)
    }

    #[test]
    fn utilization_sentinel_is_preserved() {
        assert_eq!(parse_utilization("[N/A]").unwrap(), GpuUtilization::NotApplicable);
        assert_eq!(parse_utilization("37").unwrap(), GpuUtilization::Percent(37.0));
        assert!(parse_utilization("lots").is_err());
    }

    #[tokio::test]
    async fn snapshot_joins_devices_and_processes() {
        let ctx = context(runner(DEVICES, APPS), MockInspector::new(), "c1");
        let snapshot = NvidiaGpu.snapshot(&ctx).await.unwrap();
        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(snapshot.devices["GPU-aaa"].index, 0);
        assert_eq!(snapshot.devices["GPU-aaa"].total_vram_mib, 16384.0);
        assert_eq!(snapshot.processes[&5000].len(), 2);
        assert_eq!(snapshot.processes[&5001][0].vram_used_mib, 512.0);
        assert!(!snapshot.processes.contains_key(&9));
        assert_eq!(snapshot.mig, MigTable::default());
    }

    #[tokio::test]
    async fn mig_dump_only_when_needed() {
        let runner = runner(MIG_DEVICES, MIG_APPS).reply(&QUERY_XML.join(" "), MIG_XML);
        let ctx = context(runner, MockInspector::new(), "c1");
        let snapshot = NvidiaGpu.snapshot(&ctx).await.unwrap();
        assert_eq!(snapshot.devices["GPU-mig"].utilization, GpuUtilization::NotApplicable);
        assert_eq!(snapshot.devices["GPU-mig"].partitions.len(), 2);
        assert!(snapshot.devices["GPU-bbb"].partitions.is_empty());
        assert_eq!(snapshot.processes[&5000][0].vram_used_mib, 0.0);
        assert!(snapshot.mig.usage(0, 5000).is_some());
    }

    #[tokio::test]
    async fn missing_tool_is_empty_snapshot() {
        let ctx = context(MockRunner::new(), MockInspector::new(), "c1");
        let snapshot = NvidiaGpu.snapshot(&ctx).await.unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.processes.is_empty());
    }

    #[tokio::test]
    async fn no_compute_apps_is_empty_snapshot() {
        let ctx = context(runner(DEVICES, ""), MockInspector::new(), "c1");
        assert!(NvidiaGpu.snapshot(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_utilization_skips_only_that_gpu() {
        let devices = "0, GPU-aaa, 16384, 37\n1, GPU-bbb, 16384, [Not Supported]\n";
        let ctx = context(runner(devices, APPS), MockInspector::new(), "c1");
        let snapshot = NvidiaGpu.snapshot(&ctx).await.unwrap();
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices["GPU-aaa"].utilization, GpuUtilization::Percent(37.0));
        assert_eq!(snapshot.processes[&5000].len(), 1);
        assert_eq!(snapshot.processes[&5000][0].gpu_uuid, "GPU-aaa");
        assert!(snapshot.processes.contains_key(&5001));
    }

    #[tokio::test]
    async fn garbled_device_table_is_an_error() {
        let ctx = context(runner("0, GPU-aaa\n", APPS), MockInspector::new(), "c1");
        assert!(NvidiaGpu.snapshot(&ctx).await.is_err());
    }
}
