use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use crate::context::Context;
use crate::gpu::{GpuDevice, GpuProcessUsage, GpuResolver, GpuSnapshot, GpuUtilization, GpuVendor};
use crate::utils::command::{argv, CommandRunner, Privilege};
use crate::utils::errors::{MonitoringError, Result};
use crate::utils::units::{bytes_to_mib, round_to};

pub const XPUMCLI: &str = "xpumcli";

const GPU_UTILIZATION: &str = "XPUM_STATS_GPU_UTILIZATION";
const MEMORY_USED: &str = "XPUM_STATS_MEMORY_USED";

/// A JSON field that xpumcli prints as a number or a numeric string,
/// depending on the driver version.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Numeric::Number(value) => Ok(*value),
            Numeric::Text(text) => text
                .split_whitespace()
                .next()
                .and_then(|token| token.parse().ok())
                .ok_or_else(|| MonitoringError::Parse(format!("xpumcli number `{text}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Metric {
    pub metrics_type: String,
    #[serde(default)]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TileStats {
    #[serde(default)]
    pub tile_id: Option<Numeric>,
    #[serde(default)]
    pub data_list: Vec<Metric>,
}

/// `xpumcli stats -d <n> -j`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct XpuStats {
    #[serde(default)]
    pub device_level: Vec<Metric>,
    #[serde(default)]
    pub tile_level: Option<Vec<TileStats>>,
}

impl XpuStats {
    /// Metric lists per tile; a device without tiles counts as one tile.
    fn tiles(&self) -> Vec<&[Metric]> {
        match &self.tile_level {
            Some(tiles) if !tiles.is_empty() => tiles.iter().map(|t| t.data_list.as_slice()).collect(),
            _ => vec![self.device_level.as_slice()],
        }
    }

    fn sum(&self, metric: &str) -> f64 {
        self.tiles()
            .into_iter()
            .flatten()
            .filter(|m| m.metrics_type == metric)
            .map(|m| m.value)
            .sum()
    }

    /// Utilization averaged over tiles, to one decimal.
    pub fn utilization(&self) -> f64 {
        round_to(self.sum(GPU_UTILIZATION) / self.tiles().len() as f64, 1)
    }

    /// Memory used across all tiles, in whole MiB.
    pub fn memory_used_mib(&self) -> f64 {
        self.sum(MEMORY_USED).trunc()
    }
}

/// `xpumcli discovery -d <n> -j`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct XpuDiscovery {
    pub uuid: String,
    #[serde(default)]
    pub memory_physical_size_byte: Option<Numeric>,
    /// MiB; older drivers only print this one.
    #[serde(default)]
    pub memory_physical_size: Option<Numeric>,
}

impl XpuDiscovery {
    /// Physical memory in whole MiB.
    pub fn memory_total_mib(&self) -> Result<f64> {
        let mib = match (&self.memory_physical_size_byte, &self.memory_physical_size) {
            (Some(bytes), _) => bytes_to_mib(bytes.as_f64()?),
            (None, Some(mib)) => mib.as_f64()?,
            (None, None) => {
                return Err(MonitoringError::Parse(format!(
                    "device {} reports no memory size",
                    self.uuid
                )));
            }
        };
        Ok(mib.trunc())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct XpuProcess {
    pub process_id: u32,
    #[serde(default)]
    pub process_name: String,
}

/// `xpumcli ps -d <n> -j`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct XpuProcesses {
    #[serde(default)]
    pub device_util_by_proc_list: Vec<XpuProcess>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    device_list: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XpuDevice {
    pub index: u32,
    pub stats: XpuStats,
    pub discovery: XpuDiscovery,
    pub processes: XpuProcesses,
}

/// Everything xpumcli reports for the devices on this host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XpuDump {
    pub devices: Vec<XpuDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum XpuQuery {
    Stats,
    Discovery,
    Ps,
}

impl XpuQuery {
    fn argv(self, index: usize) -> Vec<String> {
        let sub = match self {
            XpuQuery::Stats => "stats",
            XpuQuery::Discovery => "discovery",
            XpuQuery::Ps => "ps",
        };
        argv([XPUMCLI.to_string(), sub.to_string(), "-d".to_string(), index.to_string(), "-j".to_string()])
    }
}

impl XpuDump {
    /// Run the discovery listing, then the three per-device queries for every
    /// device concurrently. A missing tool yields an empty dump.
    pub async fn collect(runner: Arc<dyn CommandRunner>) -> Result<XpuDump> {
        let listing = runner.run(&argv([XPUMCLI, "discovery", "-j"]), Privilege::Inherit).await;
        if !listing.has_output() {
            debug!("xpumcli discovery failed: {}", listing.stderr.trim());
            return Ok(XpuDump::default());
        }
        let count = serde_json::from_str::<DeviceList>(listing.stdout.trim())?.device_list.len();

        let mut tasks = JoinSet::new();
        for index in 0..count {
            for query in [XpuQuery::Stats, XpuQuery::Discovery, XpuQuery::Ps] {
                let runner = Arc::clone(&runner);
                tasks.spawn(async move {
                    let out = runner.run(&query.argv(index), Privilege::Root).await;
                    (index, query, out)
                });
            }
        }

        let mut outputs = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, query, out) = joined.map_err(|err| MonitoringError::Other(err.to_string()))?;
            if !out.has_output() || !out.stderr.trim().is_empty() {
                warn!("xpumcli {query:?} for device {index} failed: {}", out.stderr.trim());
                continue;
            }
            outputs.insert((index, query), out.stdout);
        }

        let mut devices = Vec::with_capacity(count);
        for index in 0..count {
            let (Some(stats), Some(discovery), Some(ps)) = (
                outputs.get(&(index, XpuQuery::Stats)),
                outputs.get(&(index, XpuQuery::Discovery)),
                outputs.get(&(index, XpuQuery::Ps)),
            ) else {
                continue;
            };
            devices.push(XpuDevice {
                index: index as u32,
                stats: serde_json::from_str(stats.trim())?,
                discovery: serde_json::from_str(discovery.trim())?,
                processes: serde_json::from_str(ps.trim())?,
            });
        }
        Ok(XpuDump { devices })
    }

    /// Device and per-process tables. Intel reports no per-process VRAM, so
    /// every process on a device is charged the device-wide figure.
    pub fn snapshot(&self) -> Result<GpuSnapshot> {
        let mut devices = HashMap::new();
        let mut processes: HashMap<u32, Vec<GpuProcessUsage>> = HashMap::new();
        for device in &self.devices {
            let uuid = device.discovery.uuid.clone();
            let memory_used = device.stats.memory_used_mib();
            devices.insert(
                uuid.clone(),
                GpuDevice {
                    index: device.index,
                    uuid: uuid.clone(),
                    total_vram_mib: device.discovery.memory_total_mib()?,
                    utilization: GpuUtilization::Percent(device.stats.utilization()),
                    partitions: Vec::new(),
                },
            );
            for process in &device.processes.device_util_by_proc_list {
                processes.entry(process.process_id).or_default().push(GpuProcessUsage {
                    gpu_uuid: uuid.clone(),
                    vram_used_mib: memory_used,
                });
            }
        }
        Ok(GpuSnapshot {
            vendor: GpuVendor::Intel,
            devices,
            processes,
            mig: Default::default(),
        })
    }
}

/// Intel XPUs through xpumcli. The dump is collected at most once per
/// resolver and reused by every later snapshot.
#[derive(Default)]
pub struct IntelXpu {
    dump: OnceCell<XpuDump>,
}

impl IntelXpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dump(&self, ctx: &Context) -> Result<&XpuDump> {
        self.dump
            .get_or_try_init(|| XpuDump::collect(Arc::clone(&ctx.runner)))
            .await
    }
}

#[async_trait]
impl GpuResolver for IntelXpu {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Intel
    }

    async fn snapshot(&self, ctx: &Context) -> Result<GpuSnapshot> {
        self.dump(ctx).await?.snapshot()
    }
}
