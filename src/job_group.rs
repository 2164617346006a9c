use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use crate::config::{JobState, MonitorConfig};
use crate::context::Context;
use crate::gpu::{mig, GpuResolver, GpuSnapshot, GpuUtilization};
use crate::plugin_data::PluginData;
use crate::schedulers::{JobId, JobPidMap, Scheduler};
use crate::utils::errors::{MonitoringError, Result};
use crate::utils::units::round_to;

/// CPU and memory of one process, attributed to one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    pub job_id: JobId,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

/// A job's share of one MIG partition.
#[derive(Debug, Clone, PartialEq)]
pub struct MigJobUsage {
    pub mig_device: u32,
    pub gpu_instance: u32,
    pub compute_instance: u32,
    pub util_percent: f64,
    pub mem_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpuUsage {
    /// Whole-device figures: the device's utilization (not scaled by the
    /// job's share) and the job's VRAM as a percentage of the device's.
    Device {
        utilization: f64,
        vram_used_mib: f64,
        vram_share_percent: f64,
    },
    /// MIG is enabled, usage per partition touched by the job.
    Mig { partitions: Vec<MigJobUsage> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuJobUsage {
    pub index: u32,
    pub uuid: String,
    pub usage: GpuUsage,
}

/// Everything reported for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUsageSummary {
    pub job_id: JobId,
    pub processes: Vec<ProcessSample>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    /// GPUs used by the job, ordered by device index.
    pub gpus: Vec<GpuJobUsage>,
}

impl JobUsageSummary {
    fn new(job_id: JobId, processes: Vec<ProcessSample>) -> Self {
        let cpu_percent = round_to(processes.iter().map(|p| p.cpu_percent).sum(), 1);
        let memory_bytes = processes.iter().map(|p| p.rss_bytes).sum();
        Self {
            job_id,
            processes,
            cpu_percent,
            memory_bytes,
            gpus: Vec::new(),
        }
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.processes.iter().map(|p| p.pid)
    }
}

/// Joins a scheduler's jobs with the process table and a GPU snapshot.
pub struct JobGroup {
    scheduler: Box<dyn Scheduler>,
    gpu: Option<Box<dyn GpuResolver>>,
    job_state: JobState,
    sample_interval: Duration,
}

impl JobGroup {
    pub fn new(
        scheduler: Box<dyn Scheduler>,
        gpu: Option<Box<dyn GpuResolver>>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            scheduler,
            gpu,
            job_state: config.job_state,
            sample_interval: config.sample_interval,
        }
    }

    /// One full pass: resolve jobs, sample processes, attribute GPUs and
    /// append everything to `plugin_data`.
    ///
    /// CPU and memory lines are emitted before GPU data is read, so a GPU
    /// failure still leaves them in place. Errors are returned only when
    /// `ctx.verbose` is set; otherwise they are logged and swallowed.
    pub async fn collect(&self, ctx: &mut Context, plugin_data: &mut PluginData) -> Result<()> {
        let jobs = match self.scheduler.job_pids(ctx, self.job_state).await {
            Ok(jobs) => jobs,
            Err(err) => return surface(ctx.verbose, err),
        };
        let mut summaries = self.sample(ctx, &jobs).await;
        plugin_data.emit_cpu_memory(&summaries);

        let Some(gpu) = &self.gpu else {
            return Ok(());
        };
        match gpu.snapshot(ctx).await {
            Ok(snapshot) if snapshot.is_empty() => {
                debug!("No {:?} GPU has running processes", gpu.vendor());
                Ok(())
            }
            Ok(snapshot) => {
                attribute_gpus(&mut summaries, &snapshot);
                plugin_data.emit_gpu_usage(&summaries);
                Ok(())
            }
            Err(err) => surface(ctx.verbose, err),
        }
    }

    /// Sample CPU and resident memory for every job's processes.
    ///
    /// Counters are primed, then read again after `sample_interval`. Pids
    /// that vanish along the way are skipped, as are pids already claimed
    /// by an earlier job.
    pub async fn sample(&self, ctx: &mut Context, jobs: &JobPidMap) -> Vec<JobUsageSummary> {
        let mut claimed = HashSet::new();
        let mut handles: BTreeMap<&JobId, Vec<u32>> = BTreeMap::new();
        for (job, pids) in jobs {
            let owned = handles.entry(job).or_default();
            for &pid in pids {
                if claimed.insert(pid) {
                    owned.push(pid);
                } else {
                    warn!("Process {pid} already belongs to another job, not counting it for job {job}");
                }
            }
        }

        let candidates: Vec<u32> = handles.values().flatten().copied().collect();
        ctx.processes.refresh(&candidates);
        for (job, pids) in handles.iter_mut() {
            pids.retain(|&pid| match ctx.processes.stats(pid) {
                Ok(_) => true,
                Err(err) => {
                    warn!("Process {pid} of job {job} does not exist: {err}");
                    false
                }
            });
        }

        tokio::time::sleep(self.sample_interval).await;

        let alive: Vec<u32> = handles.values().flatten().copied().collect();
        ctx.processes.refresh(&alive);
        handles
            .into_iter()
            .map(|(job, pids)| {
                let samples = pids
                    .into_iter()
                    .filter_map(|pid| match ctx.processes.stats(pid) {
                        Ok(stats) => Some(ProcessSample {
                            pid,
                            job_id: job.clone(),
                            cpu_percent: round_to(stats.cpu_percent, 1),
                            rss_bytes: stats.rss_bytes,
                        }),
                        Err(err) => {
                            warn!("Process {pid} of job {job} exited while sampling: {err}");
                            None
                        }
                    })
                    .collect();
                JobUsageSummary::new(job.clone(), samples)
            })
            .collect()
    }
}

/// Attach GPU usage to each summary from the snapshot's process table.
pub fn attribute_gpus(summaries: &mut [JobUsageSummary], snapshot: &GpuSnapshot) {
    for summary in summaries.iter_mut() {
        let mut vram: BTreeMap<&str, f64> = BTreeMap::new();
        let mut pids_on: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for pid in summary.pids() {
            for row in snapshot.processes.get(&pid).into_iter().flatten() {
                if !snapshot.devices.contains_key(&row.gpu_uuid) {
                    continue;
                }
                let used = vram.entry(row.gpu_uuid.as_str()).or_insert(0.0);
                if snapshot.vendor.sums_process_vram() {
                    *used += row.vram_used_mib;
                } else {
                    *used = row.vram_used_mib;
                }
                pids_on.entry(row.gpu_uuid.as_str()).or_default().push(pid);
            }
        }

        let mut gpus: Vec<GpuJobUsage> = vram
            .into_iter()
            .filter_map(|(uuid, vram_used_mib)| {
                let device = snapshot.devices.get(uuid)?;
                let usage = match device.utilization {
                    GpuUtilization::Percent(utilization) => {
                        let share = if device.total_vram_mib > 0.0 {
                            vram_used_mib / device.total_vram_mib * 100.0
                        } else {
                            0.0
                        };
                        let vram_share_percent = match snapshot.vendor.share_precision() {
                            Some(digits) => round_to(share, digits),
                            None => share,
                        };
                        GpuUsage::Device {
                            utilization,
                            vram_used_mib,
                            vram_share_percent,
                        }
                    }
                    GpuUtilization::NotApplicable => GpuUsage::Mig {
                        partitions: mig_usage(snapshot, device.index, &pids_on[uuid]),
                    },
                };
                Some(GpuJobUsage {
                    index: device.index,
                    uuid: device.uuid.clone(),
                    usage,
                })
            })
            .collect();
        gpus.sort_by_key(|gpu| gpu.index);
        summary.gpus = gpus;
    }
}

/// Distinct MIG partitions used by `pids` on GPU `index`. Nothing is reported
/// for a GPU whose partitions hold no SMs.
fn mig_usage(snapshot: &GpuSnapshot, index: u32, pids: &[u32]) -> Vec<MigJobUsage> {
    if snapshot.mig.sm_total(index) == 0 {
        debug!("GPU {index} is in MIG mode but has no SM allocation");
        return Vec::new();
    }
    // Pids sharing a partition add up their memory against its allotment.
    let mut partitions = BTreeMap::new();
    for &pid in pids {
        if let Some(usage) = snapshot.mig.usage(index, pid) {
            let (used, _) = partitions
                .entry((usage.mig_device, usage.gpu_instance, usage.compute_instance))
                .or_insert((0.0, usage));
            *used += usage.used_mib;
        }
    }
    partitions
        .into_values()
        .map(|(used, usage)| MigJobUsage {
            mig_device: usage.mig_device,
            gpu_instance: usage.gpu_instance,
            compute_instance: usage.compute_instance,
            util_percent: usage.util_percent,
            mem_percent: mig::percent(used, usage.partition_mib),
        })
        .collect()
}

/// Entry point for `--jobinfo`.
pub async fn run_job_info(
    ctx: &mut Context,
    scheduler: Box<dyn Scheduler>,
    gpu: Option<Box<dyn GpuResolver>>,
    config: &MonitorConfig,
    plugin_data: &mut PluginData,
) -> Result<()> {
    JobGroup::new(scheduler, gpu, config).collect(ctx, plugin_data).await
}

/// Entry point for `--pid`: report which job owns a process.
pub async fn run_pid_lookup(
    ctx: &mut Context,
    scheduler: &dyn Scheduler,
    pid: u32,
    plugin_data: &mut PluginData,
) -> Result<()> {
    if !ctx.processes.exists(pid) {
        plugin_data.add_output_data(format!("Process {pid} does not exist"));
        return Ok(());
    }
    match scheduler.job_id_for_pid(ctx, pid).await {
        Ok(Some(job)) => plugin_data.add_output_data(format!("Process {pid} belongs to Job {job}")),
        Ok(None) => plugin_data.add_output_data(format!("Process {pid} belongs to no job")),
        Err(err) => return surface(ctx.verbose, err),
    }
    Ok(())
}

fn surface(verbose: bool, err: MonitoringError) -> Result<()> {
    if verbose {
        Err(err)
    } else {
        debug!("Job usage collection stopped early: {err}");
        Ok(())
    }
}
