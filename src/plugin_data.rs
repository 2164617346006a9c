use std::process;
use crate::job_group::{GpuUsage, JobUsageSummary};

/// Icinga plugin states, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Ok => 0,
            ExitStatus::Warning => 1,
            ExitStatus::Critical => 2,
            ExitStatus::Unknown => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ExitStatus::Ok => "OK",
            ExitStatus::Warning => "Warning",
            ExitStatus::Critical => "Critical",
            ExitStatus::Unknown => "Unknown",
        }
    }

    pub fn exit(self) -> ! {
        process::exit(self.code())
    }
}

/// Output lines, perf-data tokens and the state of one plugin run.
#[derive(Debug, Default)]
pub struct PluginData {
    output_data: Vec<String>,
    perf_data: Vec<String>,
    state: Option<ExitStatus>,
}

impl PluginData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_output_data(&mut self, data: impl Into<String>) {
        self.output_data.push(data.into());
    }

    pub fn add_perf_data(&mut self, data: impl Into<String>) {
        self.perf_data.push(data.into());
    }

    pub fn output_data(&self) -> &[String] {
        &self.output_data
    }

    pub fn perf_data(&self) -> &[String] {
        &self.perf_data
    }

    /// Raise the state; a lower severity never replaces a higher one.
    pub fn set_state(&mut self, state: ExitStatus) {
        if state > self.state() {
            self.state = Some(state);
        }
    }

    pub fn state(&self) -> ExitStatus {
        self.state.unwrap_or(ExitStatus::Ok)
    }

    /// `[STATE] - lines | perf`, or `None` when there is nothing to say.
    pub fn plugin_output(&self) -> Option<String> {
        if self.output_data.is_empty() {
            return None;
        }
        Some(format!(
            "[{}] - {} | {}",
            self.state().label(),
            self.output_data.join(", "),
            self.perf_data.join(" ")
        ))
    }

    pub fn exit(&self) -> ! {
        if let Some(output) = self.plugin_output() {
            println!("{output}");
        }
        self.state().exit()
    }

    /// CPU and memory for every job.
    pub fn emit_cpu_memory(&mut self, summaries: &[JobUsageSummary]) {
        for summary in summaries {
            let id = &summary.job_id;
            self.add_output_data(format!("Job {id} CPU Utilization = {}%", summary.cpu_percent));
            self.add_perf_data(format!("job_{id}_cpu_util={}", summary.cpu_percent));
            self.add_output_data(format!("Used Memory = {}B", summary.memory_bytes));
            self.add_perf_data(format!("job_{id}_mem_used={}B", summary.memory_bytes));
        }
    }

    /// GPU lines for every job, device by device.
    pub fn emit_gpu_usage(&mut self, summaries: &[JobUsageSummary]) {
        for summary in summaries {
            let id = &summary.job_id;
            for gpu in &summary.gpus {
                let index = gpu.index;
                self.add_output_data(format!("Job {id} Usage on GPU Device gpu{index}"));
                match &gpu.usage {
                    GpuUsage::Device {
                        utilization,
                        vram_share_percent,
                        ..
                    } => {
                        self.add_perf_data(format!("job_{id}_gpu{index}_util={utilization}%"));
                        self.add_perf_data(format!(
                            "job_{id}_gpu{index}_mem_usage={vram_share_percent}%"
                        ));
                    }
                    GpuUsage::Mig { partitions } => {
                        for mig in partitions {
                            let prefix = format!(
                                "job_{id}_gpu{index}_{}_{}_{}",
                                mig.mig_device, mig.gpu_instance, mig.compute_instance
                            );
                            self.add_perf_data(format!("{prefix}_util={}%", mig.util_percent));
                            self.add_perf_data(format!("{prefix}_mem_usage={}%", mig.mem_percent));
                        }
                    }
                }
            }
        }
    }
}
