use clap::ValueEnum;
use std::time::Duration;

/// Job state filter handed to the scheduler CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum JobState {
    Running,
    Pending,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchedulerKind {
    Slurm,
    Pbs,
    Lsf,
}

/// How the GPU vendor is picked for this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GpuSelection {
    /// Try `nvidia-smi`, then `xpumcli`, once at startup.
    Auto,
    Nvidia,
    Intel,
    None,
}

/// Settings for one plugin invocation.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub scheduler: SchedulerKind,
    pub gpu: GpuSelection,
    pub job_state: JobState,
    /// Overrides the OS hostname when matching scheduler host lists.
    pub hostname: Option<String>,
    /// Pause between priming and reading CPU counters.
    pub sample_interval: Duration,
    /// Surface aggregation errors instead of emitting partial output.
    pub verbose: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::Slurm,
            gpu: GpuSelection::Auto,
            job_state: JobState::Running,
            hostname: None,
            sample_interval: Duration::from_millis(20),
            verbose: false,
        }
    }
}

impl MonitorConfig {
    pub fn new(scheduler: SchedulerKind) -> Self {
        Self {
            scheduler,
            ..Self::default()
        }
    }

    pub fn with_gpu(mut self, gpu: GpuSelection) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_job_state(mut self, job_state: JobState) -> Self {
        self.job_state = job_state;
        self
    }

    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn with_sample_interval(mut self, sample_interval: Duration) -> Self {
        self.sample_interval = sample_interval;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}
