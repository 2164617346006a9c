mod utils {
    pub mod command;
    pub mod errors;
    pub mod logger;
    pub mod psutils;
    pub mod units;
}

pub mod config;
pub mod context;
pub mod gpu;
pub mod job_group;
pub mod plugin_data;
pub mod schedulers;
#[cfg(test)]
mod testutil;

use clap::Parser;
use config::{GpuSelection, JobState, MonitorConfig, SchedulerKind};
use context::Context;
use log::{debug, error};
use plugin_data::{ExitStatus, PluginData};
use std::time::Duration;

/// Per-job CPU, memory and GPU usage on this node, as an Icinga check.
#[derive(Parser, Debug)]
#[command(name = "lico-check-jobs", version)]
struct Args {
    /// Surface failures instead of printing partial output
    #[arg(long)]
    verbose: bool,

    /// Report usage of the jobs running on this host
    #[arg(long)]
    jobinfo: bool,

    /// Report the job owning this process
    #[arg(long, value_name = "PID")]
    pid: Option<u32>,

    #[arg(long, value_enum)]
    scheduler: SchedulerKind,

    #[arg(long, value_enum, default_value_t = GpuSelection::Auto)]
    gpu: GpuSelection,

    #[arg(long, value_enum, default_value_t = JobState::Running)]
    states: JobState,

    /// Name of this node in the scheduler's host lists
    #[arg(long)]
    hostname: Option<String>,

    /// Pause between the two CPU samples
    #[arg(long, default_value_t = 20)]
    sample_interval_ms: u64,
}

impl Args {
    fn config(&self) -> MonitorConfig {
        MonitorConfig::new(self.scheduler)
            .with_gpu(self.gpu)
            .with_job_state(self.states)
            .with_hostname(self.hostname.clone())
            .with_sample_interval(Duration::from_millis(self.sample_interval_ms))
            .with_verbose(self.verbose)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    utils::logger::setup_logger(args.verbose);

    let config = args.config();
    let mut ctx = Context::from_config(&config);
    let mut plugin_data = PluginData::new();
    debug!("Checking jobs on {} with {:?}", ctx.hostname, config);

    let scheduler = schedulers::create(config.scheduler);
    debug!("Using {:?} scheduler", scheduler.kind());
    let result = if let Some(pid) = args.pid {
        job_group::run_pid_lookup(&mut ctx, scheduler.as_ref(), pid, &mut plugin_data).await
    } else if args.jobinfo {
        let gpu = gpu::select(&ctx, config.gpu).await;
        if let Some(resolver) = &gpu {
            debug!("Using {:?} GPU resolver", resolver.vendor());
        }
        job_group::run_job_info(&mut ctx, scheduler, gpu, &config, &mut plugin_data).await
    } else {
        Ok(())
    };

    if let Err(err) = result {
        error!("{err}");
        plugin_data.set_state(ExitStatus::Unknown);
    }
    plugin_data.exit()
}
