pub mod lsf;
pub mod pbs;
pub mod slurm;

use async_trait::async_trait;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use crate::config::{JobState, SchedulerKind};
use crate::context::Context;
use crate::utils::command::CommandOutput;
use crate::utils::errors::Result;

pub use lsf::Lsf;
pub use pbs::Pbs;
pub use slurm::Slurm;

pub type JobId = String;

/// Jobs with at least one process on this host, and those processes.
pub type JobPidMap = BTreeMap<JobId, BTreeSet<u32>>;

/// Resolves the jobs a batch system runs on the local host.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Map every job in `state` that runs on `ctx.hostname` to its local pids.
    /// A missing or failing scheduler CLI yields an empty map.
    async fn job_pids(&self, ctx: &mut Context, state: JobState) -> Result<JobPidMap>;

    /// Reverse lookup of the running job owning `pid`.
    async fn job_id_for_pid(&self, ctx: &mut Context, pid: u32) -> Result<Option<JobId>> {
        let jobs = self.job_pids(ctx, JobState::Running).await?;
        Ok(find_job(&jobs, pid))
    }
}

pub fn create(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::Slurm => Box::new(Slurm),
        SchedulerKind::Pbs => Box::new(Pbs),
        SchedulerKind::Lsf => Box::new(Lsf),
    }
}

pub fn find_job(jobs: &JobPidMap, pid: u32) -> Option<JobId> {
    jobs.iter()
        .find(|(_, pids)| pids.contains(&pid))
        .map(|(job, _)| job.clone())
}

/// Log why a scheduler command produced nothing usable.
fn report_unusable(command: &str, output: &CommandOutput) {
    warn!(
        "{} returned no usable output (status {:?}): {}{}",
        command,
        output.status,
        output.stdout.trim(),
        output.stderr.trim()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_job_scans_forward_mapping() {
        let mut jobs = JobPidMap::new();
        jobs.insert("7".to_string(), BTreeSet::from([10, 11]));
        jobs.insert("8".to_string(), BTreeSet::from([20]));
        assert_eq!(find_job(&jobs, 11), Some("7".to_string()));
        assert_eq!(find_job(&jobs, 20), Some("8".to_string()));
        assert_eq!(find_job(&jobs, 99), None);
    }

    #[test]
    fn create_matches_kind() {
        for kind in [SchedulerKind::Slurm, SchedulerKind::Pbs, SchedulerKind::Lsf] {
            assert_eq!(create(kind).kind(), kind);
        }
    }
}
