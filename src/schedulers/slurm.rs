use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashSet;
use crate::config::{JobState, SchedulerKind};
use crate::context::Context;
use crate::schedulers::{find_job, report_unusable, JobId, JobPidMap, Scheduler};
use crate::utils::command::{argv, Privilege};
use crate::utils::errors::Result;
use crate::utils::psutils::parse_pid;

/// Slurm: intersect `squeue` for this node with `scontrol listpids`.
pub struct Slurm;

impl Slurm {
    fn squeue(hostname: &str, state: JobState) -> Vec<String> {
        argv([
            "squeue".to_string(),
            "-w".to_string(),
            hostname.to_string(),
            format!("--states={}", state.as_str()),
            "--Format=JOBID".to_string(),
            "--noheader".to_string(),
        ])
    }
}

#[async_trait]
impl Scheduler for Slurm {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    async fn job_pids(&self, ctx: &mut Context, state: JobState) -> Result<JobPidMap> {
        let jobs_out = ctx
            .runner
            .run(&Self::squeue(&ctx.hostname, state), Privilege::RealUser)
            .await;
        if !jobs_out.has_output() {
            report_unusable("squeue", &jobs_out);
            return Ok(JobPidMap::new());
        }
        let job_ids: HashSet<&str> = jobs_out.stdout.split_whitespace().collect();

        let pids_out = ctx
            .runner
            .run(&argv(["scontrol", "listpids"]), Privilege::RealUser)
            .await;
        if !pids_out.has_output() {
            report_unusable("scontrol listpids", &pids_out);
            return Ok(JobPidMap::new());
        }

        Ok(parse_listpids(&pids_out.stdout, &job_ids))
    }

    async fn job_id_for_pid(&self, ctx: &mut Context, pid: u32) -> Result<Option<JobId>> {
        let out = ctx
            .runner
            .run(&argv(["scontrol".to_string(), "pidinfo".to_string(), pid.to_string()]), Privilege::Inherit)
            .await;
        if let Some(job) = out.success().then(|| parse_pidinfo(&out.stdout)).flatten() {
            return Ok(Some(job));
        }
        debug!("scontrol pidinfo {pid} gave no job id: {}", out.stderr.trim());

        let jobs = self.job_pids(ctx, JobState::Running).await?;
        Ok(find_job(&jobs, pid))
    }
}

/// Parse `scontrol listpids`, keeping pairs whose job id is in `job_ids`.
///
/// ```text
/// PID      JOBID    STEPID   LOCALID GLOBALID
/// 5000     101      0        0       0
/// -1       101      extern   -       -
/// ```
pub fn parse_listpids(output: &str, job_ids: &HashSet<&str>) -> JobPidMap {
    let mut jobs = JobPidMap::new();
    for line in output.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(job)) = (fields.next(), fields.next()) else {
            continue;
        };
        if !job_ids.contains(job) {
            continue;
        }
        match parse_pid(pid) {
            Some(pid) => {
                jobs.entry(job.to_string()).or_default().insert(pid);
            }
            None => warn!("Skipping pid `{pid}` of job {job}"),
        }
    }
    jobs
}

/// Job id from `scontrol pidinfo`, which prints either
/// `Slurm job id 84058 ends at ...` or `Slurm JobId=84058 ...`.
pub fn parse_pidinfo(output: &str) -> Option<JobId> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    let job = match tokens.get(1) {
        Some(token) if token.starts_with("JobId") => token.rsplit('=').next(),
        Some(_) => tokens.get(3).copied(),
        None => None,
    }?;
    (!job.is_empty() && job.chars().all(|c| c.is_ascii_digit())).then(|| job.to_string())
}
