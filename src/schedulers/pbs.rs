use async_trait::async_trait;
use itertools::Itertools;
use log::{debug, warn};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use crate::config::{JobState, SchedulerKind};
use crate::context::Context;
use crate::schedulers::{report_unusable, JobId, JobPidMap, Scheduler};
use crate::utils::command::{login_shell, Privilege};
use crate::utils::errors::{MonitoringError, Result};
use crate::utils::psutils::{parse_pid, session_pids};

const QSTAT: &str = "qstat -rftn";

static JOB_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\[\d*\])?)\.\S*").expect("valid job id pattern"));

/// PBS: find local jobs in `qstat`, their session ids via `printjob`, then
/// every process in each session.
pub struct Pbs;

#[async_trait]
impl Scheduler for Pbs {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Pbs
    }

    /// `qstat -r` only lists running jobs, so `state` is not consulted.
    async fn job_pids(&self, ctx: &mut Context, _state: JobState) -> Result<JobPidMap> {
        let qstat = ctx.runner.run(&login_shell(QSTAT), Privilege::RealUser).await;
        if !qstat.has_output() {
            report_unusable(QSTAT, &qstat);
            return Ok(JobPidMap::new());
        }

        let suffix = server_suffix(&qstat.stdout)?;
        let local_jobs: Vec<JobId> = job_hosts(&qstat.stdout)
            .into_iter()
            .filter(|(_, hosts)| hosts.contains(&ctx.hostname))
            .map(|(job, _)| job)
            .collect();
        if local_jobs.is_empty() {
            debug!("No PBS jobs on {}", ctx.hostname);
            return Ok(JobPidMap::new());
        }

        let printjob = format!("printjob -a {} | grep -E 'parentjob|sid'", local_jobs.iter().join(" "));
        let sessions_out = ctx.runner.run(&login_shell(printjob.clone()), Privilege::Root).await;
        if !sessions_out.has_output() {
            report_unusable(&printjob, &sessions_out);
            return Ok(JobPidMap::new());
        }

        let mut jobs = JobPidMap::new();
        for (job, sid) in job_sessions(&sessions_out.stdout, &suffix) {
            let pids = session_pids(ctx.processes.as_mut(), sid);
            if pids.is_empty() {
                warn!("Session {sid} of job {job} no longer exists");
                continue;
            }
            jobs.entry(job).or_default().extend(pids);
        }
        Ok(jobs)
    }
}

/// The server suffix shared by every job id, e.g. `.pbs1` for `3113.pbs1`,
/// taken from the first job row under the dashed header rule.
pub fn server_suffix(qstat: &str) -> Result<String> {
    qstat
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .nth(1)
        .and_then(|row| row.split_whitespace().next())
        .and_then(|id| id.find('.').map(|dot| id[dot..].to_string()))
        .ok_or_else(|| MonitoringError::Parse("qstat output has no job rows".to_string()))
}

/// Job id to the set of hosts it runs on. Each job row is followed by its
/// `host/slot+host/slot` exec line.
pub fn job_hosts(qstat: &str) -> BTreeMap<JobId, BTreeSet<String>> {
    let lines: Vec<&str> = qstat.lines().collect();
    lines
        .iter()
        .enumerate()
        .filter_map(|(index, line)| {
            let job = JOB_LINE.captures(line.trim_start())?.get(1)?.as_str().to_string();
            let hosts = lines
                .get(index + 1)?
                .trim()
                .split('+')
                .filter_map(|slot| slot.split('/').next())
                .filter(|host| !host.is_empty())
                .map(str::to_string)
                .collect();
            Some((job, hosts))
        })
        .collect()
}

/// `(job id, session id)` pairs from `printjob` output:
///
/// ```text
///     parentjobid:    3113.pbs1
///     sid:            12345
/// ```
pub fn job_sessions(printjob: &str, suffix: &str) -> Vec<(JobId, u32)> {
    let mut sessions = Vec::new();
    let mut current: Option<JobId> = None;
    for line in printjob.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("parentjobid:") {
            let value = value.trim();
            current = Some(value.strip_suffix(suffix).unwrap_or(value).to_string());
        } else if let Some(value) = line.strip_prefix("sid:") {
            let Some(job) = current.take() else { continue };
            match parse_pid(value) {
                Some(sid) => sessions.push((job, sid)),
                None => debug!("Job {job} has no session yet (sid `{}`)", value.trim()),
            }
        }
    }
    sessions
}
