use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use crate::config::{JobState, SchedulerKind};
use crate::context::Context;
use crate::schedulers::{report_unusable, JobPidMap, Scheduler};
use crate::utils::command::{login_shell, Privilege};
use crate::utils::errors::Result;
use crate::utils::psutils::parse_pid;

/// `bjobs -UF` separates job records with a rule of this many dashes.
const RECORD_SEPARATOR_WIDTH: usize = 78;

static JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Job <([^<>]+)>,").expect("valid job pattern"));
static RESOURCE_USAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Resource usage collected.([^\n]*)").expect("valid usage pattern"));
static HOST_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^;]+);").expect("valid host pattern"));
static HOST_PIDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PIDs:([^;]*);").expect("valid pids pattern"));
static STARTED_ON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Started\s\d+\sTask\(s\)\son\sHost\(s\)\s([^,]*)").expect("valid start pattern")
});
static EXEC_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\d+\*)?([^>]+)>").expect("valid exec host pattern"));
static PIDS_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PIDs:[^;]+").expect("valid pids token pattern"));
static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid number pattern"));

/// LSF: scrape the long-format `bjobs` dump of every user's jobs.
pub struct Lsf;

impl Lsf {
    fn bjobs(state: JobState) -> String {
        let flag = match state {
            JobState::Running => "-r",
            JobState::Pending => "-p",
        };
        format!("bjobs -UF {flag} -u all")
    }
}

#[async_trait]
impl Scheduler for Lsf {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Lsf
    }

    async fn job_pids(&self, ctx: &mut Context, state: JobState) -> Result<JobPidMap> {
        let command = Self::bjobs(state);
        let out = ctx.runner.run(&login_shell(command.clone()), Privilege::RealUser).await;
        if !out.has_output() {
            report_unusable(&command, &out);
            return Ok(JobPidMap::new());
        }
        Ok(parse_bjobs(&out.stdout, &ctx.hostname))
    }
}

/// Split a `bjobs -UF` dump into records and collect each local job's pids.
pub fn parse_bjobs(output: &str, hostname: &str) -> JobPidMap {
    let separator = "-".repeat(RECORD_SEPARATOR_WIDTH);
    let mut jobs = JobPidMap::new();
    for record in output.trim().split(separator.as_str()) {
        let Some(job) = JOB_ID.captures(record.trim()).map(|c| c[1].to_string()) else {
            continue;
        };
        if let Some(pids) = record_pids(record, hostname) {
            jobs.insert(job, pids);
        }
    }
    jobs
}

/// Local pids of one job record, `None` when the job does not run here.
fn record_pids(record: &str, hostname: &str) -> Option<BTreeSet<u32>> {
    let usage = RESOURCE_USAGE
        .captures(record)
        .and_then(|c| c.get(1))
        .map_or("", |m| m.as_str());

    if usage.contains("HOST") {
        // Per-host blocks: `HOST: c1; MEM: 2 Mbytes; ... PIDs: 10 11 ;`
        return usage.split("HOST:").skip(1).find_map(|block| {
            let host = HOST_NAME.captures(block.trim())?.get(1)?.as_str().trim();
            if host != hostname {
                return None;
            }
            let pids = HOST_PIDS
                .captures(block)
                .and_then(|c| c.get(1))
                .map_or("", |m| m.as_str());
            Some(collect_pids(pids.split_whitespace()))
        });
    }

    let hosts = STARTED_ON.captures(record.trim())?.get(1)?.as_str();
    let runs_here = EXEC_HOST
        .captures_iter(hosts)
        .any(|c| c[1].trim().eq_ignore_ascii_case(hostname));
    if !runs_here {
        debug!("LSF job record does not run on {hostname}");
        return None;
    }
    let tokens = PIDS_TOKEN
        .find_iter(usage)
        .flat_map(|token| NUMBER.find_iter(token.as_str()).map(|m| m.as_str()));
    Some(collect_pids(tokens))
}

fn collect_pids<'a>(tokens: impl Iterator<Item = &'a str>) -> BTreeSet<u32> {
    tokens
        .filter_map(|token| {
            let pid = parse_pid(token);
            if pid.is_none() {
                warn!("Skipping malformed LSF pid `{token}`");
            }
            pid
        })
        .collect()
}
