//! Scripted stand-ins for the command runner and the process table.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use crate::context::Context;
use crate::utils::command::{CommandOutput, CommandRunner, Privilege};
use crate::utils::errors::{MonitoringError, Result};
use crate::utils::psutils::{descendants, ProcessInspector, ProcessStats};

/// Replies with canned output keyed by the space-joined argv. Unknown
/// commands behave like a missing binary.
#[derive(Default)]
pub struct MockRunner {
    replies: HashMap<String, CommandOutput>,
    calls: Mutex<Vec<(String, Privilege)>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, command: &str, stdout: &str) -> Self {
        self.replies.insert(
            command.to_string(),
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                status: Some(0),
            },
        );
        self
    }

    pub fn fail(mut self, command: &str, code: i32, stderr: &str) -> Self {
        self.replies.insert(
            command.to_string(),
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                status: Some(code),
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<(String, Privilege)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, argv: &[String], privilege: Privilege) -> CommandOutput {
        let key = argv.join(" ");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((key.clone(), privilege));
        }
        self.replies
            .get(&key)
            .cloned()
            .unwrap_or_else(|| CommandOutput::spawn_failure(format!("{key}: not found")))
    }
}

#[derive(Debug, Clone)]
struct MockProcess {
    parent: Option<u32>,
    cpu_percent: f64,
    rss_bytes: u64,
}

/// A fixed process table. Pids registered with `vanish_after_prime` disappear
/// on their second refresh, mimicking a process exiting mid-sample.
#[derive(Default)]
pub struct MockInspector {
    table: HashMap<u32, MockProcess>,
    refreshed: HashSet<u32>,
    primed: HashSet<u32>,
    vanishing: HashSet<u32>,
}

impl MockInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(mut self, pid: u32, parent: Option<u32>, cpu_percent: f64, rss_bytes: u64) -> Self {
        self.table.insert(pid, MockProcess { parent, cpu_percent, rss_bytes });
        self
    }

    pub fn vanish_after_prime(mut self, pid: u32) -> Self {
        self.vanishing.insert(pid);
        self
    }
}

impl ProcessInspector for MockInspector {
    fn refresh(&mut self, pids: &[u32]) {
        for &pid in pids {
            if !self.primed.insert(pid) && self.vanishing.contains(&pid) {
                self.table.remove(&pid);
            }
            if self.table.contains_key(&pid) {
                self.refreshed.insert(pid);
            } else {
                self.refreshed.remove(&pid);
            }
        }
    }

    fn stats(&self, pid: u32) -> Result<ProcessStats> {
        match self.table.get(&pid) {
            Some(process) if self.refreshed.contains(&pid) => Ok(ProcessStats {
                cpu_percent: process.cpu_percent,
                rss_bytes: process.rss_bytes,
            }),
            _ => Err(MonitoringError::NoSuchProcess(pid)),
        }
    }

    fn exists(&mut self, pid: u32) -> bool {
        self.table.contains_key(&pid)
    }

    fn children(&mut self, pid: u32, recursive: bool) -> Option<Vec<u32>> {
        if !self.table.contains_key(&pid) {
            return None;
        }
        let edges = self
            .table
            .iter()
            .filter_map(|(&child, process)| process.parent.map(|parent| (parent, child)));
        Some(descendants(pid, edges, recursive))
    }
}

pub fn context(runner: MockRunner, inspector: MockInspector, hostname: &str) -> Context {
    Context::new(Arc::new(runner), Box::new(inspector), hostname, false)
}
