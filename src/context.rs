use std::sync::Arc;
use sysinfo::System;
use crate::config::MonitorConfig;
use crate::utils::command::{CommandRunner, SystemCommandRunner};
use crate::utils::psutils::{ProcessInspector, SysinfoInspector};

/// Everything one plugin invocation needs from the outside world.
///
/// Built once in `main` and passed by reference to every scheduler adapter,
/// GPU resolver and the aggregator; nothing outlives the invocation.
pub struct Context {
    pub runner: Arc<dyn CommandRunner>,
    pub processes: Box<dyn ProcessInspector>,
    /// Name this node goes by in scheduler host lists.
    pub hostname: String,
    pub verbose: bool,
}

impl Context {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        processes: Box<dyn ProcessInspector>,
        hostname: impl Into<String>,
        verbose: bool,
    ) -> Self {
        Self {
            runner,
            processes,
            hostname: hostname.into(),
            verbose,
        }
    }

    /// Context backed by the real host: tokio subprocesses and sysinfo.
    pub fn from_config(config: &MonitorConfig) -> Self {
        let hostname = config
            .hostname
            .clone()
            .or_else(System::host_name)
            .unwrap_or_else(|| "localhost".to_string());
        Self::new(
            Arc::new(SystemCommandRunner),
            Box::new(SysinfoInspector::new()),
            hostname,
            config.verbose,
        )
    }
}
