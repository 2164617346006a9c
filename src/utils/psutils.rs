use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use crate::utils::errors::{MonitoringError, Result};

/// CPU and resident memory of one process at the last refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessStats {
    /// Percent of one core over the interval between the last two refreshes.
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

/// Read access to the OS process table.
///
/// CPU utilization is a rate: the first `refresh` of a pid only primes its
/// counters, the value read after the second refresh is the real one.
pub trait ProcessInspector: Send + Sync {
    /// Re-read counters for `pids`, forgetting the ones that have exited.
    fn refresh(&mut self, pids: &[u32]);

    /// Stats as of the last refresh, `NoSuchProcess` when the pid is gone.
    fn stats(&self, pid: u32) -> Result<ProcessStats>;

    fn exists(&mut self, pid: u32) -> bool;

    /// Children of `pid` (all descendants when `recursive`), or `None` if
    /// `pid` itself does not exist.
    fn children(&mut self, pid: u32, recursive: bool) -> Option<Vec<u32>>;
}

/// `ProcessInspector` backed by sysinfo.
///
/// CPU percent is derived from the accumulated CPU time of each pid between
/// two refreshes, so it holds for sample intervals shorter than sysinfo's own
/// minimum update interval.
pub struct SysinfoInspector {
    system: System,
    /// Accumulated CPU milliseconds and the wall clock at the last refresh.
    counters: HashMap<u32, (u64, Instant)>,
    cpu_percent: HashMap<u32, f64>,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            counters: HashMap::new(),
            cpu_percent: HashMap::new(),
        }
    }

    fn refresh_table(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn refresh(&mut self, pids: &[u32]) {
        let pids: Vec<Pid> = pids.iter().map(|&pid| Pid::from_u32(pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let now = Instant::now();
        for pid in pids {
            let key = pid.as_u32();
            let Some(process) = self.system.process(pid) else {
                self.counters.remove(&key);
                self.cpu_percent.remove(&key);
                continue;
            };
            let cpu_ms = process.accumulated_cpu_time();
            if let Some((last_ms, last_at)) = self.counters.insert(key, (cpu_ms, now)) {
                let wall_ms = now.duration_since(last_at).as_secs_f64() * 1000.0;
                if wall_ms > 0.0 {
                    let busy_ms = cpu_ms.saturating_sub(last_ms) as f64;
                    self.cpu_percent.insert(key, busy_ms * 100.0 / wall_ms);
                }
            }
        }
    }

    fn stats(&self, pid: u32) -> Result<ProcessStats> {
        self.system
            .process(Pid::from_u32(pid))
            .map(|process| ProcessStats {
                cpu_percent: self.cpu_percent.get(&pid).copied().unwrap_or(0.0),
                rss_bytes: process.memory(),
            })
            .ok_or(MonitoringError::NoSuchProcess(pid))
    }

    fn exists(&mut self, pid: u32) -> bool {
        let target = [Pid::from_u32(pid)];
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&target),
            true,
            ProcessRefreshKind::nothing(),
        );
        self.system.process(target[0]).is_some()
    }

    fn children(&mut self, pid: u32, recursive: bool) -> Option<Vec<u32>> {
        self.refresh_table();
        if self.system.process(Pid::from_u32(pid)).is_none() {
            return None;
        }
        let parents = self
            .system
            .processes()
            .iter()
            .filter_map(|(child, process)| {
                process.parent().map(|parent| (parent.as_u32(), child.as_u32()))
            });
        Some(descendants(pid, parents, recursive))
    }
}

/// Walk a parent→child relation starting at `root`. The result is sorted and
/// never contains `root`.
pub fn descendants<I>(root: u32, edges: I, recursive: bool) -> Vec<u32>
where
    I: IntoIterator<Item = (u32, u32)>,
{
    let mut by_parent: HashMap<u32, Vec<u32>> = HashMap::new();
    for (parent, child) in edges {
        by_parent.entry(parent).or_default().push(child);
    }

    let mut found = BTreeSet::new();
    let mut pending = vec![root];
    while let Some(current) = pending.pop() {
        for &child in by_parent.get(&current).into_iter().flatten() {
            if child != root && found.insert(child) && recursive {
                pending.push(child);
            }
        }
    }
    found.into_iter().collect()
}

/// The session leader plus every descendant, or empty when the leader is gone.
pub fn session_pids(inspector: &mut dyn ProcessInspector, sid: u32) -> Vec<u32> {
    match inspector.children(sid, true) {
        Some(mut pids) => {
            pids.push(sid);
            pids
        }
        None => Vec::new(),
    }
}

/// Parse a PID token from CLI output. Zero, negative and garbage values are
/// rejected.
pub fn parse_pid(token: &str) -> Option<u32> {
    token.trim().parse::<u32>().ok().filter(|&pid| pid > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockInspector;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn descendants_follow_the_tree() {
        let edges = vec![(1, 10), (10, 11), (11, 12), (1, 20), (30, 31)];
        assert_eq!(descendants(1, edges.clone(), true), vec![10, 11, 12, 20]);
        assert_eq!(descendants(1, edges, false), vec![10, 20]);
    }

    #[test]
    fn descendants_survive_cycles() {
        let edges = vec![(1, 2), (2, 3), (3, 2)];
        assert_eq!(descendants(1, edges, true), vec![2, 3]);
    }

    #[test]
    fn session_includes_leader() {
        let mut inspector = MockInspector::new()
            .with_process(100, None, 0.0, 0)
            .with_process(101, Some(100), 0.0, 0)
            .with_process(102, Some(101), 0.0, 0);
        let mut pids = session_pids(&mut inspector, 100);
        pids.sort();
        assert_eq!(pids, vec![100, 101, 102]);
    }

    #[test]
    fn session_of_vanished_leader_is_empty() {
        let mut inspector = MockInspector::new();
        assert!(session_pids(&mut inspector, 4242).is_empty());
    }

    #[test]
    fn parse_pid_rejects_garbage() {
        assert_eq!(parse_pid(" 5000 "), Some(5000));
        assert_eq!(parse_pid("-1"), None);
        assert_eq!(parse_pid("0"), None);
        assert_eq!(parse_pid("abc"), None);
    }

    #[test]
    fn sysinfo_sees_own_process() {
        let mut inspector = SysinfoInspector::new();
        let me = std::process::id();
        assert!(inspector.exists(me));
        inspector.refresh(&[me]);
        assert!(inspector.stats(me).is_ok());
    }

    #[test]
    fn sysinfo_cpu_tracks_a_busy_thread() {
        let stop = Arc::new(AtomicBool::new(false));
        let spinner = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            })
        };
        let mut inspector = SysinfoInspector::new();
        let me = std::process::id();
        inspector.refresh(&[me]);
        assert_eq!(inspector.stats(me).unwrap().cpu_percent, 0.0);
        std::thread::sleep(Duration::from_millis(100));
        inspector.refresh(&[me]);
        let cpu = inspector.stats(me).unwrap().cpu_percent;
        stop.store(true, Ordering::Relaxed);
        spinner.join().unwrap();
        assert!(cpu > 20.0, "busy thread measured at {cpu}%");
    }
}
