//! Task control groups under the cpu,cpuacct hierarchy.
//!
//! Each task attempt is confined to `nmgroup_Task_<taskId>_<requeueCount>` so
//! the agent can enumerate and signal the full process tree. The hierarchy
//! root is injectable; tests point it at a scratch directory.

use gridagent_messages::ProcessStatistics;
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};
use tracing::debug;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/cpu,cpuacct";

/// Length of one cpuacct.stat tick in milliseconds (USER_HZ = 100).
const JIFFY_MS: u64 = 10;

/// True when the pid still exists (a zombie counts until it is reaped).
fn pid_alive(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Handle to the cgroup hierarchy the agent places task groups under.
#[derive(Clone, Debug)]
pub struct CgroupRoot {
    base: PathBuf,
}

impl CgroupRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn default_root() -> Self {
        Self::new(DEFAULT_CGROUP_ROOT)
    }

    pub fn group_name(task_id: i32, requeue_count: i32) -> String {
        format!("nmgroup_Task_{task_id}_{requeue_count}")
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        self.base.join(group)
    }

    pub fn create(&self, group: &str) -> io::Result<()> {
        fs::create_dir_all(self.group_dir(group))
    }

    /// Enrolls a pid into the group by appending it to `cgroup.procs`.
    pub fn add_pid(&self, group: &str, pid: u32) -> io::Result<()> {
        let mut procs = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.group_dir(group).join("cgroup.procs"))?;
        writeln!(procs, "{pid}")
    }

    /// Pids currently alive in the group. The kernel prunes exited pids from
    /// `cgroup.procs` itself; the liveness probe also covers scratch roots
    /// where nothing prunes the file.
    pub fn pids(&self, group: &str) -> Vec<i32> {
        let Ok(procs) = fs::read_to_string(self.group_dir(group).join("cgroup.procs")) else {
            return Vec::new();
        };
        let mut pids: Vec<i32> = procs
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .filter(|pid| pid_alive(*pid))
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    /// Snapshot of the group's resource accounting and surviving pids.
    pub fn statistics(&self, group: &str) -> ProcessStatistics {
        let mut stats = ProcessStatistics {
            process_ids: self.pids(group),
            ..Default::default()
        };

        if let Ok(cpuacct) = fs::read_to_string(self.group_dir(group).join("cpuacct.stat")) {
            for line in cpuacct.lines() {
                match line.split_once(' ') {
                    Some(("user", ticks)) => {
                        stats.user_time_ms = ticks.trim().parse::<u64>().unwrap_or(0) * JIFFY_MS
                    }
                    Some(("system", ticks)) => {
                        stats.kernel_time_ms = ticks.trim().parse::<u64>().unwrap_or(0) * JIFFY_MS
                    }
                    _ => {}
                }
            }
        }

        stats.working_set_kb = stats
            .process_ids
            .iter()
            .filter_map(|pid| resident_kb(*pid))
            .sum();
        stats
    }

    /// Removes the group directory. Fails silently while members remain;
    /// the next attempt after they exit succeeds.
    pub fn remove(&self, group: &str) {
        if let Err(error) = fs::remove_dir(self.group_dir(group)) {
            debug!(group, %error, "could not remove task cgroup");
        }
    }
}

/// Resident set size of one process in KiB, from /proc/<pid>/statm.
fn resident_kb(pid: i32) -> Option<u64> {
    let statm = fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4)
}
