//! Supervision of one task child process.
//!
//! The child runs in its own process group and, when the hierarchy is
//! writable, inside a task-scoped cgroup, so termination can reach the whole
//! process tree. A spawned wait task reaps the child, harvests final
//! statistics and delivers the completion callback exactly once — including
//! on spawn failure, which is surfaced as a completion event with a
//! synthesized exit code.

use crate::cgroup::CgroupRoot;
use gridagent_messages::{ProcessStartInfo, ProcessStatistics};
use nix::{
    sched::{sched_setaffinity, CpuSet},
    sys::signal::{kill, killpg, Signal},
    unistd::{setpgid, Pid, User},
};
use std::{
    collections::VecDeque,
    fs::{self, File},
    future::Future,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};
use tokio::{io::AsyncReadExt, process::Command};
use tracing::{debug, info, warn};

/// Bytes of stdout retained for PeekTaskOutput.
const PEEK_WINDOW: usize = 4096;

/// Delay between SIGTERM and the SIGKILL escalation of a forced kill.
const KILL_ESCALATION_DELAY: Duration = Duration::from_millis(200);

/// A supervised task process.
pub struct Process {
    job_id: i32,
    task_id: i32,
    requeue_count: i32,
    /// None when the spawn itself failed.
    pid: Option<Pid>,
    group: String,
    cgroup: CgroupRoot,
    stdout_path: Option<PathBuf>,
    stdout_tail: Arc<StdMutex<VecDeque<u8>>>,
    reaped: Arc<AtomicBool>,
}

impl Process {
    /// Spawns the task child and its wait task. The completion callback is
    /// invoked exactly once, from the wait task on reap — or immediately,
    /// with a synthesized failure, when the spawn fails.
    pub fn launch<F, Fut>(
        job_id: i32,
        task_id: i32,
        requeue_count: i32,
        start_info: &ProcessStartInfo,
        user_name: &str,
        cgroup: CgroupRoot,
        on_exit: F,
    ) -> Arc<Self>
    where
        F: FnOnce(i32, String, ProcessStatistics) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let group = CgroupRoot::group_name(task_id, requeue_count);
        if let Err(error) = cgroup.create(&group) {
            warn!(
                job_id,
                task_id,
                %error,
                "failed to create task cgroup, relying on the process group"
            );
        }

        let stdout_path =
            (!start_info.std_out_file.is_empty()).then(|| PathBuf::from(&start_info.std_out_file));
        let stdout_tail = Arc::new(StdMutex::new(VecDeque::new()));
        let reaped = Arc::new(AtomicBool::new(false));

        let mut child = match spawn_child(start_info, user_name, stdout_path.as_deref()) {
            Ok(child) => child,
            Err(error) => {
                warn!(job_id, task_id, requeue_count, %error, "failed to start task process");
                reaped.store(true, Ordering::SeqCst);
                let message = format!("failed to start process: {error}");
                tokio::spawn(async move {
                    on_exit(-1, message, ProcessStatistics::default()).await;
                });
                return Arc::new(Self {
                    job_id,
                    task_id,
                    requeue_count,
                    pid: None,
                    group,
                    cgroup,
                    stdout_path,
                    stdout_tail,
                    reaped,
                });
            }
        };

        let pid = child.id();
        info!(job_id, task_id, requeue_count, pid, "task process started");
        if let Some(pid) = pid {
            if let Err(error) = cgroup.add_pid(&group, pid) {
                warn!(job_id, task_id, pid, %error, "could not enroll task process in its cgroup");
            }
        }

        if stdout_path.is_none() {
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(tail_stdout(stdout, Arc::clone(&stdout_tail)));
            }
        }

        let process = Arc::new(Self {
            job_id,
            task_id,
            requeue_count,
            pid: pid.map(|pid| Pid::from_raw(pid as i32)),
            group,
            cgroup,
            stdout_path,
            stdout_tail,
            reaped,
        });

        tokio::spawn({
            let process = Arc::clone(&process);
            async move {
                let status = child.wait().await;
                process.reaped.store(true, Ordering::SeqCst);

                let (exit_code, message) = match status {
                    Ok(status) => match status.code() {
                        Some(code) => (code, String::new()),
                        None => {
                            use std::os::unix::process::ExitStatusExt;
                            let signal = status.signal().unwrap_or_default();
                            (128 + signal, format!("killed by signal {signal}"))
                        }
                    },
                    Err(error) => (-1, format!("wait for task process failed: {error}")),
                };

                let stats = process.cgroup.statistics(&process.group);
                debug!(
                    job_id = process.job_id,
                    task_id = process.task_id,
                    requeue_count = process.requeue_count,
                    exit_code,
                    remaining_pids = stats.process_ids.len(),
                    "task process exited"
                );
                on_exit(exit_code, message, stats).await;
            }
        });

        process
    }

    /// Sends SIGTERM to everything in the task's cgroup and process group;
    /// a forced kill escalates to SIGKILL after a short delay.
    pub async fn kill(&self, forced: bool) {
        debug!(
            job_id = self.job_id,
            task_id = self.task_id,
            forced,
            "killing task process tree"
        );
        self.signal_tree(Signal::SIGTERM);
        if forced {
            tokio::time::sleep(KILL_ESCALATION_DELAY).await;
            self.signal_tree(Signal::SIGKILL);
        }
    }

    fn signal_tree(&self, signal: Signal) {
        for pid in self.cgroup.pids(&self.group) {
            let _ = kill(Pid::from_raw(pid), signal);
        }
        // The child was made its own process-group leader, so this reaches
        // descendants even when cgroup enrollment failed.
        if let Some(pid) = self.pid {
            if !self.reaped.load(Ordering::SeqCst) {
                let _ = killpg(pid, signal);
            }
        }
    }

    /// Snapshot of the task's resource usage and surviving pids.
    pub fn statistics(&self) -> ProcessStatistics {
        let mut stats = self.cgroup.statistics(&self.group);
        if stats.process_ids.is_empty() && !self.reaped.load(Ordering::SeqCst) {
            if let Some(pid) = self.pid {
                stats.process_ids.push(pid.as_raw());
            }
        }
        stats
    }

    /// The last bounded window of the task's stdout.
    pub fn peek_output(&self) -> io::Result<String> {
        match &self.stdout_path {
            Some(path) => file_tail(path),
            None => {
                let tail: Vec<u8> = self.stdout_tail.lock().unwrap().iter().copied().collect();
                Ok(String::from_utf8_lossy(&tail).into_owned())
            }
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.cgroup.remove(&self.group);
    }
}

fn spawn_child(
    start_info: &ProcessStartInfo,
    user_name: &str,
    stdout_path: Option<&Path>,
) -> io::Result<tokio::process::Child> {
    let mut command = Command::new("/bin/bash");
    command.arg("-c").arg(&start_info.command_line);
    command.envs(&start_info.environment_variables);

    if !start_info.working_directory.is_empty() {
        fs::create_dir_all(&start_info.working_directory)?;
        command.current_dir(&start_info.working_directory);
    }

    if user_name != "root" {
        match User::from_name(user_name) {
            Ok(Some(user)) => {
                command
                    .uid(user.uid.as_raw())
                    .gid(user.gid.as_raw())
                    .env("HOME", &user.dir)
                    .env("USER", user_name);
            }
            _ => warn!(user_name, "user not found, starting task as the agent's own user"),
        }
    }

    command.stdin(if start_info.std_in_file.is_empty() {
        Stdio::null()
    } else {
        Stdio::from(File::open(&start_info.std_in_file)?)
    });
    command.stdout(match stdout_path {
        Some(path) => Stdio::from(File::create(path)?),
        None => Stdio::piped(),
    });
    command.stderr(if start_info.std_err_file.is_empty() {
        Stdio::null()
    } else {
        Stdio::from(File::create(&start_info.std_err_file)?)
    });

    let affinity = cpu_set(&start_info.affinity)?;
    unsafe {
        command.pre_exec(move || {
            setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
            if let Some(set) = affinity {
                sched_setaffinity(Pid::from_raw(0), &set)
                    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
            }
            Ok(())
        });
    }

    command.spawn()
}

/// Converts the scheduler's affinity mask words into a [`CpuSet`]. An empty
/// or all-zero mask means no constraint.
fn cpu_set(mask_words: &[u64]) -> io::Result<Option<CpuSet>> {
    if mask_words.iter().all(|word| *word == 0) {
        return Ok(None);
    }
    let mut set = CpuSet::new();
    for (word_index, word) in mask_words.iter().enumerate() {
        for bit in 0..64 {
            if word & (1u64 << bit) != 0 {
                set.set(word_index * 64 + bit)
                    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
            }
        }
    }
    Ok(Some(set))
}

async fn tail_stdout(
    mut stdout: tokio::process::ChildStdout,
    tail: Arc<StdMutex<VecDeque<u8>>>,
) {
    let mut buf = [0u8; 1024];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut tail = tail.lock().unwrap();
                tail.extend(&buf[..n]);
                while tail.len() > PEEK_WINDOW {
                    tail.pop_front();
                }
            }
        }
    }
}

/// Reads the last [`PEEK_WINDOW`] bytes of a file.
fn file_tail(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(PEEK_WINDOW as u64)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
