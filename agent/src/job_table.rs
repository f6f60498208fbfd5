//! In-memory table of the jobs and tasks this node is currently running.
//!
//! The table carries no lock of its own: the executor owns the single
//! reader/writer lock guarding it, the process map and the user-assignment
//! maps. The resync flag is atomic so a failing reporter can raise it from a
//! read-side context.

use chrono::Utc;
use gridagent_messages::{
    JobRecord, NodeHeartbeatInfo, ProcessStatistics, TaskCompletionEvent, TaskRecord,
};
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::task::AbortHandle;
use tracing::debug;

/// Derives the stable process-map key for one task attempt by hashing the
/// (job, task, requeue) triple. All 32 bits of every component participate,
/// so jobs or tasks whose ids differ only in their high bits never alias.
pub fn process_key(job_id: i32, task_id: i32, requeue_count: i32) -> u64 {
    let mut hasher = DefaultHasher::new();
    (job_id, task_id, requeue_count).hash(&mut hasher);
    hasher.finish()
}

/// One task attempt tracked by the agent.
#[derive(Debug)]
pub struct TaskInfo {
    job_id: i32,
    task_id: i32,
    requeue_count: i32,
    /// Requeue count captured when this entry was created; never mutated.
    /// Guards stale removals: a late completion from attempt N must not
    /// erase a newer attempt that reused the same (job, task) key.
    attempt_id: i32,
    /// False for MPI non-master docker sub-tasks, which have no locally
    /// supervised process.
    is_primary_task: bool,
    exited: bool,
    exit_code: Option<i32>,
    message: String,
    affinity: Vec<u64>,
    stats: ProcessStatistics,
    grace_handle: Option<AbortHandle>,
}

impl TaskInfo {
    fn new(job_id: i32, task_id: i32, requeue_count: i32) -> Self {
        Self {
            job_id,
            task_id,
            requeue_count,
            attempt_id: requeue_count,
            is_primary_task: true,
            exited: false,
            exit_code: None,
            message: String::new(),
            affinity: Vec::new(),
            stats: ProcessStatistics::default(),
            grace_handle: None,
        }
    }

    pub fn job_id(&self) -> i32 {
        self.job_id
    }

    pub fn task_id(&self) -> i32 {
        self.task_id
    }

    pub fn requeue_count(&self) -> i32 {
        self.requeue_count
    }

    pub fn attempt_id(&self) -> i32 {
        self.attempt_id
    }

    pub fn process_key(&self) -> u64 {
        process_key(self.job_id, self.task_id, self.requeue_count)
    }

    pub fn is_primary_task(&self) -> bool {
        self.is_primary_task
    }

    pub fn set_primary_task(&mut self, primary: bool) {
        self.is_primary_task = primary;
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn set_requeue_count(&mut self, requeue_count: i32) {
        self.requeue_count = requeue_count;
    }

    pub fn set_affinity(&mut self, affinity: Vec<u64>) {
        self.affinity = affinity;
    }

    pub fn affinity(&self) -> &[u64] {
        &self.affinity
    }

    /// Pins the exit code ahead of completion; used by EndTask so that a
    /// racing process exit still reports the cancellation code.
    pub fn set_exit_code(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
    }

    /// Marks the task completed. A previously pinned exit code takes
    /// precedence over the observed one.
    pub fn mark_exited(&mut self, exit_code: i32, message: String) {
        self.exited = true;
        self.exit_code.get_or_insert(exit_code);
        self.message = message;
    }

    pub fn assign_stats(&mut self, stats: &ProcessStatistics) {
        self.stats = stats.clone();
    }

    pub fn clear_process_ids(&mut self) {
        self.stats.process_ids.clear();
    }

    /// Stores the handle of a pending graceful-termination timer so the
    /// normal exit path can cancel it.
    pub fn set_grace_handle(&mut self, handle: AbortHandle) {
        self.grace_handle = Some(handle);
    }

    pub fn cancel_grace_timer(&mut self) {
        if let Some(handle) = self.grace_handle.take() {
            handle.abort();
        }
    }

    pub fn to_completion_event(&self) -> TaskCompletionEvent {
        TaskCompletionEvent {
            job_id: self.job_id,
            task_id: self.task_id,
            task_requeue_count: self.requeue_count,
            exited: self.exited,
            exit_code: self.exit_code.unwrap_or_default(),
            message: self.message.clone(),
            user_time_ms: self.stats.user_time_ms,
            kernel_time_ms: self.stats.kernel_time_ms,
            working_set_kb: self.stats.working_set_kb,
            process_ids: self.stats.process_ids.clone(),
        }
    }

    fn to_record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.task_id,
            task_requeue_count: self.requeue_count,
        }
    }
}

/// One job and the tasks it owns on this node.
#[derive(Debug, Default)]
pub struct JobInfo {
    job_id: i32,
    tasks: HashMap<i32, TaskInfo>,
}

impl JobInfo {
    pub fn job_id(&self) -> i32 {
        self.job_id
    }

    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut TaskInfo> {
        self.tasks.values_mut()
    }

    pub fn into_tasks(self) -> impl Iterator<Item = TaskInfo> {
        self.tasks.into_values()
    }
}

/// Map of jobs to tasks with attempt versioning and the resync flag.
#[derive(Debug, Default)]
pub struct JobTaskTable {
    jobs: HashMap<i32, JobInfo>,
    request_resync: AtomicBool,
}

impl JobTaskTable {
    /// Looks up or creates the (job, task) entry. New entries capture the
    /// given requeue count as their attempt id; existing entries keep their
    /// attempt id and only track the latest requeue count.
    pub fn add_job_and_task(
        &mut self,
        job_id: i32,
        task_id: i32,
        requeue_count: i32,
    ) -> (&mut TaskInfo, bool) {
        let job = self.jobs.entry(job_id).or_insert_with(|| JobInfo {
            job_id,
            tasks: HashMap::new(),
        });
        let mut is_new = false;
        let task = job.tasks.entry(task_id).or_insert_with(|| {
            is_new = true;
            TaskInfo::new(job_id, task_id, requeue_count)
        });
        if !is_new {
            task.set_requeue_count(requeue_count);
        }
        (task, is_new)
    }

    pub fn get_task(&self, job_id: i32, task_id: i32) -> Option<&TaskInfo> {
        self.jobs.get(&job_id)?.tasks.get(&task_id)
    }

    pub fn get_task_mut(&mut self, job_id: i32, task_id: i32) -> Option<&mut TaskInfo> {
        self.jobs.get_mut(&job_id)?.tasks.get_mut(&task_id)
    }

    /// Removes a task entry, but only if the stored attempt id matches:
    /// a stale removal for an earlier attempt is a no-op.
    pub fn remove_task(&mut self, job_id: i32, task_id: i32, attempt_id: i32) -> Option<TaskInfo> {
        let job = self.jobs.get_mut(&job_id)?;
        match job.tasks.get(&task_id) {
            Some(task) if task.attempt_id == attempt_id => job.tasks.remove(&task_id),
            Some(task) => {
                debug!(
                    job_id,
                    task_id,
                    stored_attempt = task.attempt_id,
                    removal_attempt = attempt_id,
                    "skipping stale task removal"
                );
                None
            }
            None => None,
        }
    }

    /// Removes a job wholesale, returning it for teardown.
    pub fn remove_job(&mut self, job_id: i32) -> Option<JobInfo> {
        self.jobs.remove(&job_id)
    }

    /// Raises the sticky resync flag; the next heartbeat carries it so the
    /// head node re-pushes authoritative job state.
    pub fn request_resync(&self) {
        self.request_resync.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn resync_requested(&self) -> bool {
        self.request_resync.load(Ordering::SeqCst)
    }

    /// Produces the heartbeat payload, consuming the resync flag into it.
    pub fn snapshot(&self, node_name: &str) -> NodeHeartbeatInfo {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .values()
            .map(|job| {
                let mut tasks: Vec<TaskRecord> =
                    job.tasks.values().map(TaskInfo::to_record).collect();
                tasks.sort_by_key(|task| task.task_id);
                JobRecord {
                    job_id: job.job_id,
                    tasks,
                }
            })
            .collect();
        jobs.sort_by_key(|job| job.job_id);

        NodeHeartbeatInfo {
            node_name: node_name.to_string(),
            timestamp: Utc::now(),
            request_resync: self.request_resync.swap(false, Ordering::SeqCst),
            jobs,
        }
    }
}
