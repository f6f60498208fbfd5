//! The task executor: user provisioning, task launch, graceful termination,
//! completion callbacks and the periodic reporters.
//!
//! One reader/writer lock guards the job/task table, the process map and the
//! user-assignment maps. The lock is never held across `.await`: kill-polling
//! and HTTP callbacks run between lock holds, and the interleavings that
//! opens up are resolved by the task's `exited` flag and attempt-id guard —
//! whichever completion path marks the task first wins, the loser drops out.

use crate::{
    cgroup::CgroupRoot,
    hosts::{
        HostsManager, DEFAULT_HOSTS_FETCH_INTERVAL, DEFAULT_HOSTS_FILE, MIN_HOSTS_FETCH_INTERVAL,
    },
    job_table::{JobTaskTable, TaskInfo},
    monitor::Monitor,
    process::Process,
    users::{CreateUserOutcome, SshKeyInstall, UserAdmin, FAKED_ROOT_USER, WINDOWS_SYSTEM_ACCOUNT},
    END_JOB_EXIT_CODE, END_TASK_EXIT_CODE,
};
use gridagent_core::{
    config::ConfigStore,
    http::{self, post_json},
    naming::NamingClient,
    reporter::{HttpSink, Reporter, UdpSink},
    Error as CoreError,
};
use gridagent_messages::{
    env, EndJobArgs, EndTaskArgs, JobStateRecord, MetricCountersConfig, PeekTaskOutputArgs,
    ProcessStatistics, StartJobAndTaskArgs, StartTaskArgs, TaskCompletionEvent,
};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    process::Command,
    sync::{Arc, RwLock, Weak},
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Sentinel returned by PeekTaskOutput when the output cannot be read.
const PEEK_OUTPUT_FAILURE: &str = "NodeManager: Failed to get the output.";

/// How long a kill waits for the control group to drain: ten polls at 100 ms.
const TERMINATION_POLL_ATTEMPTS: u32 = 10;
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors returned by executor operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job {0} was not started on this node")]
    UnknownJob(i32),
    #[error(transparent)]
    Provision(#[from] crate::users::ProvisionError),
    #[error(transparent)]
    Transport(#[from] CoreError),
    #[error("invalid metric callback URI \"{0}\"")]
    InvalidMetricUri(String),
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// The Linux identity a job's tasks run under, and which SSH artifacts were
/// installed for it.
#[derive(Clone, Debug)]
struct UserAssignment {
    user_name: String,
    #[allow(dead_code)]
    pre_existing_user: bool,
    ssh_keys: SshKeyInstall,
}

/// Everything the executor's single RW lock guards.
#[derive(Default)]
struct ExecutorState {
    table: JobTaskTable,
    processes: HashMap<u64, Arc<Process>>,
    job_users: HashMap<i32, UserAssignment>,
    user_jobs: HashMap<String, HashSet<i32>>,
}

/// Identity a process-exit callback carries back into the executor.
#[derive(Clone, Debug)]
struct TaskExitContext {
    job_id: i32,
    task_id: i32,
    requeue_count: i32,
    attempt_id: i32,
    process_key: u64,
    callback_uri: String,
}

struct Reporters {
    register: Option<Reporter>,
    heartbeat: Option<Reporter>,
    metric: Option<Reporter>,
}

pub struct Executor {
    /// Self-reference handed to spawned callbacks and hooks; weak, so the
    /// process map's closures never keep the executor alive.
    weak: Weak<Executor>,
    state: RwLock<ExecutorState>,
    config: Arc<ConfigStore>,
    naming: Arc<NamingClient>,
    monitor: Arc<Monitor>,
    user_admin: Arc<dyn UserAdmin>,
    cgroup: CgroupRoot,
    http_client: reqwest::Client,
    cancel: CancellationToken,
    reporters: Mutex<Reporters>,
    hosts_manager: Mutex<Option<HostsManager>>,
}

impl Executor {
    pub fn new(
        config: Arc<ConfigStore>,
        monitor: Arc<Monitor>,
        user_admin: Arc<dyn UserAdmin>,
        cgroup: CgroupRoot,
    ) -> Result<Arc<Self>, Error> {
        let http_client = http::http_client().map_err(CoreError::Http)?;
        let cancel = CancellationToken::new();
        let snapshot = config.snapshot();
        let naming_backoff_initial = snapshot.naming_backoff_initial();
        let naming = Arc::new(NamingClient::new(
            snapshot.naming_service_uris,
            naming_backoff_initial,
            http_client.clone(),
            cancel.clone(),
        ));

        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            state: RwLock::new(ExecutorState::default()),
            config,
            naming,
            monitor,
            user_admin,
            cgroup,
            http_client,
            cancel,
            reporters: Mutex::new(Reporters {
                register: None,
                heartbeat: None,
                metric: None,
            }),
            hosts_manager: Mutex::new(None),
        }))
    }

    /// Boots the periodic reporters and the hosts manager. Task commands
    /// work without this; it is separate so embedders control when outbound
    /// traffic starts.
    pub async fn start(&self) {
        self.start_register_reporter().await;
        self.start_heartbeat().await;
        if !self.config.metric_uri().is_empty() {
            if let Err(error) = self.start_metric().await {
                warn!(%error, "metric reporter not started");
            }
        }
        self.start_hosts_manager().await;
    }

    /// Stops all periodic work and cancels in-flight naming lookups.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut reporters = self.reporters.lock().await;
        for reporter in [
            reporters.register.take(),
            reporters.heartbeat.take(),
            reporters.metric.take(),
        ]
        .into_iter()
        .flatten()
        {
            reporter.stop().await;
        }
        if let Some(manager) = self.hosts_manager.lock().await.take() {
            manager.stop().await;
        }
    }

    /// Universal transport-failure recovery: the next heartbeat asks the
    /// head node to re-push authoritative state, and stale service locations
    /// are dropped.
    pub fn resync_and_invalidate(&self) {
        self.state.read().unwrap().table.request_resync();
        self.naming.invalidate();
    }

    /// Provisions the job's user and SSH material, then starts the task.
    pub async fn start_job_and_task(
        &self,
        args: StartJobAndTaskArgs,
        callback_uri: String,
    ) -> Result<Value, Error> {
        {
            let mut state = self.state.write().unwrap();

            let start_info = &args.start_info;
            let is_admin = start_info.env_flag(env::IS_ADMIN);
            let map_admin_user = start_info.env_flag(env::MAP_ADMIN_USER);
            let map_admin_to_root = is_admin && !map_admin_user;
            let map_admin_to_user = is_admin && map_admin_user;
            let is_windows_system_account =
                args.user_name.eq_ignore_ascii_case(WINDOWS_SYSTEM_ACCOUNT);

            // Run as root in three scenarios: an old image sending no user
            // name, an administrator who is not mapped to a local user, and
            // the Windows local system account.
            let (user_name, pre_existing_user) =
                if args.user_name.is_empty() || map_admin_to_root || is_windows_system_account {
                    ("root".to_string(), true)
                } else {
                    let preserve_domain = start_info.env_flag(env::PRESERVE_DOMAIN);
                    let mut user_name = if preserve_domain {
                        args.user_name.clone()
                    } else {
                        strip_domain(&args.user_name).to_string()
                    };
                    if user_name == "root" {
                        user_name = FAKED_ROOT_USER.to_string();
                    }
                    let outcome = self.user_admin.create_user(&user_name, &args.password, is_admin)?;
                    debug!(
                        job_id = args.job_id,
                        task_id = args.task_id,
                        %user_name,
                        ?outcome,
                        "create user finished"
                    );
                    (user_name, outcome == CreateUserOutcome::AlreadyExisted)
                };

            // Install SSH keys for non-administrators, administrators mapped
            // to a local user, and the Windows system account.
            let ssh_keys = if !is_admin || map_admin_to_user || is_windows_system_account {
                self.user_admin
                    .install_ssh_keys(&user_name, &args.private_key, &args.public_key)
            } else {
                SshKeyInstall::default()
            };

            if !state.job_users.contains_key(&args.job_id) {
                debug!(job_id = args.job_id, %user_name, "job user assignment added");
                state.job_users.insert(
                    args.job_id,
                    UserAssignment {
                        user_name: user_name.clone(),
                        pre_existing_user,
                        ssh_keys,
                    },
                );
            }
            state
                .user_jobs
                .entry(user_name)
                .or_default()
                .insert(args.job_id);
        }

        self.start_task(
            StartTaskArgs {
                job_id: args.job_id,
                task_id: args.task_id,
                start_info: args.start_info,
            },
            callback_uri,
        )
        .await
    }

    /// Registers the task and spawns its process (idempotently), or records
    /// an MPI non-master placeholder.
    pub async fn start_task(
        &self,
        args: StartTaskArgs,
        callback_uri: String,
    ) -> Result<Value, Error> {
        let (job_id, task_id) = (args.job_id, args.task_id);
        let requeue_count = args.start_info.task_requeue_count;

        let mut state = self.state.write().unwrap();

        let (is_new_entry, process_key, attempt_id) = {
            let (task, is_new) = state.table.add_job_and_task(job_id, task_id, requeue_count);
            task.set_affinity(args.start_info.affinity.clone());
            (is_new, task.process_key(), task.attempt_id())
        };

        let user_name = state
            .job_users
            .get(&job_id)
            .map(|assignment| assignment.user_name.clone());
        let Some(user_name) = user_name else {
            state.table.remove_job(job_id);
            return Err(Error::UnknownJob(job_id));
        };

        if args.start_info.command_line.is_empty() {
            info!(
                job_id,
                task_id, requeue_count, "MPI non-master task found, skipping process creation"
            );
            let docker_image = args
                .start_info
                .env_var(env::DOCKER_IMAGE)
                .unwrap_or_default()
                .to_string();
            if !docker_image.is_empty() {
                if let Some(task) = state.table.get_task_mut(job_id, task_id) {
                    task.set_primary_task(false);
                }
                let nvidia = args
                    .start_info
                    .env_var(env::DOCKER_NVIDIA)
                    .unwrap_or_default();
                start_mpi_container(job_id, task_id, requeue_count, &user_name, &docker_image, nvidia);
            }
        } else if !state.processes.contains_key(&process_key) && is_new_entry {
            let process = Process::launch(
                job_id,
                task_id,
                requeue_count,
                &args.start_info,
                &user_name,
                self.cgroup.clone(),
                {
                    // The callback holds the executor weakly: the executor
                    // owns the process map that transitively owns this
                    // closure, and the back-reference must not keep it alive.
                    let executor = self.weak.clone();
                    let exit = TaskExitContext {
                        job_id,
                        task_id,
                        requeue_count,
                        attempt_id,
                        process_key,
                        callback_uri,
                    };
                    move |exit_code, message, stats| async move {
                        if let Some(executor) = executor.upgrade() {
                            executor
                                .handle_process_exit(exit, exit_code, message, stats)
                                .await;
                        }
                    }
                },
            );
            state.processes.insert(process_key, process);
            debug!(
                job_id,
                task_id,
                requeue_count,
                process_key,
                process_count = state.processes.len(),
                "task process registered"
            );
        } else {
            warn!(job_id, task_id, requeue_count, "task has already started");
        }

        Ok(json!({}))
    }

    /// Ends one task, giving it `task_cancel_grace_period_seconds` between
    /// SIGTERM and the forced kill; zero forces immediately.
    pub async fn end_task(
        &self,
        args: EndTaskArgs,
        callback_uri: String,
    ) -> Result<Value, Error> {
        info!(job_id = args.job_id, task_id = args.task_id, "EndTask: starting");
        let (job_id, task_id) = (args.job_id, args.task_id);
        let forced = args.task_cancel_grace_period_seconds == 0;

        // Snapshot the task and its process under the lock; the kill and the
        // termination poll run outside it.
        let Some((requeue_count, attempt_id, process_key, mpi_docker_task, process)) = ({
            let state = self.state.read().unwrap();
            state.table.get_task(job_id, task_id).map(|task| {
                (
                    task.requeue_count(),
                    task.attempt_id(),
                    task.process_key(),
                    !task.is_primary_task(),
                    state.processes.get(&task.process_key()).cloned(),
                )
            })
        }) else {
            warn!(job_id, task_id, "EndTask: task is already finished");
            return Ok(json!({}));
        };

        let stats = self
            .terminate_task(job_id, task_id, requeue_count, forced, mpi_docker_task, process)
            .await;

        let body = {
            let mut state = self.state.write().unwrap();
            let Some(task) = state.table.get_task_mut(job_id, task_id) else {
                // The process exit callback won the race meanwhile.
                warn!(job_id, task_id, "EndTask: task is already finished");
                return Ok(json!({}));
            };
            if task.attempt_id() != attempt_id {
                warn!(job_id, task_id, "EndTask: task was requeued meanwhile");
                return Ok(json!({}));
            }

            let terminated = stats.as_ref().map_or(true, ProcessStatistics::is_terminated);
            if let Some(stats) = &stats {
                task.assign_stats(stats);
            }

            if terminated {
                task.mark_exited(END_TASK_EXIT_CODE, String::new());
                task.cancel_grace_timer();
                let body = serde_json::to_value(task.to_completion_event())?;
                state.table.remove_task(job_id, task_id, attempt_id);
                body
            } else {
                // The task survived SIGTERM; arm the forced kill for when
                // the grace period elapses. The normal exit path cancels it.
                task.set_exit_code(END_TASK_EXIT_CODE);
                let grace =
                    Duration::from_secs(args.task_cancel_grace_period_seconds.max(0) as u64);
                let handle = tokio::spawn({
                    let executor = self.weak.clone();
                    let callback_uri = callback_uri.clone();
                    async move {
                        tokio::time::sleep(grace).await;
                        if let Some(executor) = executor.upgrade() {
                            executor
                                .grace_period_elapsed(
                                    job_id,
                                    task_id,
                                    requeue_count,
                                    attempt_id,
                                    process_key,
                                    callback_uri,
                                )
                                .await;
                        }
                    }
                });
                task.set_grace_handle(handle.abort_handle());
                serde_json::to_value(task.to_completion_event())?
            }
        };

        info!(job_id, task_id, "EndTask: finished");
        Ok(body)
    }

    /// Ends a job: forced termination of every task, then release of the
    /// job's user reference and, on the last reference, removal of the
    /// recorded SSH artifacts. The user account itself is deliberately kept:
    /// later jobs and operators rely on accounts surviving job teardown.
    pub async fn end_job(&self, args: EndJobArgs) -> Result<Value, Error> {
        info!(job_id = args.job_id, "EndJob: starting");

        let (tasks, user_cleanup) = {
            let mut state = self.state.write().unwrap();

            let mut tasks: Vec<(TaskInfo, Option<Arc<Process>>)> = Vec::new();
            match state.table.remove_job(args.job_id) {
                Some(job) => {
                    for mut task in job.into_tasks() {
                        task.cancel_grace_timer();
                        let process = state.processes.remove(&task.process_key());
                        tasks.push((task, process));
                    }
                }
                None => warn!(job_id = args.job_id, "EndJob: job is already finished"),
            }

            let user_cleanup = match state.job_users.remove(&args.job_id) {
                Some(assignment) => {
                    let remaining = match state.user_jobs.get_mut(&assignment.user_name) {
                        Some(jobs) => {
                            jobs.remove(&args.job_id);
                            jobs.len()
                        }
                        None => 0,
                    };
                    if remaining == 0 {
                        state.user_jobs.remove(&assignment.user_name);
                    }
                    info!(
                        job_id = args.job_id,
                        user_name = %assignment.user_name,
                        remaining,
                        "EndJob: released user reference"
                    );
                    Some((assignment, remaining == 0))
                }
                None => None,
            };

            (tasks, user_cleanup)
        };

        let mut records = Vec::new();
        for (mut task, process) in tasks {
            debug!(job_id = args.job_id, task_id = task.task_id(), "EndJob: terminating task");
            let stats = self
                .terminate_task(
                    args.job_id,
                    task.task_id(),
                    task.requeue_count(),
                    true,
                    !task.is_primary_task(),
                    process,
                )
                .await;
            task.mark_exited(END_JOB_EXIT_CODE, String::new());
            if let Some(stats) = &stats {
                task.assign_stats(stats);
            }
            records.push(task.to_completion_event());
        }
        records.sort_by_key(|record| record.task_id);

        if let Some((assignment, last_reference)) = user_cleanup {
            if last_reference {
                self.user_admin
                    .remove_ssh_keys(&assignment.user_name, &assignment.ssh_keys);
            }
        }

        let body = JobStateRecord {
            job_id: args.job_id,
            tasks: records,
        };
        info!(job_id = args.job_id, "EndJob: finished");
        Ok(serde_json::to_value(body)?)
    }

    /// Adopts a new heartbeat endpoint pushed by the head node, restarting
    /// the heartbeat reporter when it changed.
    pub async fn ping(&self, callback_uri: String) -> Result<Value, Error> {
        if self.config.heartbeat_uri() != callback_uri {
            info!(%callback_uri, "heartbeat endpoint changed, restarting heartbeat reporter");
            self.config.save_heartbeat_uri(&callback_uri)?;
            self.start_heartbeat().await;
        }
        Ok(json!({}))
    }

    /// Adopts a new UDP metric endpoint pushed by the head node. The fourth
    /// path segment of `udp://host:port/api/<nodeguid>/metricreported`
    /// carries the node's metric identity.
    pub async fn metric(&self, callback_uri: String) -> Result<Value, Error> {
        if self.config.metric_uri() != callback_uri {
            info!(%callback_uri, "metric endpoint changed, restarting metric reporter");
            self.config.save_metric_uri(&callback_uri)?;
            self.start_metric().await?;
        }
        Ok(json!({}))
    }

    /// Forwards a counter configuration to the monitor, making sure the
    /// metric reporter is running first.
    pub async fn metric_config(
        &self,
        config: MetricCountersConfig,
        callback_uri: String,
    ) -> Result<Value, Error> {
        self.metric(callback_uri).await?;
        self.monitor.apply_metric_config(config);
        Ok(json!({}))
    }

    /// Returns the last bounded window of a task's stdout.
    pub async fn peek_task_output(&self, args: PeekTaskOutputArgs) -> Result<Value, Error> {
        info!(job_id = args.job_id, task_id = args.task_id, "peeking task output");
        let output = {
            let state = self.state.read().unwrap();
            state
                .table
                .get_task(args.job_id, args.task_id)
                .and_then(|task| state.processes.get(&task.process_key()))
                .map(|process| process.peek_output())
        };
        let output = match output {
            Some(Ok(output)) => output,
            Some(Err(error)) => {
                warn!(
                    job_id = args.job_id,
                    task_id = args.task_id,
                    %error,
                    "failed to peek task output"
                );
                PEEK_OUTPUT_FAILURE.to_string()
            }
            None => String::new(),
        };
        Ok(Value::String(output))
    }

    /// Delivered by a process's wait task, exactly once per process.
    async fn handle_process_exit(
        &self,
        exit: TaskExitContext,
        exit_code: i32,
        message: String,
        stats: ProcessStatistics,
    ) {
        let completion = {
            let mut state = self.state.write().unwrap();
            match state.table.get_task_mut(exit.job_id, exit.task_id) {
                Some(task) if task.attempt_id() == exit.attempt_id => {
                    task.cancel_grace_timer();
                    if task.exited() {
                        debug!(
                            job_id = exit.job_id,
                            task_id = exit.task_id,
                            "task already ended by EndTask"
                        );
                        None
                    } else {
                        task.mark_exited(exit_code, message);
                        task.assign_stats(&stats);
                        Some(task.to_completion_event())
                    }
                }
                _ => {
                    debug!(
                        job_id = exit.job_id,
                        task_id = exit.task_id,
                        attempt_id = exit.attempt_id,
                        "no live task entry for exited process"
                    );
                    None
                }
            }
        };

        // The callback POST happens outside the lock.
        if let Some(event) = completion {
            self.report_task_completion(&exit.callback_uri, &event).await;
        }

        let removed = {
            let mut state = self.state.write().unwrap();
            // A newer attempt that reused this key is protected by the
            // attempt-id check.
            state
                .table
                .remove_task(exit.job_id, exit.task_id, exit.attempt_id);
            state.processes.remove(&exit.process_key)
        };
        debug!(
            job_id = exit.job_id,
            task_id = exit.task_id,
            attempt_id = exit.attempt_id,
            process_key = exit.process_key,
            "erased process"
        );
        // Process teardown (cgroup removal) happens outside the lock; this
        // callback is owned by the wait task, not the map entry, so it
        // safely outlives the erase.
        drop(removed);
    }

    /// POSTs a completion event; transport failures and non-2xx responses
    /// trigger resynchronization.
    async fn report_task_completion(&self, callback_uri: &str, event: &TaskCompletionEvent) {
        let result = async {
            let url = http::resolve_uri(callback_uri, &self.naming).await?;
            debug!(
                job_id = event.job_id,
                task_id = event.task_id,
                %url,
                "reporting task completion"
            );
            post_json(&self.http_client, &url, event).await
        }
        .await;

        if let Err(error) = result {
            error!(
                job_id = event.job_id,
                task_id = event.task_id,
                %error,
                "failed to report task completion"
            );
            self.resync_and_invalidate();
        }
    }

    /// Kills a task's process tree and polls up to 1 s for the control group
    /// to drain. Returns the last statistics snapshot, or `None` when there
    /// is no local process (MPI docker sub-task, or the process is already
    /// gone).
    async fn terminate_task(
        &self,
        job_id: i32,
        task_id: i32,
        requeue_count: i32,
        forced: bool,
        mpi_docker_task: bool,
        process: Option<Arc<Process>>,
    ) -> Option<ProcessStatistics> {
        if mpi_docker_task {
            stop_mpi_container(job_id, task_id, requeue_count);
            return None;
        }

        let Some(process) = process else {
            warn!(job_id, task_id, requeue_count, "no process object found");
            return None;
        };

        debug!(job_id, task_id, requeue_count, forced, "about to kill the task");
        process.kill(forced).await;

        let mut stats = process.statistics();
        let mut attempts = TERMINATION_POLL_ATTEMPTS;
        while !stats.is_terminated() && attempts > 0 {
            attempts -= 1;
            tokio::time::sleep(TERMINATION_POLL_INTERVAL).await;
            stats = process.statistics();
        }
        if !stats.is_terminated() {
            warn!(
                job_id,
                task_id,
                requeue_count,
                pids = ?stats.process_ids,
                "task did not exit within the termination poll window"
            );
        }
        Some(stats)
    }

    /// Armed by EndTask when the task survives SIGTERM: forces the kill,
    /// synthesizes the completion event and reports it.
    async fn grace_period_elapsed(
        &self,
        job_id: i32,
        task_id: i32,
        requeue_count: i32,
        attempt_id: i32,
        process_key: u64,
        callback_uri: String,
    ) {
        info!(job_id, task_id, "grace period elapsed");

        let process = {
            let state = self.state.read().unwrap();
            if state.table.get_task(job_id, task_id).map(TaskInfo::attempt_id) != Some(attempt_id) {
                warn!(job_id, task_id, "grace period expiry found no matching task");
                return;
            }
            state.processes.get(&process_key).cloned()
        };
        if process.is_none() {
            // The main process exited meanwhile; its exit callback owns
            // completion.
            warn!(job_id, task_id, "grace period expiry found no process");
            return;
        }

        let Some(stats) = self
            .terminate_task(job_id, task_id, requeue_count, true, false, process)
            .await
        else {
            return;
        };

        if self.config.debug() {
            for pid in &stats.process_ids {
                let cmdline = std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
                    .unwrap_or_default()
                    .replace('\0', " ");
                debug!(job_id, task_id, pid, %cmdline, "undead process after grace period");
            }
        }

        let completion = {
            let mut state = self.state.write().unwrap();
            let Some(task) = state.table.get_task_mut(job_id, task_id) else {
                warn!(job_id, task_id, "grace period expiry lost the completion race");
                return;
            };
            if task.attempt_id() != attempt_id || task.exited() {
                return;
            }
            task.mark_exited(END_TASK_EXIT_CODE, String::new());
            task.assign_stats(&stats);
            task.clear_process_ids();
            let event = task.to_completion_event();
            state.table.remove_task(job_id, task_id, attempt_id);
            event
        };

        info!(job_id, task_id, "EndTask: completed after grace period");
        self.report_task_completion(&callback_uri, &completion).await;
    }

    async fn start_register_reporter(&self) {
        let config = self.config.snapshot();
        let reporter = Reporter::spawn(
            "register",
            {
                let executor = self.weak.clone();
                move || resolve_config_uri(executor.clone(), ConfigStore::registration_uri)
            },
            3,
            config.register_interval(),
            {
                let monitor = Arc::clone(&self.monitor);
                move || Some(monitor.registration_info())
            },
            HttpSink::new(self.http_client.clone()),
            self.resync_hook(),
        );
        self.reporters.lock().await.register = reporter;
    }

    /// (Re)starts the heartbeat reporter; a running one is fully stopped
    /// first.
    async fn start_heartbeat(&self) {
        let config = self.config.snapshot();
        let mut reporters = self.reporters.lock().await;
        if let Some(old) = reporters.heartbeat.take() {
            old.stop().await;
        }
        reporters.heartbeat = Reporter::spawn(
            "heartbeat",
            {
                let executor = self.weak.clone();
                move || resolve_config_uri(executor.clone(), ConfigStore::heartbeat_uri)
            },
            0,
            config.node_info_report_interval(),
            {
                let executor = self.weak.clone();
                move || {
                    let executor = executor.upgrade()?;
                    let node_name = executor.monitor.node_name().to_string();
                    let snapshot = executor.state.read().unwrap().table.snapshot(&node_name);
                    Some(snapshot)
                }
            },
            HttpSink::new(self.http_client.clone()),
            self.resync_hook(),
        );
    }

    /// (Re)starts the metric reporter after extracting the node UUID from
    /// the configured metric URI.
    async fn start_metric(&self) -> Result<(), Error> {
        let config = self.config.snapshot();
        if config.metric_uri.is_empty() {
            warn!("metric URI not configured, metric reporter not started");
            return Ok(());
        }

        self.monitor
            .set_node_uuid(node_uuid_from_metric_uri(&config.metric_uri)?);

        let sink = UdpSink::bind().await.map_err(CoreError::Io)?;
        let mut reporters = self.reporters.lock().await;
        if let Some(old) = reporters.metric.take() {
            old.stop().await;
        }
        reporters.metric = Reporter::spawn(
            "metric",
            {
                let executor = self.weak.clone();
                move || resolve_config_uri(executor.clone(), ConfigStore::metric_uri)
            },
            0,
            config.metric_report_interval(),
            {
                let monitor = Arc::clone(&self.monitor);
                move || monitor.packet()
            },
            sink,
            {
                // Metric datagrams are fire-and-forget; a send failure only
                // suggests a stale location, not lost state.
                let naming = Arc::clone(&self.naming);
                move || naming.invalidate()
            },
        );
        Ok(())
    }

    async fn start_hosts_manager(&self) {
        let config = self.config.snapshot();
        let Some(hosts_uri) = config.hosts_file_uri.filter(|uri| !uri.is_empty()) else {
            warn!("hosts file URI not configured, hosts manager will not be started");
            return;
        };

        let mut interval = config
            .hosts_fetch_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HOSTS_FETCH_INTERVAL);
        if interval < MIN_HOSTS_FETCH_INTERVAL {
            info!(
                ?interval,
                minimum = ?MIN_HOSTS_FETCH_INTERVAL,
                "hosts fetch interval below minimum, clamping"
            );
            interval = MIN_HOSTS_FETCH_INTERVAL;
        }

        let manager = HostsManager::spawn(
            {
                let executor = self.weak.clone();
                move || {
                    let executor = executor.clone();
                    let hosts_uri = hosts_uri.clone();
                    async move {
                        let Some(executor) = executor.upgrade() else {
                            return Err(CoreError::Cancelled);
                        };
                        http::resolve_uri(&hosts_uri, &executor.naming).await
                    }
                }
            },
            interval,
            DEFAULT_HOSTS_FILE,
            self.http_client.clone(),
        );
        *self.hosts_manager.lock().await = Some(manager);
    }

    fn resync_hook(&self) -> impl Fn() + Send + Sync + 'static {
        let executor = self.weak.clone();
        move || {
            if let Some(executor) = executor.upgrade() {
                executor.resync_and_invalidate();
            }
        }
    }
}

/// Resolves a URI read fresh from the configuration on every tick, so
/// head-node pushed endpoint changes take effect without a restart.
async fn resolve_config_uri(
    executor: Weak<Executor>,
    uri: fn(&ConfigStore) -> String,
) -> Result<Url, CoreError> {
    let Some(executor) = executor.upgrade() else {
        return Err(CoreError::Cancelled);
    };
    http::resolve_uri(&uri(&executor.config), &executor.naming).await
}

fn strip_domain(user_name: &str) -> &str {
    user_name
        .rsplit_once('\\')
        .map(|(_, user)| user)
        .unwrap_or(user_name)
}

fn node_uuid_from_metric_uri(uri: &str) -> Result<Uuid, Error> {
    let url = Url::parse(uri).map_err(|_| Error::InvalidMetricUri(uri.to_string()))?;
    let guid = url
        .path_segments()
        .and_then(|mut segments| segments.nth(1))
        .ok_or_else(|| Error::InvalidMetricUri(uri.to_string()))?;
    Uuid::parse_str(guid).map_err(|_| Error::InvalidMetricUri(uri.to_string()))
}

fn start_mpi_container(
    job_id: i32,
    task_id: i32,
    requeue_count: i32,
    user_name: &str,
    image: &str,
    nvidia: &str,
) {
    match Command::new("/bin/bash")
        .arg("StartMpiContainer.sh")
        .arg(task_id.to_string())
        .arg(user_name)
        .arg(image)
        .arg(nvidia)
        .output()
    {
        Ok(output) if output.status.success() => {
            info!(job_id, task_id, requeue_count, "started MPI container")
        }
        Ok(output) => error!(
            job_id,
            task_id,
            requeue_count,
            code = output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "starting MPI container failed"
        ),
        Err(error) => error!(
            job_id,
            task_id,
            requeue_count,
            %error,
            "could not run the MPI container start helper"
        ),
    }
}

fn stop_mpi_container(job_id: i32, task_id: i32, requeue_count: i32) {
    match Command::new("/bin/bash")
        .arg("StopMpiContainer.sh")
        .arg(task_id.to_string())
        .output()
    {
        Ok(output) if output.status.success() => {
            info!(job_id, task_id, requeue_count, "stopped MPI container")
        }
        Ok(output) => error!(
            job_id,
            task_id,
            requeue_count,
            code = output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "stopping MPI container failed"
        ),
        Err(error) => error!(
            job_id,
            task_id,
            requeue_count,
            %error,
            "could not run the MPI container stop helper"
        ),
    }
}

#[cfg(test)]
impl Executor {
    pub(crate) fn has_task(&self, job_id: i32, task_id: i32) -> bool {
        self.state.read().unwrap().table.get_task(job_id, task_id).is_some()
    }

    pub(crate) fn process_count(&self) -> usize {
        self.state.read().unwrap().processes.len()
    }

    pub(crate) fn job_user(&self, job_id: i32) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .job_users
            .get(&job_id)
            .map(|assignment| assignment.user_name.clone())
    }

    pub(crate) fn user_job_count(&self, user_name: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .user_jobs
            .get(user_name)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub(crate) fn resync_requested(&self) -> bool {
        self.state.read().unwrap().table.resync_requested()
    }

    pub(crate) fn naming(&self) -> &NamingClient {
        &self.naming
    }

    pub(crate) async fn heartbeat_running(&self) -> bool {
        self.reporters.lock().await.heartbeat.is_some()
    }

    pub(crate) async fn metric_running(&self) -> bool {
        self.reporters.lock().await.metric.is_some()
    }

    pub(crate) fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::install_test_trace_subscriber;
    use crate::users::ProvisionError;
    use assert_matches::assert_matches;
    use gridagent_core::config::AgentConfig;
    use gridagent_messages::ProcessStartInfo;
    use mockito::Matcher;
    use std::sync::Mutex as StdMutex;

    /// Recording fake of the provisioning seam.
    #[derive(Default)]
    struct FakeUserAdmin {
        created: StdMutex<Vec<(String, bool)>>,
        installed: StdMutex<Vec<String>>,
        removed: StdMutex<Vec<(String, SshKeyInstall)>>,
        existing_users: StdMutex<HashSet<String>>,
    }

    impl UserAdmin for FakeUserAdmin {
        fn create_user(
            &self,
            user_name: &str,
            _password: &str,
            admin: bool,
        ) -> Result<CreateUserOutcome, ProvisionError> {
            self.created
                .lock()
                .unwrap()
                .push((user_name.to_string(), admin));
            if self
                .existing_users
                .lock()
                .unwrap()
                .insert(user_name.to_string())
            {
                Ok(CreateUserOutcome::Created)
            } else {
                Ok(CreateUserOutcome::AlreadyExisted)
            }
        }

        fn install_ssh_keys(
            &self,
            user_name: &str,
            private_key: &str,
            public_key: &str,
        ) -> SshKeyInstall {
            self.installed.lock().unwrap().push(user_name.to_string());
            let added = !private_key.is_empty();
            SshKeyInstall {
                private_key_added: added,
                public_key_added: added,
                authorized_key_added: added,
                public_key_text: public_key.to_string(),
            }
        }

        fn remove_ssh_keys(&self, user_name: &str, install: &SshKeyInstall) {
            self.removed
                .lock()
                .unwrap()
                .push((user_name.to_string(), install.clone()));
        }
    }

    struct Harness {
        executor: Arc<Executor>,
        user_admin: Arc<FakeUserAdmin>,
        _cgroup_dir: tempfile::TempDir,
    }

    fn harness(naming_pool: Vec<Url>) -> Harness {
        install_test_trace_subscriber();
        let config = AgentConfig {
            registration_uri: "https://head.invalid/api/cn-test/registerrequested".into(),
            heartbeat_uri: "https://head.invalid/api/cn-test/computenodereported".into(),
            metric_uri: String::new(),
            hosts_file_uri: None,
            hosts_fetch_interval_secs: None,
            naming_service_uris: naming_pool,
            register_interval_secs: 300,
            node_info_report_interval_secs: 30,
            metric_report_interval_secs: 1,
            naming_backoff_initial_secs: 1,
            network_name: "Enterprise".into(),
            debug: false,
        };
        let user_admin = Arc::new(FakeUserAdmin::default());
        let cgroup_dir = tempfile::tempdir().unwrap();
        let executor = Executor::new(
            Arc::new(ConfigStore::detached(config)),
            Arc::new(Monitor::new("cn-test", "Enterprise")),
            Arc::clone(&user_admin) as Arc<dyn UserAdmin>,
            CgroupRoot::new(cgroup_dir.path()),
        )
        .unwrap();
        Harness {
            executor,
            user_admin,
            _cgroup_dir: cgroup_dir,
        }
    }

    fn start_args(job_id: i32, task_id: i32, command_line: &str) -> StartJobAndTaskArgs {
        StartJobAndTaskArgs {
            job_id,
            task_id,
            user_name: String::new(),
            password: String::new(),
            private_key: String::new(),
            public_key: String::new(),
            start_info: ProcessStartInfo {
                command_line: command_line.to_string(),
                ..Default::default()
            },
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn simple_echo_reports_completion() {
        let mut server = mockito::Server::new_async().await;
        let callback = server
            .mock("POST", "/api/cn-test/taskcompleted")
            .match_body(Matcher::PartialJson(json!({
                "JobId": 1,
                "TaskId": 1,
                "ExitCode": 0,
                "Exited": true,
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let harness = harness(Vec::new());
        let result = harness
            .executor
            .start_job_and_task(
                start_args(1, 1, "echo hello"),
                format!("{}/api/cn-test/taskcompleted", server.url()),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({}));

        // No user was requested: the task runs as root, nothing is created.
        assert_eq!(harness.executor.job_user(1).as_deref(), Some("root"));
        assert!(harness.user_admin.created.lock().unwrap().is_empty());

        let executor = Arc::clone(&harness.executor);
        wait_until(
            || !executor.has_task(1, 1) && executor.process_count() == 0,
            "task completion",
        )
        .await;
        callback.assert_async().await;
        assert!(!harness.executor.resync_requested());
    }

    #[tokio::test]
    async fn admin_without_mapping_runs_as_root() {
        let harness = harness(Vec::new());
        let mut args = start_args(2, 1, "echo hi");
        args.user_name = "CONTOSO\\Admin".into();
        args.private_key = "key".into();
        args.start_info
            .environment_variables
            .insert(env::IS_ADMIN.into(), "1".into());

        harness
            .executor
            .start_job_and_task(args, "https://head.invalid/cb".into())
            .await
            .unwrap();

        assert_eq!(harness.executor.job_user(2).as_deref(), Some("root"));
        assert!(harness.user_admin.created.lock().unwrap().is_empty());
        assert!(harness.user_admin.installed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mapped_admin_gets_local_user_and_keys() {
        let harness = harness(Vec::new());
        let mut args = start_args(3, 1, "echo hi");
        args.user_name = "CONTOSO\\Admin".into();
        args.private_key = "key".into();
        args.start_info
            .environment_variables
            .insert(env::IS_ADMIN.into(), "1".into());
        args.start_info
            .environment_variables
            .insert(env::MAP_ADMIN_USER.into(), "1".into());

        harness
            .executor
            .start_job_and_task(args, "https://head.invalid/cb".into())
            .await
            .unwrap();

        assert_eq!(harness.executor.job_user(3).as_deref(), Some("Admin"));
        assert_eq!(
            harness.user_admin.created.lock().unwrap().as_slice(),
            &[("Admin".to_string(), true)]
        );
        assert_eq!(
            harness.user_admin.installed.lock().unwrap().as_slice(),
            &["Admin".to_string()]
        );
    }

    #[tokio::test]
    async fn preserve_domain_keeps_qualified_name() {
        let harness = harness(Vec::new());
        let mut args = start_args(4, 1, "echo hi");
        args.user_name = "CONTOSO\\alice".into();
        args.start_info
            .environment_variables
            .insert(env::PRESERVE_DOMAIN.into(), "1".into());

        harness
            .executor
            .start_job_and_task(args, "https://head.invalid/cb".into())
            .await
            .unwrap();

        assert_eq!(
            harness.executor.job_user(4).as_deref(),
            Some("CONTOSO\\alice")
        );
    }

    #[tokio::test]
    async fn requested_root_is_renamed() {
        let harness = harness(Vec::new());
        let mut args = start_args(5, 1, "echo hi");
        args.user_name = "root".into();

        harness
            .executor
            .start_job_and_task(args, "https://head.invalid/cb".into())
            .await
            .unwrap();

        assert_eq!(
            harness.executor.job_user(5).as_deref(),
            Some(FAKED_ROOT_USER)
        );
        assert_eq!(
            harness.user_admin.created.lock().unwrap().as_slice(),
            &[(FAKED_ROOT_USER.to_string(), false)]
        );
    }

    #[tokio::test]
    async fn start_task_for_unknown_job_rolls_back() {
        let harness = harness(Vec::new());
        let result = harness
            .executor
            .start_task(
                StartTaskArgs {
                    job_id: 9,
                    task_id: 1,
                    start_info: ProcessStartInfo {
                        command_line: "echo hi".into(),
                        ..Default::default()
                    },
                },
                "https://head.invalid/cb".into(),
            )
            .await;

        assert_matches!(result, Err(Error::UnknownJob(9)));
        assert!(!harness.executor.has_task(9, 1));
    }

    #[tokio::test]
    async fn end_task_for_unknown_task_is_idempotent() {
        let harness = harness(Vec::new());
        let result = harness
            .executor
            .end_task(
                EndTaskArgs {
                    job_id: 9,
                    task_id: 9,
                    task_cancel_grace_period_seconds: 0,
                },
                "https://head.invalid/cb".into(),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn mpi_placeholder_has_no_process() {
        let harness = harness(Vec::new());
        harness
            .executor
            .start_job_and_task(start_args(6, 1, ""), "https://head.invalid/cb".into())
            .await
            .unwrap();

        assert!(harness.executor.has_task(6, 1));
        assert_eq!(harness.executor.process_count(), 0);

        let result = harness
            .executor
            .end_task(
                EndTaskArgs {
                    job_id: 6,
                    task_id: 1,
                    task_cancel_grace_period_seconds: 30,
                },
                "https://head.invalid/cb".into(),
            )
            .await
            .unwrap();

        // No process and no stats: the task is removed immediately.
        assert!(!harness.executor.has_task(6, 1));
        assert_eq!(result["ExitCode"], json!(END_TASK_EXIT_CODE));
        assert_eq!(result["Exited"], json!(true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn grace_period_defeats_sigterm_trap() {
        let mut server = mockito::Server::new_async().await;
        let callback = server
            .mock("POST", "/api/cn-test/taskcompleted")
            .match_body(Matcher::PartialJson(json!({
                "JobId": 7,
                "TaskId": 1,
                "ExitCode": END_TASK_EXIT_CODE,
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let harness = harness(Vec::new());
        let callback_uri = format!("{}/api/cn-test/taskcompleted", server.url());
        harness
            .executor
            .start_job_and_task(
                start_args(7, 1, "trap '' TERM; while true; do sleep 1; done"),
                callback_uri.clone(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let body = harness
            .executor
            .end_task(
                EndTaskArgs {
                    job_id: 7,
                    task_id: 1,
                    task_cancel_grace_period_seconds: 1,
                },
                callback_uri,
            )
            .await
            .unwrap();

        // The task survived SIGTERM, so EndTask armed the grace timer.
        assert_eq!(body["Exited"], json!(false));
        assert!(harness.executor.has_task(7, 1));

        let executor = Arc::clone(&harness.executor);
        wait_until(|| !executor.has_task(7, 1), "forced kill after grace").await;
        callback.assert_async().await;
    }

    #[tokio::test]
    async fn callback_failure_triggers_resync_and_cache_invalidation() {
        let mut server = mockito::Server::new_async().await;
        // The completion callback URI resolves through the naming service.
        let naming_mock = server
            .mock("GET", "/SchedulerNode")
            .with_status(200)
            .with_body(format!("\"{}\"", server.url()))
            .expect(2)
            .create_async()
            .await;
        let callback = server
            .mock("POST", "/api/cn-test/taskcompleted")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let harness = harness(Vec::from([Url::parse(&server.url()).unwrap()]));
        harness
            .executor
            .start_job_and_task(
                start_args(8, 1, "echo hello"),
                "{SchedulerNode}/api/cn-test/taskcompleted".into(),
            )
            .await
            .unwrap();

        let executor = Arc::clone(&harness.executor);
        wait_until(|| executor.resync_requested(), "resync request").await;
        callback.assert_async().await;

        // The cache was invalidated: the next resolve goes back to the
        // naming service.
        harness
            .executor
            .naming()
            .resolve("SchedulerNode")
            .await
            .unwrap();
        naming_mock.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn end_job_terminates_tasks_and_releases_user() {
        let harness = harness(Vec::new());

        let mut first = start_args(10, 1, "sleep 30");
        first.user_name = "CONTOSO\\worker".into();
        first.private_key = "key".into();
        first.public_key = "pub".into();
        harness
            .executor
            .start_job_and_task(first, "https://head.invalid/cb".into())
            .await
            .unwrap();

        let mut second = start_args(11, 1, "sleep 30");
        second.user_name = "CONTOSO\\worker".into();
        second.private_key = "key".into();
        second.public_key = "pub".into();
        harness
            .executor
            .start_job_and_task(second, "https://head.invalid/cb".into())
            .await
            .unwrap();

        assert_eq!(harness.executor.user_job_count("worker"), 2);

        let body = harness
            .executor
            .end_job(EndJobArgs { job_id: 10 })
            .await
            .unwrap();
        assert_eq!(body["JobId"], json!(10));
        assert_eq!(body["Tasks"][0]["ExitCode"], json!(END_JOB_EXIT_CODE));
        assert!(!harness.executor.has_task(10, 1));

        // The user is still referenced by job 11: no key removal yet.
        assert_eq!(harness.executor.user_job_count("worker"), 1);
        assert!(harness.user_admin.removed.lock().unwrap().is_empty());

        harness
            .executor
            .end_job(EndJobArgs { job_id: 11 })
            .await
            .unwrap();
        assert_eq!(harness.executor.user_job_count("worker"), 0);
        let removed = harness.user_admin.removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "worker");
        assert!(removed[0].1.private_key_added);
    }

    #[tokio::test]
    async fn ping_restarts_heartbeat_only_on_change() {
        let harness = harness(Vec::new());

        // Same endpoint: nothing to restart.
        harness
            .executor
            .ping("https://head.invalid/api/cn-test/computenodereported".into())
            .await
            .unwrap();
        assert!(!harness.executor.heartbeat_running().await);

        harness
            .executor
            .ping("https://head2.invalid/api/cn-test/computenodereported".into())
            .await
            .unwrap();
        assert!(harness.executor.heartbeat_running().await);
        assert_eq!(
            harness.executor.config.heartbeat_uri(),
            "https://head2.invalid/api/cn-test/computenodereported"
        );
    }

    #[tokio::test]
    async fn metric_extracts_node_uuid() {
        let harness = harness(Vec::new());
        let uuid = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";

        harness
            .executor
            .metric(format!("udp://head.invalid:9100/api/{uuid}/metricreported"))
            .await
            .unwrap();

        assert!(harness.executor.metric_running().await);
        assert_eq!(
            harness.executor.monitor().node_uuid(),
            Some(Uuid::parse_str(uuid).unwrap())
        );
    }

    #[tokio::test]
    async fn invalid_metric_uri_is_rejected() {
        let harness = harness(Vec::new());
        assert_matches!(
            harness
                .executor
                .metric("udp://head.invalid:9100/api/not-a-guid/metricreported".into())
                .await,
            Err(Error::InvalidMetricUri(_))
        );
    }

    #[tokio::test]
    async fn peek_output_returns_task_stdout() {
        let harness = harness(Vec::new());
        harness
            .executor
            .start_job_and_task(
                start_args(12, 1, "echo peeked; sleep 5"),
                "https://head.invalid/cb".into(),
            )
            .await
            .unwrap();

        let mut peeked = String::new();
        for _ in 0..100 {
            let output = harness
                .executor
                .peek_task_output(PeekTaskOutputArgs {
                    job_id: 12,
                    task_id: 1,
                })
                .await
                .unwrap();
            peeked = output.as_str().unwrap_or_default().to_string();
            if peeked.contains("peeked") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(peeked.contains("peeked"), "peeked = {peeked:?}");

        harness
            .executor
            .end_job(EndJobArgs { job_id: 12 })
            .await
            .unwrap();
    }
}
