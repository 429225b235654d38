// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Drives jobs from submission to a terminal state.
//!
//! Every outstanding job gets a monitor task that polls its scheduler on a
//! fixed interval. Running jobs with a walltime also get a watchdog task
//! that signals the monitor once the budget (plus a grace period) is spent.
//! State only ever changes through the tracker, from what a poll reports or
//! from an explicit cancel or timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell, mpsc, watch};
use tokio::task::JoinHandle;

use crate::app::connection::ConnectionManager;
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes, invalid_argument};
use crate::app::ports::{ClockPort, LocalFilesystemPort, TelemetryEvent, TelemetryPort};
use crate::app::scheduler::SchedulerAdapter;
use crate::app::services::retry::{RetryPolicy, retry_transient};
use crate::app::tracker::{JobTracker, UpdateOutcome};
use crate::app::types::{
    ArtifactSet, HostProfile, Job, JobState, JobTransition, NewJob, SchedulerKind,
    SimulationBundle, Submission,
};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub poll_retry: RetryPolicy,
    /// Added to the effective walltime before the watchdog fires.
    pub walltime_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            poll_retry: RetryPolicy::default(),
            walltime_grace: Duration::from_secs(300),
        }
    }
}

struct Monitor {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<Option<JobState>>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ExecutionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    hosts: HashMap<String, HostProfile>,
    connections: Arc<ConnectionManager>,
    tracker: Arc<JobTracker>,
    clock: Arc<dyn ClockPort>,
    fs: Arc<dyn LocalFilesystemPort>,
    telemetry: Arc<dyn TelemetryPort>,
    settings: OrchestratorSettings,
    started: OnceCell<()>,
    monitors: Mutex<HashMap<i64, Monitor>>,
}

impl ExecutionOrchestrator {
    pub fn new(
        hosts: Vec<HostProfile>,
        connections: Arc<ConnectionManager>,
        tracker: Arc<JobTracker>,
        clock: Arc<dyn ClockPort>,
        fs: Arc<dyn LocalFilesystemPort>,
        telemetry: Arc<dyn TelemetryPort>,
        settings: OrchestratorSettings,
    ) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|host| (host.name.clone(), host))
            .collect();
        Self {
            inner: Arc::new(Inner {
                hosts,
                connections,
                tracker,
                clock,
                fs,
                telemetry,
                settings,
                started: OnceCell::new(),
                monitors: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Load persisted jobs and re-poll every outstanding one, then resume
    /// monitoring. Runs once; every other entry point waits for it.
    pub async fn start(&self) -> AppResult<()> {
        let inner = self.inner.clone();
        self.inner
            .started
            .get_or_try_init(|| inner.reconcile())
            .await?;
        Ok(())
    }

    pub fn hosts(&self) -> Vec<&HostProfile> {
        let mut hosts: Vec<&HostProfile> = self.inner.hosts.values().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    #[tracing::instrument(
        name = "orchestrator",
        level = "info",
        skip(self, submission),
        fields(op = "submit", host = %host_name)
    )]
    pub async fn submit(&self, submission: Submission, host_name: &str) -> AppResult<i64> {
        self.start().await?;
        let inner = &self.inner;
        let host = inner.host(host_name)?;
        let submission = Submission {
            bundle: inner.resolve_bundle(&submission.bundle).await?,
            ..submission
        };
        let adapter = SchedulerAdapter::for_host(host);
        let mut new = adapter.prepare(host, &submission, inner.clock.now_utc())?;

        let lease = inner.connections.acquire(host).await?;
        if let Err(err) = adapter
            .submit(lease.session(), host, &submission, &mut new)
            .await
        {
            if err.is_transient() {
                lease.discard().await;
            }
            return Err(err.with_context(host_name.to_string()));
        }
        drop(lease);

        let job = match inner.tracker.register(new.clone()).await {
            Ok(job) => job,
            Err(err) => {
                inner.abandon_unrecorded(host, adapter, new).await;
                return Err(err);
            }
        };
        inner.telemetry.event(
            "submitted",
            TelemetryEvent {
                host: Some(job.host_name.clone()),
                job_id: Some(job.id),
                job_name: Some(job.name.clone()),
                state: Some(job.state.as_str()),
                detail: job.scheduler_id.clone(),
            },
        );
        inner.spawn_monitor(&job, host.clone()).await;
        Ok(job.id)
    }

    pub async fn status(&self, id: i64) -> AppResult<JobState> {
        Ok(self.job(id).await?.state)
    }

    pub async fn job(&self, id: i64) -> AppResult<Job> {
        self.start().await?;
        self.inner.tracker.get(id).await
    }

    /// Cancel a job. A job that already reached a terminal state is left as
    /// it is. Returns once the job is recorded as finished.
    pub async fn cancel(&self, id: i64) -> AppResult<()> {
        self.start().await?;
        let job = self.inner.tracker.get(id).await?;
        if job.state.is_terminal() {
            tracing::debug!(job_id = id, state = %job.state, "cancel on finished job ignored");
            return Ok(());
        }
        let done = {
            let monitors = self.inner.monitors.lock().await;
            monitors.get(&id).map(|monitor| {
                monitor.cancel.send_replace(true);
                monitor.done.clone()
            })
        };
        match done {
            Some(done) => {
                wait_done(done).await;
                Ok(())
            }
            None => self.inner.cancel_unmonitored(id).await,
        }
    }

    /// Artifacts of a succeeded job, fetching them when an earlier
    /// automatic retrieval did not complete.
    pub async fn output(&self, id: i64) -> AppResult<ArtifactSet> {
        self.start().await?;
        let inner = &self.inner;
        let job = inner.tracker.get(id).await?;
        match job.state {
            JobState::Succeeded => {}
            state if !state.is_terminal() => {
                return Err(AppError::with_message(
                    AppErrorKind::Output,
                    codes::JOB_NOT_FINISHED,
                    format!("job {id} is still {state}"),
                ));
            }
            state => {
                return Err(AppError::with_message(
                    AppErrorKind::Output,
                    codes::OUTPUT_MISSING,
                    format!("job {id} ended {state} and has no output"),
                ));
            }
        }
        if let Some(artifacts) = job.artifacts.clone() {
            return Ok(artifacts);
        }
        let host = inner.host(&job.host_name)?;
        inner
            .retrieve(host, SchedulerAdapter::for_kind(job.kind), &job)
            .await
    }

    /// Jobs on one host, or on all hosts, oldest first.
    pub async fn list(&self, host: Option<&str>) -> AppResult<Vec<Job>> {
        self.start().await?;
        Ok(match host {
            Some(host) => self.inner.tracker.list(host).await,
            None => self.inner.tracker.list_all().await,
        })
    }

    pub async fn history(&self, id: i64) -> AppResult<Vec<JobTransition>> {
        self.start().await?;
        self.inner.tracker.history(id).await
    }

    /// Wait for a job to reach a terminal state.
    pub async fn wait(&self, id: i64) -> AppResult<JobState> {
        self.start().await?;
        let done = {
            let monitors = self.inner.monitors.lock().await;
            monitors.get(&id).map(|monitor| monitor.done.clone())
        };
        if let Some(done) = done {
            wait_done(done).await;
        }
        Ok(self.inner.tracker.get(id).await?.state)
    }

    /// Wait until no job is being monitored.
    pub async fn wait_all(&self) -> AppResult<()> {
        self.start().await?;
        loop {
            let pending: Vec<watch::Receiver<Option<JobState>>> = {
                let monitors = self.inner.monitors.lock().await;
                monitors.values().map(|monitor| monitor.done.clone()).collect()
            };
            if pending.is_empty() {
                return Ok(());
            }
            for done in pending {
                wait_done(done).await;
            }
        }
    }

    /// Stop monitoring and close every session. Outstanding jobs stay
    /// persisted and are picked up again by the next `start`.
    pub async fn shutdown(&self) {
        let monitors: Vec<Monitor> = {
            let mut monitors = self.inner.monitors.lock().await;
            monitors.drain().map(|(_, monitor)| monitor).collect()
        };
        for monitor in monitors {
            monitor.task.abort();
        }
        self.inner.connections.close_all().await;
    }
}

async fn wait_done(mut done: watch::Receiver<Option<JobState>>) {
    while done.borrow_and_update().is_none() {
        if done.changed().await.is_err() {
            break;
        }
    }
}

impl Inner {
    fn host(&self, name: &str) -> AppResult<&HostProfile> {
        self.hosts.get(name).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::UNKNOWN_HOST,
                format!("no host profile named {name}"),
            )
        })
    }

    async fn resolve_bundle(&self, bundle: &SimulationBundle) -> AppResult<SimulationBundle> {
        let description = self.fs.canonicalize(&bundle.description).await.map_err(|err| {
            invalid_argument(format!(
                "simulation description {}: {}",
                bundle.description.display(),
                err.message()
            ))
        })?;
        let mut inputs = Vec::with_capacity(bundle.inputs.len());
        for input in &bundle.inputs {
            inputs.push(self.fs.canonicalize(input).await.map_err(|err| {
                invalid_argument(format!("input {}: {}", input.display(), err.message()))
            })?);
        }
        self.fs.ensure_dir(&bundle.local_output_dir).await?;
        Ok(SimulationBundle {
            description,
            inputs,
            local_output_dir: bundle.local_output_dir.clone(),
        })
    }

    async fn reconcile(self: Arc<Self>) -> AppResult<()> {
        let loaded = self.tracker.load().await?;
        let outstanding = self.tracker.outstanding().await;
        tracing::info!(
            jobs = loaded,
            outstanding = outstanding.len(),
            "reconciling persisted jobs"
        );
        for job in outstanding {
            let Some(host) = self.hosts.get(&job.host_name).cloned() else {
                tracing::warn!(job_id = job.id, host = %job.host_name, "job belongs to an unknown host; not monitored");
                self.tracker.set_degraded(job.id, true).await?;
                continue;
            };
            let adapter = SchedulerAdapter::for_kind(job.kind);
            let polled = self.poll(&host, adapter, &job).await;
            self.record_poll(&job, polled).await;
            let job = self.tracker.get(job.id).await?;
            if job.state.is_terminal() {
                self.finalize(&host, adapter, &job).await;
            } else {
                self.spawn_monitor(&job, host).await;
            }
        }
        Ok(())
    }

    async fn spawn_monitor(self: &Arc<Self>, job: &Job, host: HostProfile) {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(&job.id) {
            return;
        }
        let (cancel, cancel_rx) = watch::channel(false);
        let (done_tx, done) = watch::channel(None);
        let task = tokio::spawn(self.clone().monitor(job.id, host, cancel_rx, done_tx));
        monitors.insert(job.id, Monitor { cancel, done, task });
    }

    async fn monitor(
        self: Arc<Self>,
        job_id: i64,
        host: HostProfile,
        mut cancel_rx: watch::Receiver<bool>,
        done_tx: watch::Sender<Option<JobState>>,
    ) {
        let finished = self.drive(job_id, &host, &mut cancel_rx).await;
        if let Some(job) = &finished {
            self.finalize(&host, SchedulerAdapter::for_kind(job.kind), job)
                .await;
        }
        done_tx.send_replace(finished.map(|job| job.state));
        self.monitors.lock().await.remove(&job_id);
    }

    /// Poll until the job is terminal. Returns the final job record.
    async fn drive(
        &self,
        job_id: i64,
        host: &HostProfile,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Option<Job> {
        let (timeout_tx, mut timeout_rx) = mpsc::channel::<()>(1);
        let mut watchdog: Option<JoinHandle<()>> = None;
        let finished = loop {
            let job = match self.tracker.get(job_id).await {
                Ok(job) => job,
                Err(err) => {
                    tracing::error!(job_id, "monitored job vanished: {err}");
                    break None;
                }
            };
            if job.state.is_terminal() {
                break Some(job);
            }
            if watchdog.is_none() && job.state == JobState::Running {
                watchdog = self.arm_watchdog(&job, timeout_tx.clone());
            }
            let adapter = SchedulerAdapter::for_kind(job.kind);

            tokio::select! {
                biased;
                Ok(()) = cancel_rx.changed() => {
                    tracing::info!(job_id, "cancel requested");
                    self.stop(host, adapter, &job, JobState::Cancelled).await;
                }
                Some(()) = timeout_rx.recv() => {
                    tracing::warn!(job_id, host = %host.name, "walltime exceeded, cancelling");
                    self.stop(host, adapter, &job, JobState::TimedOut).await;
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {
                    tokio::select! {
                        biased;
                        Ok(()) = cancel_rx.changed() => {
                            tracing::info!(job_id, "cancel requested during poll");
                            self.stop(host, adapter, &job, JobState::Cancelled).await;
                        }
                        polled = self.poll(host, adapter, &job) => {
                            self.record_poll(&job, polled).await;
                        }
                    }
                }
            }
        };
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        finished
    }

    /// Watchdog for a running job: fires at running_since + walltime +
    /// grace, measured on the orchestrator's own clock.
    fn arm_watchdog(&self, job: &Job, timeout_tx: mpsc::Sender<()>) -> Option<JoinHandle<()>> {
        let walltime = job.walltime?;
        let started = job.running_since.unwrap_or(job.submitted_at);
        let elapsed =
            Duration::try_from(self.clock.now_utc() - started).unwrap_or(Duration::ZERO);
        let remaining = walltime
            .saturating_add(self.settings.walltime_grace)
            .saturating_sub(elapsed);
        tracing::debug!(job_id = job.id, remaining_secs = remaining.as_secs(), "walltime watchdog armed");
        Some(tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let _ = timeout_tx.send(()).await;
        }))
    }

    async fn poll(
        &self,
        host: &HostProfile,
        adapter: SchedulerAdapter,
        job: &Job,
    ) -> AppResult<(JobState, Option<String>)> {
        retry_transient(&self.settings.poll_retry, "poll", || {
            self.poll_once(host, adapter, job)
        })
        .await
    }

    async fn poll_once(
        &self,
        host: &HostProfile,
        adapter: SchedulerAdapter,
        job: &Job,
    ) -> AppResult<(JobState, Option<String>)> {
        let lease = self.connections.acquire(host).await?;
        let state = match adapter
            .poll_status(lease.session(), job, self.clock.now_utc())
            .await
        {
            Ok(state) => state,
            Err(err) => {
                if err.is_transient() {
                    lease.discard().await;
                }
                return Err(err);
            }
        };
        let mut progress = None;
        if state == JobState::Running && job.kind == SchedulerKind::Direct {
            match adapter.progress(lease.session(), job).await {
                Ok(found) => progress = found.map(|p| p.to_string()),
                Err(err) => tracing::debug!(job_id = job.id, "progress unavailable: {err}"),
            }
        }
        Ok((state, progress))
    }

    async fn record_poll(&self, job: &Job, polled: AppResult<(JobState, Option<String>)>) {
        match polled {
            Ok((state, progress)) => {
                if job.degraded {
                    if let Err(err) = self.tracker.set_degraded(job.id, false).await {
                        tracing::warn!(job_id = job.id, "failed to clear degraded flag: {err}");
                    }
                }
                if let Some(progress) = progress {
                    tracing::debug!(job_id = job.id, %progress, "simulation progress");
                    if let Err(err) = self.tracker.set_progress(job.id, Some(progress)).await {
                        tracing::debug!(job_id = job.id, "failed to record progress: {err}");
                    }
                }
                self.apply(job, state).await;
            }
            Err(err) => {
                tracing::warn!(
                    event = "degraded_poll",
                    job_id = job.id,
                    host = %job.host_name,
                    state = %job.state,
                    code = err.code(),
                    "poll failed, keeping last known state: {err}"
                );
                if let Err(store_err) = self.tracker.set_degraded(job.id, true).await {
                    tracing::warn!(job_id = job.id, "failed to flag degraded poll: {store_err}");
                }
                self.telemetry.event(
                    "degraded_poll",
                    TelemetryEvent {
                        host: Some(job.host_name.clone()),
                        job_id: Some(job.id),
                        job_name: Some(job.name.clone()),
                        state: Some(job.state.as_str()),
                        detail: Some(err.to_string()),
                    },
                );
            }
        }
    }

    async fn apply(&self, job: &Job, state: JobState) {
        match self.tracker.update(job.id, state).await {
            Ok(UpdateOutcome::Changed { from }) => self.telemetry.event(
                "transition",
                TelemetryEvent {
                    host: Some(job.host_name.clone()),
                    job_id: Some(job.id),
                    job_name: Some(job.name.clone()),
                    state: Some(state.as_str()),
                    detail: Some(format!("{from} -> {state}")),
                },
            ),
            Ok(UpdateOutcome::Unchanged) => {}
            Err(err) => {
                tracing::error!(job_id = job.id, code = err.code(), "state report rejected: {err}")
            }
        }
    }

    /// Best-effort remote cancel, then record `state` regardless of whether
    /// the remote side confirmed.
    async fn stop(&self, host: &HostProfile, adapter: SchedulerAdapter, job: &Job, state: JobState) {
        if let Err(err) = self.cancel_remote(host, adapter, job).await {
            tracing::warn!(job_id = job.id, code = err.code(), "remote cancel failed: {err}");
        }
        self.apply(job, state).await;
    }

    async fn cancel_remote(
        &self,
        host: &HostProfile,
        adapter: SchedulerAdapter,
        job: &Job,
    ) -> AppResult<()> {
        let lease = self.connections.acquire(host).await?;
        let result = adapter.cancel(lease.session(), job).await;
        if result.as_ref().is_err_and(AppError::is_transient) {
            lease.discard().await;
        }
        result
    }

    /// The host accepted the run but the store did not record it. Nothing
    /// would ever monitor it, so take it down again.
    async fn abandon_unrecorded(&self, host: &HostProfile, adapter: SchedulerAdapter, new: NewJob) {
        tracing::error!(
            host = %host.name,
            run = %new.name,
            scheduler_id = ?new.scheduler_id,
            pid = ?new.remote_pid,
            remote_dir = %new.remote_dir,
            "submitted run could not be recorded, cancelling it"
        );
        let job = Job::from_new(0, new);
        if let Err(err) = self.cancel_remote(host, adapter, &job).await {
            tracing::error!(
                host = %host.name,
                scheduler_id = ?job.scheduler_id,
                pid = ?job.remote_pid,
                "run left behind on host: {err}"
            );
        }
    }

    async fn cancel_unmonitored(&self, id: i64) -> AppResult<()> {
        let job = self.tracker.get(id).await?;
        if job.state.is_terminal() {
            return Ok(());
        }
        if let Ok(host) = self.host(&job.host_name) {
            if let Err(err) = self
                .cancel_remote(host, SchedulerAdapter::for_kind(job.kind), &job)
                .await
            {
                tracing::warn!(job_id = id, "remote cancel failed: {err}");
            }
        }
        match self.tracker.update(id, JobState::Cancelled).await {
            Ok(_) => Ok(()),
            Err(err) if err.code() == codes::ILLEGAL_TRANSITION => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn finalize(&self, host: &HostProfile, adapter: SchedulerAdapter, job: &Job) {
        match job.state {
            JobState::Succeeded if job.artifacts.is_none() => {
                if let Err(err) = self.retrieve(host, adapter, job).await {
                    tracing::warn!(job_id = job.id, code = err.code(), "output retrieval failed: {err}");
                }
            }
            JobState::Succeeded => {}
            state => {
                tracing::warn!(job_id = job.id, host = %job.host_name, state = %state, "job did not succeed");
            }
        }
    }

    async fn retrieve(
        &self,
        host: &HostProfile,
        adapter: SchedulerAdapter,
        job: &Job,
    ) -> AppResult<ArtifactSet> {
        self.fs.ensure_dir(&job.local_output_dir).await?;
        let artifacts = retry_transient(&self.settings.poll_retry, "fetch_output", || {
            self.fetch_once(host, adapter, job)
        })
        .await?;
        self.tracker.set_artifacts(job.id, artifacts.clone()).await?;
        tracing::info!(job_id = job.id, files = artifacts.files.len(), root = %artifacts.root.display(), "output retrieved");
        self.telemetry.event(
            "output_retrieved",
            TelemetryEvent {
                host: Some(job.host_name.clone()),
                job_id: Some(job.id),
                job_name: Some(job.name.clone()),
                state: Some(job.state.as_str()),
                detail: Some(artifacts.root.display().to_string()),
            },
        );
        Ok(artifacts)
    }

    async fn fetch_once(
        &self,
        host: &HostProfile,
        adapter: SchedulerAdapter,
        job: &Job,
    ) -> AppResult<ArtifactSet> {
        let lease = self.connections.acquire(host).await?;
        let result = adapter.fetch_output(lease.session(), job).await;
        if result.as_ref().is_err_and(AppError::is_transient) {
            lease.discard().await;
        }
        result
    }
}
