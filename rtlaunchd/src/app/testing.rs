// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! In-process fakes for the ports, shared by unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{
    ClockPort, ExecCapture, JobStorePort, LocalFilesystemPort, NetworkProbePort, RemoteEntry,
    RemoteSession, SessionConnectorPort, VpnPort, VpnStatus,
};
use crate::app::types::{
    Address, Credentials, HostProfile, Job, JobTransition, NewJob, Protocol, SchedulerFamily,
    VpnProfile,
};

pub(crate) fn host_profile(name: &str) -> HostProfile {
    HostProfile {
        name: name.to_string(),
        user: "ada".to_string(),
        credentials: Credentials {
            password: Some("secret".to_string()),
            key_path: None,
            key_password: None,
        },
        protocol: Protocol::Ssh,
        address: Address::Hostname(format!("{name}.example.org")),
        port: 22,
        vpn: None,
        scratch_path: "/scratch/ada".to_string(),
        output_path: None,
        has_scheduler: false,
        scheduler_family: SchedulerFamily::Pbs,
        mpi_command: None,
        force_process_binding: false,
        use_hyperthreading: false,
        maximum_walltime: None,
        preferred_walltime: None,
        cores_per_node: None,
        threads_per_core: None,
        modules: Vec::new(),
        simulator: "skirt".to_string(),
        minimum_free_space_mb: None,
    }
}

pub(crate) fn vpn_profile(not_required_for_domain: Option<&str>) -> VpnProfile {
    VpnProfile {
        service: "UGent VPN".to_string(),
        user: Some("ada".to_string()),
        password: Some("vpn-secret".to_string()),
        secret: None,
        prompt_delay: Duration::from_secs(5),
        not_required_for_domain: not_required_for_domain.map(str::to_string),
    }
}

pub(crate) fn capture(exit_code: i32, stdout: &str, stderr: &str) -> AppResult<ExecCapture> {
    Ok(ExecCapture {
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code,
    })
}

pub(crate) fn connection_lost() -> AppError {
    AppError::with_message(
        AppErrorKind::Remote,
        codes::REMOTE_ERROR,
        "ssh exec failed: channel closed",
    )
}

type ExecHandler = dyn Fn(&str) -> AppResult<ExecCapture> + Send + Sync;

/// Remote session answering commands through a handler, with an in-memory
/// remote filesystem for transfers.
pub(crate) struct FakeSession {
    handler: Box<ExecHandler>,
    commands: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    closed: AtomicBool,
}

impl FakeSession {
    pub(crate) fn new(
        handler: impl Fn(&str) -> AppResult<ExecCapture> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            commands: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            uploads: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn silent() -> Arc<Self> {
        Self::new(|_| capture(0, "", ""))
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    pub(crate) fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|cmd| cmd.starts_with(prefix))
    }

    pub(crate) fn put_file(&self, path: &str, contents: &[u8]) {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_string(), contents.to_vec());
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    pub(crate) fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().expect("uploads lock").clone()
    }

    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture> {
        self.commands
            .lock()
            .expect("commands lock")
            .push(command.to_string());
        (self.handler)(command)
    }

    async fn create_dir_all(&self, remote_dir: &str) -> AppResult<()> {
        self.dirs
            .lock()
            .expect("dirs lock")
            .insert(remote_dir.trim_end_matches('/').to_string());
        Ok(())
    }

    async fn write_file(&self, remote_path: &str, contents: &[u8], _mode: u32) -> AppResult<()> {
        self.put_file(remote_path, contents);
        Ok(())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> AppResult<()> {
        self.uploads
            .lock()
            .expect("uploads lock")
            .push((local_path.to_path_buf(), remote_path.to_string()));
        Ok(())
    }

    async fn list_dir(&self, remote_dir: &str) -> AppResult<Vec<RemoteEntry>> {
        let base = format!("{}/", remote_dir.trim_end_matches('/'));
        let files = self.files.lock().expect("files lock");
        let entries: Vec<RemoteEntry> = files
            .iter()
            .filter_map(|(path, contents)| {
                let name = path.strip_prefix(&base)?;
                (!name.contains('/')).then(|| RemoteEntry {
                    name: name.to_string(),
                    is_dir: false,
                    size: contents.len() as u64,
                })
            })
            .collect();
        let known_dir = self
            .dirs
            .lock()
            .expect("dirs lock")
            .contains(remote_dir.trim_end_matches('/'));
        if entries.is_empty() && !known_dir {
            return Err(AppError::with_message(
                AppErrorKind::NotFound,
                codes::REMOTE_ERROR,
                format!("no such directory: {remote_dir}"),
            ));
        }
        Ok(entries)
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> AppResult<()> {
        let Some(contents) = self.file(remote_path) else {
            return Err(AppError::with_message(
                AppErrorKind::NotFound,
                codes::REMOTE_ERROR,
                format!("no such file: {remote_path}"),
            ));
        };
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).expect("create local dir");
        }
        std::fs::write(local_path, contents).expect("write local file");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out one shared fake session, optionally failing the
/// first few attempts with scripted errors.
pub(crate) struct FakeConnector {
    session: Arc<FakeSession>,
    failures: Mutex<VecDeque<AppError>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new(session: Arc<FakeSession>) -> Arc<Self> {
        Arc::new(Self {
            session,
            failures: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
        })
    }

    pub(crate) fn failing_first(session: Arc<FakeSession>, failures: Vec<AppError>) -> Arc<Self> {
        let connector = Self::new(session);
        *connector.failures.lock().expect("failures lock") = VecDeque::from(failures);
        connector
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnectorPort for FakeConnector {
    async fn connect(
        &self,
        _host: &HostProfile,
        _addr: SocketAddr,
    ) -> AppResult<Arc<dyn RemoteSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(err);
        }
        self.session.reopen();
        Ok(self.session.clone())
    }
}

/// VPN control that replays scripted statuses and records every call.
pub(crate) struct FakeVpn {
    domain: Option<String>,
    statuses: Mutex<VecDeque<VpnStatus>>,
    fallback: VpnStatus,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeVpn {
    pub(crate) fn new(domain: Option<&str>, statuses: Vec<VpnStatus>) -> Arc<Self> {
        Arc::new(Self {
            domain: domain.map(str::to_string),
            statuses: Mutex::new(VecDeque::from(statuses)),
            fallback: VpnStatus::Connected,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn stuck(domain: Option<&str>, status: VpnStatus) -> Arc<Self> {
        Arc::new(Self {
            domain: domain.map(str::to_string),
            statuses: Mutex::new(VecDeque::new()),
            fallback: status,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl VpnPort for FakeVpn {
    async fn local_domain(&self) -> AppResult<Option<String>> {
        self.record("local_domain");
        Ok(self.domain.clone())
    }

    async fn start(&self, _vpn: &VpnProfile) -> AppResult<()> {
        self.record("start");
        Ok(())
    }

    async fn status(&self, _vpn: &VpnProfile) -> AppResult<VpnStatus> {
        self.record("status");
        let next = self.statuses.lock().expect("statuses lock").pop_front();
        Ok(next.unwrap_or(self.fallback))
    }

    async fn answer_prompt(&self, _vpn: &VpnProfile) -> AppResult<()> {
        self.record("answer_prompt");
        Ok(())
    }

    async fn stop(&self, _vpn: &VpnProfile) -> AppResult<()> {
        self.record("stop");
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeNetwork;

#[async_trait]
impl NetworkProbePort for FakeNetwork {
    async fn resolve_host_addr(&self, _address: &Address, port: u16) -> AppResult<SocketAddr> {
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    async fn check_host_reachable(&self, _address: &Address, _port: u16) -> AppResult<bool> {
        Ok(true)
    }
}

pub(crate) struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub(crate) fn new(now: OffsetDateTime) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl ClockPort for ManualClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.now.lock().expect("clock lock")
    }
}

#[derive(Default)]
pub(crate) struct PassthroughFs;

#[async_trait]
impl LocalFilesystemPort for PassthroughFs {
    async fn canonicalize(&self, path: &Path) -> AppResult<PathBuf> {
        Ok(path.to_path_buf())
    }

    async fn ensure_dir(&self, _path: &Path) -> AppResult<()> {
        Ok(())
    }
}

/// Job store kept in memory. Keeps timer-driven tests free of blocking I/O.
#[derive(Default)]
pub(crate) struct MemoryJobStore {
    jobs: Mutex<BTreeMap<i64, Job>>,
    transitions: Mutex<HashMap<i64, Vec<JobTransition>>>,
    read_only: AtomicBool,
}

impl MemoryJobStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every later insert fails as a full disk would.
    pub(crate) fn read_only() -> Arc<Self> {
        let store = Self::default();
        store.read_only.store(true, Ordering::SeqCst);
        Arc::new(store)
    }
}

#[async_trait]
impl JobStorePort for MemoryJobStore {
    async fn insert_job(&self, job: &NewJob) -> AppResult<i64> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::STORE_ERROR,
                "database or disk is full",
            ));
        }
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let id = jobs.keys().next_back().copied().unwrap_or(0) + 1;
        jobs.insert(id, Job::from_new(id, job.clone()));
        self.transitions
            .lock()
            .expect("transitions lock")
            .entry(id)
            .or_default()
            .push(JobTransition {
                state: job.state,
                recorded_at: job.submitted_at,
            });
        Ok(id)
    }

    async fn record_transition(&self, job: &Job, at: OffsetDateTime) -> AppResult<()> {
        self.save_job(job).await?;
        self.transitions
            .lock()
            .expect("transitions lock")
            .entry(job.id)
            .or_default()
            .push(JobTransition {
                state: job.state,
                recorded_at: at,
            });
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> AppResult<()> {
        let mut stored = job.clone();
        stored.progress = None;
        self.jobs.lock().expect("jobs lock").insert(job.id, stored);
        Ok(())
    }

    async fn list_jobs(&self) -> AppResult<Vec<Job>> {
        Ok(self.jobs.lock().expect("jobs lock").values().cloned().collect())
    }

    async fn transitions(&self, job_id: i64) -> AppResult<Vec<JobTransition>> {
        Ok(self
            .transitions
            .lock()
            .expect("transitions lock")
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}
