// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use russh::client::Handle;
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::fs as tokiofs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes, local_error};
use crate::app::ports::{ExecCapture, RemoteEntry, RemoteSession};
use crate::app::services::shell::remote_join;

use super::SshError;

/// russh client handler; only host key verification is customized.
#[derive(Clone, Debug)]
pub(super) struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts_path: Option<PathBuf>,
}

impl ClientHandler {
    pub(super) fn new(host: String, addr: SocketAddr, known_hosts_path: Option<PathBuf>) -> Self {
        Self {
            host,
            addr,
            known_hosts_path,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        verify_server_key(
            &self.host,
            self.addr,
            server_public_key,
            self.known_hosts_path.as_deref(),
        )
    }
}

fn check_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> Result<bool, russh::keys::Error> {
    match known_hosts_path {
        Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
        None => russh::keys::check_known_hosts(host, port, key),
    }
}

/// Accept keys already in known_hosts (by name, then by address) and learn
/// unseen ones. A changed key is rejected.
fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> Result<bool, SshError> {
    let port = addr.port();
    let reject = |err: russh::keys::Error| {
        tracing::warn!(host, port, error = %err, "server key validation failed");
        SshError::HostKey {
            host: host.to_string(),
            port,
            reason: err.to_string(),
        }
    };

    if check_known_hosts_for(host, port, key, known_hosts_path).map_err(reject)? {
        return Ok(true);
    }
    let ip_host = addr.ip().to_string();
    if ip_host != host && check_known_hosts_for(&ip_host, port, key, known_hosts_path).map_err(reject)? {
        return Ok(true);
    }

    tracing::info!(host, port, "server key not in known_hosts; learning it");
    let learned = match known_hosts_path {
        Some(path) => learn_known_hosts_path(host, port, key, path),
        None => learn_known_hosts(host, port, key),
    };
    learned.map_err(reject)?;
    Ok(true)
}

/// Returns true once the channel is closed.
fn handle_capture_message(
    msg: &ChannelMsg,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
    code: &mut Option<i32>,
) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            out.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            err.extend_from_slice(data);
            false
        }
        ChannelMsg::ExitStatus { exit_status } => {
            *code = Some(*exit_status as i32);
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

/// Cumulative prefixes of a remote path: `/a/b` gives `/a`, `/a/b`.
fn remote_dir_prefixes(remote_dir: &str) -> Vec<String> {
    let absolute = remote_dir.starts_with('/');
    let mut current = String::new();
    let mut out = Vec::new();
    for part in remote_dir.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !current.is_empty() || absolute {
            current.push('/');
        }
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

fn relative_remote(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn map_session_error(op: &str, err: SshError) -> AppError {
    if err.is_missing_path() {
        return AppError::with_message(
            AppErrorKind::NotFound,
            codes::REMOTE_ERROR,
            format!("{op}: remote path does not exist"),
        );
    }
    AppError::with_message(
        AppErrorKind::Remote,
        codes::REMOTE_ERROR,
        format!("{op} failed: {err}"),
    )
}

/// One authenticated SSH connection. Commands and transfers share it; the
/// handle lock is held for the duration of a command.
pub struct SshSession {
    host: String,
    handle: Arc<Mutex<Option<Handle<ClientHandler>>>>,
    keepalive: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SshSession {
    pub(super) fn start(
        host: String,
        handle: Handle<ClientHandler>,
        keepalive_interval: Option<Duration>,
    ) -> Self {
        let handle = Arc::new(Mutex::new(Some(handle)));
        let keepalive = keepalive_interval.map(|interval| {
            let handle = handle.clone();
            let host = host.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let guard = handle.lock().await;
                    let Some(handle) = guard.as_ref() else {
                        break;
                    };
                    if handle.is_closed() {
                        tracing::debug!(host = %host, "keepalive stopped; connection closed");
                        break;
                    }
                    if let Err(err) = handle.send_keepalive(true).await {
                        tracing::debug!(host = %host, error = %err, "keepalive failed");
                    }
                }
            })
        });
        Self {
            host,
            handle,
            keepalive: std::sync::Mutex::new(keepalive),
            closed: AtomicBool::new(false),
        }
    }

    async fn sftp(&self) -> Result<SftpSession, SshError> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or(SshError::Closed)?;
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    async fn run(&self, command: &str) -> Result<ExecCapture, SshError> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or(SshError::Closed)?;
        let mut chan = handle.channel_open_session().await?;
        tracing::debug!(host = %self.host, "executing '{command}'");
        chan.exec(true, command).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut code = None;
        while let Some(msg) = chan.wait().await {
            if handle_capture_message(&msg, &mut stdout, &mut stderr, &mut code) {
                break;
            }
        }
        let _ = chan.close().await;
        Ok(ExecCapture {
            stdout,
            stderr,
            // Killed by a signal: no exit status is sent.
            exit_code: code.unwrap_or(-1),
        })
    }

    async fn ensure_dir(sftp: &SftpSession, remote_dir: &str) -> Result<(), SshError> {
        for cur in remote_dir_prefixes(remote_dir) {
            match sftp.metadata(&cur).await {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(SshError::Io(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!("remote path exists but is not a directory: {cur}"),
                    )));
                }
                Err(_) => {
                    if let Err(err) = sftp.create_dir(&cur).await {
                        // Lost a race with another creator.
                        if !sftp.try_exists(&cur).await.unwrap_or(false) {
                            return Err(err.into());
                        }
                        tracing::debug!(path = %cur, error = %err, "directory appeared concurrently");
                    }
                }
            }
        }
        Ok(())
    }

    async fn write_remote(
        sftp: &SftpSession,
        remote_path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), SshError> {
        let flags = OpenFlags::WRITE
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        let mut file = sftp
            .open_with_flags_and_attributes(remote_path, flags, attrs.clone())
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.shutdown().await?;
        // Open attributes only apply to new files.
        if let Err(err) = sftp.set_metadata(remote_path, attrs).await {
            tracing::debug!(path = %remote_path, error = %err, "failed to set permissions");
        }
        Ok(())
    }

    async fn upload_file(
        sftp: &SftpSession,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SshError> {
        tracing::debug!("uploading {} -> {remote_path}", local_path.display());
        let mut local = tokiofs::File::open(local_path).await?;
        let flags = OpenFlags::WRITE
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        let mut remote = sftp.open_with_flags(remote_path, flags).await?;
        tokio::io::copy(&mut local, &mut remote).await?;
        remote.flush().await?;
        remote.shutdown().await?;
        Ok(())
    }

    async fn upload_tree(&self, local_path: &Path, remote_path: &str) -> Result<(), SshError> {
        let sftp = self.sftp().await?;
        let meta = tokiofs::metadata(local_path).await?;
        if !meta.is_dir() {
            return Self::upload_file(&sftp, local_path, remote_path).await;
        }

        let root = local_path.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .map(|entry| {
                    let entry = entry.map_err(std::io::Error::from)?;
                    let rel = entry
                        .path()
                        .strip_prefix(&root)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| PathBuf::from(entry.file_name()));
                    Ok((entry.path().to_path_buf(), rel, entry.file_type().is_dir()))
                })
                .collect::<Result<Vec<_>, std::io::Error>>()
        })
        .await
        .map_err(|err| SshError::Io(std::io::Error::other(err)))??;

        Self::ensure_dir(&sftp, remote_path).await?;
        for (local, rel, is_dir) in entries {
            let remote = remote_join(remote_path, &relative_remote(&rel));
            if is_dir {
                Self::ensure_dir(&sftp, &remote).await?;
            } else {
                Self::upload_file(&sftp, &local, &remote).await?;
            }
        }
        Ok(())
    }

    async fn read_dir(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>, SshError> {
        let sftp = self.sftp().await?;
        let entries = sftp.read_dir(remote_dir).await?;
        Ok(entries
            .filter(|entry| entry.file_name() != "." && entry.file_name() != "..")
            .map(|entry| {
                let meta = entry.metadata();
                RemoteEntry {
                    name: entry.file_name(),
                    is_dir: meta.is_dir(),
                    size: meta.size.unwrap_or(0),
                }
            })
            .collect())
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<(), SshError> {
        let sftp = self.sftp().await?;
        let mut remote = sftp.open(remote_path).await?;
        if let Some(parent) = local_path.parent() {
            tokiofs::create_dir_all(parent).await?;
        }
        let mut local = tokiofs::File::create(local_path).await?;
        tokio::io::copy(&mut remote, &mut local).await?;
        local.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, command),
        fields(op = "exec_capture", host = %self.host)
    )]
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture> {
        self.run(command)
            .await
            .map_err(|err| map_session_error("exec", err))
    }

    #[tracing::instrument(
        name = "sftp",
        level = "debug",
        skip(self),
        fields(op = "create_dir_all", host = %self.host)
    )]
    async fn create_dir_all(&self, remote_dir: &str) -> AppResult<()> {
        let result = async {
            let sftp = self.sftp().await?;
            Self::ensure_dir(&sftp, remote_dir).await
        }
        .await;
        result.map_err(|err| map_session_error("create directory", err))
    }

    #[tracing::instrument(
        name = "sftp",
        level = "debug",
        skip(self, contents),
        fields(op = "write_file", host = %self.host, bytes = contents.len())
    )]
    async fn write_file(&self, remote_path: &str, contents: &[u8], mode: u32) -> AppResult<()> {
        let result = async {
            let sftp = self.sftp().await?;
            Self::write_remote(&sftp, remote_path, contents, mode).await
        }
        .await;
        result.map_err(|err| map_session_error("write file", err))
    }

    #[tracing::instrument(
        name = "sftp",
        level = "debug",
        skip(self, local_path),
        fields(op = "upload", host = %self.host, local = %local_path.display())
    )]
    async fn upload(&self, local_path: &Path, remote_path: &str) -> AppResult<()> {
        match self.upload_tree(local_path, remote_path).await {
            Ok(()) => Ok(()),
            Err(SshError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Err(
                local_error(format!("cannot read {}: {err}", local_path.display())),
            ),
            Err(err) => Err(map_session_error("upload", err)),
        }
    }

    #[tracing::instrument(
        name = "sftp",
        level = "debug",
        skip(self),
        fields(op = "list_dir", host = %self.host)
    )]
    async fn list_dir(&self, remote_dir: &str) -> AppResult<Vec<RemoteEntry>> {
        self.read_dir(remote_dir)
            .await
            .map_err(|err| map_session_error("list directory", err))
    }

    #[tracing::instrument(
        name = "sftp",
        level = "debug",
        skip(self, local_path),
        fields(op = "download", host = %self.host, local = %local_path.display())
    )]
    async fn download(&self, remote_path: &str, local_path: &Path) -> AppResult<()> {
        self.download_file(remote_path, local_path)
            .await
            .map_err(|err| map_session_error("download", err))
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        match self.handle.try_lock() {
            Ok(guard) => guard.as_ref().is_none_or(Handle::is_closed),
            // Busy means in use, hence open.
            Err(_) => false,
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self
            .keepalive
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or(None);
        if let Some(task) = task {
            task.abort();
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
        tracing::debug!(host = %self.host, "ssh session closed");
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.keepalive.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;
    use russh_sftp::protocol::StatusCode;

    #[test]
    fn capture_accumulates_output_and_exit_status() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;

        let msg = ChannelMsg::Data {
            data: CryptoVec::from_slice(b"4242.master\n"),
        };
        assert!(!handle_capture_message(&msg, &mut out, &mut err, &mut code));
        let msg = ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"warning"),
            ext: 1,
        };
        assert!(!handle_capture_message(&msg, &mut out, &mut err, &mut code));
        let msg = ChannelMsg::ExitStatus { exit_status: 3 };
        assert!(!handle_capture_message(&msg, &mut out, &mut err, &mut code));
        assert!(handle_capture_message(
            &ChannelMsg::Close,
            &mut out,
            &mut err,
            &mut code
        ));

        assert_eq!(out, b"4242.master\n");
        assert_eq!(err, b"warning");
        assert_eq!(code, Some(3));
    }

    #[test]
    fn remote_prefixes_cover_every_level() {
        assert_eq!(
            remote_dir_prefixes("/scratch/ada/run/in"),
            vec!["/scratch", "/scratch/ada", "/scratch/ada/run", "/scratch/ada/run/in"]
        );
        assert_eq!(remote_dir_prefixes("runs/x/"), vec!["runs", "runs/x"]);
        assert!(remote_dir_prefixes("/").is_empty());
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let rel = Path::new("grids").join("dust.fits");
        assert_eq!(relative_remote(&rel), "grids/dust.fits");
    }

    #[test]
    fn missing_remote_path_maps_to_not_found() {
        let status = russh_sftp::protocol::Status {
            id: 1,
            status_code: StatusCode::NoSuchFile,
            error_message: "No such file".into(),
            language_tag: "en".into(),
        };
        let err = map_session_error(
            "list directory",
            SshError::Sftp(russh_sftp::client::error::Error::Status(status)),
        );
        assert_eq!(err.kind(), AppErrorKind::NotFound);

        let err = map_session_error("exec", SshError::Closed);
        assert_eq!(err.kind(), AppErrorKind::Remote);
        assert!(err.is_transient());
    }
}
