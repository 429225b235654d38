// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::LocalFilesystemPort;

#[derive(Clone, Default)]
pub struct LocalFilesystem;

fn io_error(action: &str, path: &Path, err: std::io::Error) -> AppError {
    let kind = if err.kind() == std::io::ErrorKind::NotFound {
        AppErrorKind::NotFound
    } else {
        AppErrorKind::Local
    };
    AppError::with_message(
        kind,
        codes::LOCAL_ERROR,
        format!("failed to {action} {}: {err}", path.display()),
    )
}

#[async_trait]
impl LocalFilesystemPort for LocalFilesystem {
    #[tracing::instrument(name = "fs", level = "debug", skip(self, path), fields(op = "canonicalize", path = %path.display()))]
    async fn canonicalize(&self, path: &Path) -> AppResult<PathBuf> {
        tokio::fs::canonicalize(path)
            .await
            .map_err(|err| io_error("resolve", path, err))
    }

    #[tracing::instrument(name = "fs", level = "debug", skip(self, path), fields(op = "ensure_dir", path = %path.display()))]
    async fn ensure_dir(&self, path: &Path) -> AppResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|err| io_error("create", path, err))
    }
}
