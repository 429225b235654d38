// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[async_trait]
/// Local filesystem boundary for the core.
pub trait LocalFilesystemPort: Send + Sync {
    /// Absolute form of an existing path; fails when it does not exist.
    async fn canonicalize(&self, path: &Path) -> AppResult<PathBuf>;
    async fn ensure_dir(&self, path: &Path) -> AppResult<()>;
}
