//! Image source resolution.
//!
//! A source containing `:/` is a remote `host:/path` locator copied into
//! the working directory with `scp`; anything else is a local file.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::vbox::ToolRunner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Local(PathBuf),
    /// `[user@]host:/path`
    Remote(String),
}

impl ImageSource {
    pub fn parse(source: &str) -> Self {
        if source.contains(":/") {
            Self::Remote(source.to_string())
        } else {
            Self::Local(PathBuf::from(source))
        }
    }

    /// File name of the image, without directories.
    pub fn file_name(&self) -> Result<String> {
        let name = match self {
            Self::Local(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            Self::Remote(locator) => locator
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        };
        name.with_context(|| format!("no file name in image source {:?}", self))
    }

    /// Make the image available locally and return its path.
    ///
    /// Remote sources without a user are fetched as `$USER@host:/path`
    /// when `user` is given.
    pub fn fetch(&self, workdir: &Path, user: Option<&str>, tools: &dyn ToolRunner) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if !path.is_file() {
                    bail!("image {} does not exist", path.display());
                }
                Ok(path.clone())
            }
            Self::Remote(locator) => {
                let from = match user {
                    Some(user) if !locator.contains('@') => format!("{}@{}", user, locator),
                    _ => locator.clone(),
                };
                tracing::info!(source = %from, "copying image with scp");
                let mut cmd = Command::new("scp");
                cmd.arg(&from).arg(workdir);
                tools
                    .run(&mut cmd)
                    .with_context(|| format!("fetching {}", from))?;
                let local = workdir.join(self.file_name()?);
                if !local.is_file() {
                    bail!("scp finished but {} is missing", local.display());
                }
                Ok(local)
            }
        }
    }
}

/// VM name for an image: its file stem.
pub fn vm_name(image: &Path) -> Result<String> {
    image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .with_context(|| format!("cannot derive a VM name from {}", image.display()))
}
