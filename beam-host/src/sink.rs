//! Where completed incoming files go.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use beam_core::Artifact;
use tokio::io::AsyncWriteExt;

/// Save collaborator for reassembled files.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Persist `artifact`, returning where it ended up.
    async fn save(&self, artifact: Artifact) -> anyhow::Result<PathBuf>;
}

const FALLBACK_NAME: &str = "download";
const MAX_DUPLICATES: u32 = 10_000;

/// Writes files into one directory, never overwriting an existing file.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Reduce a peer-supplied name to a bare file name: last path component, no control chars.
pub fn safe_file_name(name: &str) -> String {
    let last = name
        .split(|c: char| c == '/' || c == '\\')
        .last()
        .unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// `name` for n = 0, otherwise `stem (n).ext`.
fn numbered(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn save(&self, artifact: Artifact) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create {}", self.dir.display()))?;
        let name = safe_file_name(&artifact.info.name);
        for n in 0..MAX_DUPLICATES {
            let path = self.dir.join(numbered(&name, n));
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e).with_context(|| format!("create {}", path.display())),
            };
            file.write_all(&artifact.bytes)
                .await
                .with_context(|| format!("write {}", path.display()))?;
            file.flush().await?;
            return Ok(path);
        }
        bail!("too many files named {name} in {}", self.dir.display())
    }
}
