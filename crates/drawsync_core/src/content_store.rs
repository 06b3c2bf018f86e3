use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Native,
    Preview,
    SideRecord,
}

impl ContentKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Native => "diagram.drawio",
            Self::Preview => "preview.png",
            Self::SideRecord => "record.json",
        }
    }
}

/// Sidecar describing the diagram a content directory belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SideRecord {
    pub space_key: String,
    pub page_id: String,
    pub diagram_id: String,
    pub page_title: String,
    pub diagram_name: String,
    pub content_fingerprint: String,
    pub local_revision: i64,
    pub extracted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenContent {
    /// Location relative to the content root, `/`-separated.
    pub path: String,
    /// `false` when the file already held exactly these bytes.
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContentUsage {
    pub files: usize,
    pub bytes: u64,
    pub diagram_dirs: usize,
}

/// Files live at `<root>/<space>/<diagram_id>/<kind file>`, each identifier
/// percent-encoded into a single path segment.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn relative_path(
        space_key: &str,
        diagram_id: &str,
        kind: ContentKind,
    ) -> Result<String, PipelineError> {
        let dir = diagram_dir(space_key, diagram_id).map_err(PipelineError::store_write)?;
        Ok(format!("{dir}/{}", kind.file_name()))
    }

    pub fn write(
        &self,
        space_key: &str,
        diagram_id: &str,
        kind: ContentKind,
        bytes: &[u8],
    ) -> Result<WrittenContent, PipelineError> {
        let relative = Self::relative_path(space_key, diagram_id, kind)?;
        let target = self.resolve(&relative).map_err(PipelineError::store_write)?;
        let changed = write_atomic(&target, bytes)
            .with_context(|| format!("failed to write content {relative}"))
            .map_err(PipelineError::store_write)?;
        if !changed {
            debug!(path = %relative, "content unchanged; skipped rewrite");
        }
        Ok(WrittenContent {
            path: relative,
            changed,
        })
    }

    pub fn write_side_record(&self, record: &SideRecord) -> Result<WrittenContent, PipelineError> {
        let bytes = serde_json::to_vec_pretty(record)
            .context("failed to serialize side record")
            .map_err(PipelineError::store_write)?;
        self.write(
            &record.space_key,
            &record.diagram_id,
            ContentKind::SideRecord,
            &bytes,
        )
    }

    /// Paths that do not resolve under the root read as missing content.
    pub fn read(&self, relative: &str) -> Result<Vec<u8>, PipelineError> {
        let target = self
            .resolve(relative)
            .map_err(|err| PipelineError::NotFound(format!("{err:#}")))?;
        match fs::read(&target) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(PipelineError::NotFound(format!("content {relative}")))
            }
            Err(err) => Err(PipelineError::store_write(
                anyhow::Error::new(err).context(format!("failed to read content {relative}")),
            )),
        }
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.resolve(relative)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Returns `true` when a file was removed.
    pub fn delete(&self, relative: &str) -> Result<bool, PipelineError> {
        let target = self.resolve(relative).map_err(PipelineError::store_write)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(PipelineError::store_write(
                anyhow::Error::new(err).context(format!("failed to delete content {relative}")),
            )),
        }
    }

    /// Removes every file stored for one diagram.
    pub fn delete_diagram(&self, space_key: &str, diagram_id: &str) -> Result<bool, PipelineError> {
        let relative = diagram_dir(space_key, diagram_id).map_err(PipelineError::store_write)?;
        let dir = self.resolve(&relative).map_err(PipelineError::store_write)?;
        let removed = match fs::remove_dir_all(&dir) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                return Err(PipelineError::store_write(
                    anyhow::Error::new(err)
                        .context(format!("failed to delete content directory {relative}")),
                ));
            }
        };
        if let Some(space_dir) = dir.parent()
            && fs::remove_dir(space_dir).is_err()
        {
            debug!(space_dir = %space_dir.display(), "space directory not empty; kept");
        }
        Ok(removed)
    }

    pub fn usage(&self) -> Result<ContentUsage> {
        let mut usage = ContentUsage::default();
        if !self.root.exists() {
            return Ok(usage);
        }
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(3) {
            let entry = entry
                .with_context(|| format!("failed to walk {}", self.root.display()))?;
            if entry.file_type().is_dir() && entry.depth() == 2 {
                usage.diagram_dirs += 1;
            } else if entry.file_type().is_file() {
                usage.files += 1;
                usage.bytes += entry
                    .metadata()
                    .with_context(|| format!("failed to inspect {}", entry.path().display()))?
                    .len();
            }
        }
        Ok(usage)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        if relative.is_empty() || relative.starts_with('/') || relative.contains('\\') {
            bail!("content path is not relative to the content root: {relative}");
        }
        let mut out = self.root.clone();
        for segment in relative.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                bail!("content path escapes the content root: {relative}");
            }
            out.push(segment);
        }
        Ok(out)
    }
}

fn diagram_dir(space_key: &str, diagram_id: &str) -> Result<String> {
    Ok(format!(
        "{}/{}",
        encode_segment(space_key)?,
        encode_segment(diagram_id)?
    ))
}

fn encode_segment(raw: &str) -> Result<String> {
    let encoded = urlencoding::encode(raw).into_owned();
    if encoded.is_empty() || encoded == "." || encoded == ".." {
        bail!("identifier cannot be used as a path segment: {raw:?}");
    }
    Ok(encoded)
}

pub fn content_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Write-to-temp then rename, so readers never observe a partial file.
fn write_atomic(target: &Path, bytes: &[u8]) -> Result<bool> {
    if let Ok(existing) = fs::read(target)
        && content_digest(&existing) == content_digest(bytes)
    {
        return Ok(false);
    }

    let parent = target
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    temp.write_all(bytes)
        .with_context(|| format!("failed to write temp file for {}", target.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", target.display()))?;
    temp.persist(target).map_err(|err| {
        warn!(target = %target.display(), error = %err.error, "content rename failed");
        anyhow::Error::new(err.error).context(format!("failed to move into {}", target.display()))
    })?;
    Ok(true)
}
