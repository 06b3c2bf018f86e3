use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const STATE_DIR_NAME: &str = ".drawsync";
pub const CONTENT_DIR_NAME: &str = "content";
pub const METADATA_DB_FILENAME: &str = "metadata.db";
pub const INDEX_DB_FILENAME: &str = "search.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub content_dir: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub index_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub content_dir_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub index_exists: bool,
    pub index_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    /// Builds the default layout under `project_root`.
    #[cfg(test)]
    pub fn under_root(project_root: &Path) -> Self {
        let state_dir = project_root.join(STATE_DIR_NAME);
        let data_dir = state_dir.join("data");
        Self {
            project_root: project_root.to_path_buf(),
            content_dir: project_root.join(CONTENT_DIR_NAME),
            db_path: data_dir.join(METADATA_DB_FILENAME),
            index_path: data_dir.join(INDEX_DB_FILENAME),
            config_path: state_dir.join("config.toml"),
            state_dir,
            data_dir,
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ncontent_dir={}\ndata_dir={} ({})\ndb_path={}\nindex_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.content_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.index_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let project_root_exists = paths.project_root.exists();
    let content_dir_exists = paths.content_dir.exists();
    let state_dir_exists = paths.state_dir.exists();
    let data_dir_exists = paths.data_dir.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let index_exists = paths.index_path.exists();
    let db_size_bytes = file_size_if_exists(&paths.db_path)?;
    let index_size_bytes = file_size_if_exists(&paths.index_path)?;

    let mut warnings = Vec::new();
    if !content_dir_exists {
        warnings.push("content/ is missing; run `drawsync init` before extracting".to_string());
    }
    if !state_dir_exists {
        warnings.push(".drawsync/ is missing; run `drawsync init` before extracting".to_string());
    }
    if db_exists && !index_exists {
        warnings.push("search index is not built; run `drawsync index --rebuild`".to_string());
    }

    Ok(RuntimeStatus {
        project_root_exists,
        content_dir_exists,
        state_dir_exists,
        data_dir_exists,
        db_exists,
        db_size_bytes,
        index_exists,
        index_size_bytes,
        config_exists,
        warnings,
    })
}

pub fn ensure_runtime_ready_for_extract(
    paths: &ResolvedPaths,
    status: &RuntimeStatus,
) -> Result<()> {
    if !status.content_dir_exists || !status.state_dir_exists {
        bail!(
            "Runtime layout is not initialized for extraction.\nMissing required paths:\n  - {}\n  - {}\nRun: drawsync init --project-root {}",
            if status.content_dir_exists {
                "content/ (ok)"
            } else {
                "content/ (missing)"
            },
            if status.state_dir_exists {
                ".drawsync/ (ok)"
            } else {
                ".drawsync/ (missing)"
            },
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;

    let state_dir = project_root.join(STATE_DIR_NAME);
    let content_dir = project_root.join(CONTENT_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("DRAWSYNC_DATA_DIR") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("DRAWSYNC_CONFIG") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join(METADATA_DB_FILENAME),
        index_path: data_dir.join(INDEX_DB_FILENAME),
        project_root,
        content_dir,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.content_dir.clone(),
        paths.state_dir.clone(),
        paths.data_dir.clone(),
        paths.state_dir.join("logs"),
    ];

    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(paths),
            options.force,
        )?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let content_dir = normalize_for_display(&paths.content_dir);
    let db_path = normalize_for_display(&paths.db_path);
    let index_path = normalize_for_display(&paths.index_path);

    format!(
        "# drawsync runtime configuration (materialized by `drawsync init`)\n# Credentials come from CONFLUENCE_USERNAME / CONFLUENCE_PASSWORD (or .env).\n\n[remote]\n# url = \"https://confluence.example.org\"\n# spaces = [\"DEMO\", \"ARCH\"]\nskip_personal_spaces = true\npage_size = 50\nrate_limit_per_second = 5\n\n[extract]\nbatch_size = 50\nworkers = 2\nmax_fetch_retries = 3\nretry_delay_ms = 500\n\n[parser]\nkind = \"quick-xml\"\n\n[render]\n# command = \"drawio\"\n# args = [\"--export\", \"--format\", \"png\", \"--output\", \"{{output}}\", \"{{input}}\"]\n\n# informational, resolved at runtime\n# content_dir = \"{content_dir}\"\n# db_path = \"{db_path}\"\n# index_path = \"{index_path}\"\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = lookup_env("DRAWSYNC_PROJECT_ROOT") {
        return Ok((
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        ));
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    Ok((root, ValueSource::Heuristic))
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).exists() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out = ancestors(cwd);
    if let Some(exe_dir) = executable_dir {
        out.extend(ancestors(exe_dir));
    }
    out
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    path.ancestors().map(Path::to_path_buf).collect()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn absolutize_from_project(path: &Path, project_root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

fn file_size_if_exists(path: &Path) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to inspect {}", path.display()))?;
    Ok(Some(metadata.len()))
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
