use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const SNAPSHOT_FILENAME: &str = "scrape_result.json";
pub const CONFIG_FILENAME: &str = "boardpull.toml";

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
    pub output_dir: Option<PathBuf>,
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
    pub data_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub staging_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub output_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub data_dir_exists: bool,
    pub snapshot_exists: bool,
    pub snapshot_size_bytes: Option<u64>,
    pub staging_exists: bool,
    pub staged_file_count: usize,
    pub output_exists: bool,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\ndata_dir={} ({})\nsnapshot_path={}\nstaging_dir={}\noutput_dir={} ({})\nlog_dir={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.snapshot_path),
            normalize_for_display(&self.staging_dir),
            normalize_for_display(&self.output_dir),
            self.output_source.as_str(),
            normalize_for_display(&self.log_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let project_root_exists = paths.project_root.exists();
    let data_dir_exists = paths.data_dir.exists();
    let staging_exists = paths.staging_dir.exists();
    let output_exists = paths.output_dir.exists();
    let config_exists = paths.config_path.exists();
    let snapshot_exists = paths.snapshot_path.exists();
    let snapshot_size_bytes = if snapshot_exists {
        let metadata = fs::metadata(&paths.snapshot_path)
            .with_context(|| format!("failed to inspect {}", paths.snapshot_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };
    let staged_file_count = if staging_exists {
        fs::read_dir(&paths.staging_dir)
            .with_context(|| format!("failed to inspect {}", paths.staging_dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .count()
    } else {
        0
    };

    let mut warnings = Vec::new();
    if !config_exists {
        warnings.push(format!(
            "{CONFIG_FILENAME} is missing; run `boardpull init` or set BOARDPULL_* variables"
        ));
    }
    if !snapshot_exists {
        warnings.push("no snapshot captured yet; run `boardpull scrape` first".to_string());
    }

    Ok(RuntimeStatus {
        project_root_exists,
        data_dir_exists,
        snapshot_exists,
        snapshot_size_bytes,
        staging_exists,
        staged_file_count,
        output_exists,
        config_exists,
        warnings,
    })
}

/// A scrape needs the data and staging directories before the browser session
/// starts; the staging dir doubles as the download target.
pub fn prepare_scrape_dirs(paths: &ResolvedPaths) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for dir in [&paths.data_dir, &paths.staging_dir, &paths.log_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created.push(dir.clone());
        }
    }
    Ok(created)
}

pub fn ensure_runtime_ready_for_materialize(
    paths: &ResolvedPaths,
    status: &RuntimeStatus,
) -> Result<()> {
    if !status.snapshot_exists {
        bail!(
            "No snapshot found at {}.\nRun: boardpull scrape",
            normalize_for_display(&paths.snapshot_path)
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

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("BOARDPULL_DATA_DIR") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (project_root.join("data"), ValueSource::Default)
    };

    let (output_dir, output_source) = if let Some(path) = overrides.output_dir.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("BOARDPULL_OUTPUT_DIR") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (project_root.join("work_items"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("BOARDPULL_CONFIG") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (project_root.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        snapshot_path: data_dir.join(SNAPSHOT_FILENAME),
        staging_dir: data_dir.join("attachments"),
        log_dir: data_dir.join("logs"),
        project_root,
        data_dir,
        output_dir,
        config_path,
        root_source,
        data_source,
        output_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = vec![
        paths.data_dir.clone(),
        paths.staging_dir.clone(),
        paths.log_dir.clone(),
        paths.output_dir.clone(),
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
    let data_dir = normalize_for_display(&paths.data_dir);
    let output_dir = normalize_for_display(&paths.output_dir);

    format!(
        "# boardpull runtime configuration (materialized by `boardpull init`)\n# Credentials are read from the environment only: BOARDPULL_EMAIL, BOARDPULL_PASSWORD.\n\n[board]\n# base_url = \"https://tracker.example.org/org/project/_backlogs/backlog\"\n# webdriver_url = \"http://localhost:9515\"\n# work_item_endpoint = \"_workitems/edit\"\n# browser_binary = \"/usr/bin/chromium\"\non_prem = false\nunparented = false\n\n[scrape]\nmax_retries = 3\nmax_wait_time_secs = 10\npoll_interval_ms = 500\nretry_delay_ms = 1000\ncapture_changeset_content = false\n# timestamp_formats = [\"%d %B %Y %H:%M:%S\"]\n\n# Resolved paths for this project root:\n# data_dir = \"{data_dir}\"\n# output_dir = \"{output_dir}\"\n",
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

    if let Some(value) = lookup_env("BOARDPULL_PROJECT_ROOT") {
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
        if candidate.join(CONFIG_FILENAME).exists()
            || candidate.join("data").join(SNAPSHOT_FILENAME).exists()
        {
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
    let mut out = Vec::new();
    let mut cursor = Some(path);
    while let Some(current) = cursor {
        out.push(current.to_path_buf());
        cursor = current.parent();
    }
    out
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

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource,
        ensure_runtime_ready_for_materialize, init_layout, inspect_runtime, prepare_scrape_dirs,
        resolve_paths_with_lookup,
    };

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: cwd.clone(),
            executable_dir: None,
        };

        let env = HashMap::from([(
            "BOARDPULL_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.snapshot_path, from_flag.join("data/scrape_result.json"));
        assert_eq!(resolved.staging_dir, from_flag.join("data/attachments"));
    }

    #[test]
    fn resolve_paths_finds_root_by_config_marker() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("sub").join("dir");
        fs::create_dir_all(&nested).expect("create nested");
        fs::write(root.join("boardpull.toml"), "[board]\n").expect("write marker");

        let context = ResolutionContext {
            cwd: nested,
            executable_dir: None,
        };
        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
                .expect("resolve paths");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn init_layout_creates_expected_dirs_and_files() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");

        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, &InitOptions::default()).expect("init");

        assert!(!report.created_dirs.is_empty());
        assert!(report.wrote_config);
        assert!(paths.data_dir.exists());
        assert!(paths.staging_dir.exists());
        assert!(paths.output_dir.exists());
        assert!(paths.config_path.exists());
    }

    #[test]
    fn init_layout_does_not_overwrite_config_without_force() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        fs::write(root.join("boardpull.toml"), "[board]\non_prem = true\n")
            .expect("write config");

        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");
        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert!(!report.wrote_config);
        let content = fs::read_to_string(&paths.config_path).expect("read config");
        assert!(content.contains("on_prem = true"));
    }

    #[test]
    fn prepare_scrape_dirs_creates_staging() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let created = prepare_scrape_dirs(&paths).expect("prepare");
        assert!(created.contains(&paths.staging_dir));
        assert!(paths.staging_dir.exists());
        assert!(prepare_scrape_dirs(&paths).expect("idempotent").is_empty());
    }

    #[test]
    fn materialize_readiness_fails_without_snapshot() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");
        let status = inspect_runtime(&paths).expect("inspect");
        let err = ensure_runtime_ready_for_materialize(&paths, &status).expect_err("must fail");
        assert!(err.to_string().contains("No snapshot found"));
    }
}
