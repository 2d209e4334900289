//! This module is responsible for engine loading
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// Build timestamp every engine sees, so that outputs are reproducible
pub const SOURCE_DATE_EPOCH: &str = "1456304492";
/// Default wall-clock budget of the main invocation
pub const DEFAULT_RUN_TIMEOUT: u64 = 600;
/// Default wall-clock budget of each preparation command
pub const DEFAULT_PREPARE_TIMEOUT: u64 = 300;

/// Engine description
#[derive(Debug, Clone)]
pub struct Engine {
    /// Manifest
    pub spec: EngineSpec,
    /// Program substituted for `{program}`
    pub program: PathBuf,
}

/// `manifest.yaml` representation
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineSpec {
    /// Human-readable
    pub title: String,

    /// Machine-readable
    pub name: String,

    /// Defaults to `name`
    #[serde(default)]
    pub program: Option<String>,

    /// Warm-up commands, e.g. to fetch support files. Their results are ignored.
    #[serde(default)]
    pub prepare: Vec<Command>,

    /// The invocation whose status and time are reported
    pub run: Command,

    /// Merged into the environment of every command
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Log produced by `run`, relative to the workspace. Enables tag
    /// classification.
    #[serde(rename = "log-file", default)]
    pub log_file: Option<String>,

    /// Whether produced files should be captured
    #[serde(default = "EngineSpec::default_capture")]
    pub capture: bool,
}

impl EngineSpec {
    fn default_capture() -> bool {
        true
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Command {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Values substituted into command lines
#[derive(Debug, Clone)]
pub struct Substitutions<'a> {
    pub program: &'a Path,
    /// Entry document, relative to the workspace
    pub entry: &'a str,
    pub entry_stem: &'a str,
    pub workspace: &'a Path,
}

impl Substitutions<'_> {
    pub fn apply(&self, template: &str) -> String {
        template
            .replace("{program}", &self.program.to_string_lossy())
            .replace("{entry}", self.entry)
            .replace("{entry_stem}", self.entry_stem)
            .replace("{workspace}", &self.workspace.to_string_lossy())
    }
}

/// Fully rendered command, ready to be spawned
#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl Engine {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn prepare_invocations(&self, subst: &Substitutions<'_>) -> Vec<Invocation> {
        self.spec
            .prepare
            .iter()
            .map(|cmd| self.render(cmd, DEFAULT_PREPARE_TIMEOUT, subst))
            .collect()
    }

    pub fn run_invocation(&self, subst: &Substitutions<'_>) -> Invocation {
        self.render(&self.spec.run, DEFAULT_RUN_TIMEOUT, subst)
    }

    /// Log file location for a given entry, if the engine has one
    pub fn log_file(&self, subst: &Substitutions<'_>) -> Option<PathBuf> {
        self.spec
            .log_file
            .as_ref()
            .map(|tpl| PathBuf::from(subst.apply(tpl)))
    }

    /// Overrides timeout of the main invocation
    pub fn set_run_timeout(&mut self, seconds: u64) {
        self.spec.run.timeout = Some(seconds);
    }

    fn render(&self, cmd: &Command, default_timeout: u64, subst: &Substitutions<'_>) -> Invocation {
        let mut env = HashMap::new();
        env.insert("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string());
        env.extend(self.spec.env.clone());
        env.extend(cmd.env.clone());
        let mut env: Vec<_> = env
            .into_iter()
            .map(|(k, v)| (k, subst.apply(&v)))
            .collect();
        env.sort();
        Invocation {
            argv: cmd.argv.iter().map(|a| subst.apply(a)).collect(),
            env,
            timeout: Duration::from_secs(cmd.timeout.unwrap_or(default_timeout)),
        }
    }

    /// Resolves `program` to an existing file, searching `PATH` for bare names.
    pub fn locate(&mut self) -> anyhow::Result<()> {
        let found = find_program(&self.program).with_context(|| {
            format!(
                "program {} of engine {} not found",
                self.program.display(),
                self.spec.name
            )
        })?;
        tracing::debug!(engine = %self.spec.name, program = %found.display(), "located engine program");
        self.program = found;
        Ok(())
    }

    /// Copies the program into `dir` so that it cannot change while a run
    /// is in progress (e.g. because the engine gets rebuilt).
    pub async fn pin(&mut self, dir: &Path) -> anyhow::Result<()> {
        let dest = dir.join(&self.spec.name);
        tokio::fs::copy(&self.program, &dest)
            .await
            .with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    self.program.display(),
                    dest.display()
                )
            })?;
        tracing::info!(engine = %self.spec.name, pinned = %dest.display(), "engine program pinned");
        self.program = dest;
        Ok(())
    }
}

/// Returns an absolute path, since commands run with the workspace as
/// their working directory.
fn find_program(program: &Path) -> Option<PathBuf> {
    let is_file = |p: &Path| std::fs::metadata(p).map(|m| m.is_file()).unwrap_or(false);
    let found = if program.components().count() > 1 || program.is_absolute() {
        Some(program.to_path_buf()).filter(|p| is_file(p.as_path()))
    } else {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| is_file(candidate.as_path()))
    }?;
    if found.is_absolute() {
        Some(found)
    } else {
        std::env::current_dir().ok().map(|cwd| cwd.join(found))
    }
}

/// Responsible for fetching engines
pub struct EngineLoader {
    /// Directory containing engine definitions
    engines_dir: PathBuf,
}

impl EngineLoader {
    pub fn new(engines_dir: &Path) -> EngineLoader {
        EngineLoader {
            engines_dir: engines_dir.to_path_buf(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, engine_name: &str) -> anyhow::Result<Engine> {
        let manifest_path = self.engines_dir.join(engine_name).join("manifest.yaml");

        let engine_spec = tokio::fs::read(&manifest_path).await.with_context(|| {
            format!(
                "engine config file {} missing",
                manifest_path.display()
            )
        })?;
        let spec: EngineSpec =
            serde_yaml::from_slice(&engine_spec).context("invalid engine spec")?;
        if spec.name != engine_name {
            anyhow::bail!(
                "engine manifest in {} is named {}",
                manifest_path.display(),
                spec.name
            );
        }
        if spec.run.argv.is_empty() {
            anyhow::bail!("engine {} has empty run command", spec.name);
        }
        if let Some(i) = spec.prepare.iter().position(|c| c.argv.is_empty()) {
            anyhow::bail!("engine {} has empty prepare command #{}", spec.name, i);
        }
        let program = PathBuf::from(spec.program.clone().unwrap_or_else(|| spec.name.clone()));
        Ok(Engine { spec, program })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
title: Tectonic
name: tectonic
prepare:
  - argv: ["{program}", "--outfmt=xdv", "{entry}"]
    timeout: 60
run:
  argv: ["{program}", "--keep-logs", "{entry}"]
env:
  LANG: C
log-file: "{entry_stem}.log"
"#;

    async fn load(manifest: &str) -> anyhow::Result<Engine> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tectonic")).unwrap();
        std::fs::write(dir.path().join("tectonic/manifest.yaml"), manifest).unwrap();
        EngineLoader::new(dir.path()).resolve("tectonic").await
    }

    #[tokio::test]
    async fn manifest_is_rendered() {
        let engine = load(MANIFEST).await.unwrap();
        assert!(engine.spec.capture);
        assert_eq!(engine.program, Path::new("tectonic"));

        let subst = Substitutions {
            program: Path::new("/opt/tectonic"),
            entry: "paper.tex",
            entry_stem: "paper",
            workspace: Path::new("/tmp/ws"),
        };
        let run = engine.run_invocation(&subst);
        assert_eq!(run.argv, ["/opt/tectonic", "--keep-logs", "paper.tex"]);
        assert_eq!(run.timeout, Duration::from_secs(DEFAULT_RUN_TIMEOUT));
        assert_eq!(
            run.env,
            [
                ("LANG".to_string(), "C".to_string()),
                ("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string()),
            ]
        );

        let prepare = engine.prepare_invocations(&subst);
        assert_eq!(prepare.len(), 1);
        assert_eq!(prepare[0].timeout, Duration::from_secs(60));
        assert_eq!(engine.log_file(&subst), Some(PathBuf::from("paper.log")));
    }

    #[tokio::test]
    async fn mismatched_name_is_rejected() {
        let manifest = MANIFEST.replace("name: tectonic", "name: xelatex");
        assert!(load(&manifest).await.is_err());
    }

    #[tokio::test]
    async fn empty_run_command_is_rejected() {
        let manifest = MANIFEST.replace(r#"["{program}", "--keep-logs", "{entry}"]"#, "[]");
        assert!(load(&manifest).await.is_err());
    }

    #[test]
    fn missing_program_is_not_located() {
        let mut engine = Engine {
            spec: serde_yaml::from_str(MANIFEST).unwrap(),
            program: PathBuf::from("/nonexistent/tectonic"),
        };
        assert!(engine.locate().is_err());
        engine.program = PathBuf::from("sh");
        engine.locate().unwrap();
        assert!(engine.program.is_absolute());
    }

    #[tokio::test]
    async fn shipped_manifests_load() {
        let loader = EngineLoader::new(Path::new("../engines"));
        let tectonic = loader.resolve("tectonic").await.unwrap();
        assert!(tectonic.spec.capture);
        assert!(tectonic.spec.log_file.is_some());

        let xelatex = loader.resolve("xelatex").await.unwrap();
        assert!(!xelatex.spec.capture);
        assert_eq!(xelatex.spec.log_file, None);
        assert_eq!(xelatex.spec.prepare.len(), 1);
    }

    #[test]
    fn relative_program_is_made_absolute() {
        // cargo runs tests from the package directory
        let mut engine = Engine {
            spec: serde_yaml::from_str(MANIFEST).unwrap(),
            program: PathBuf::from("src/lib.rs"),
        };
        engine.locate().unwrap();
        assert!(engine.program.is_absolute());
        assert!(engine.program.ends_with("src/lib.rs"));
        assert!(engine.program.is_file());
    }
}
