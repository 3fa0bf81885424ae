//! Workload Loader & Validator (Section 4.1).
//!
//! Recursively discovers YAML recipes under two roots — the configured
//! personal path, then the bundled examples path — parses each with
//! `serde_yaml`, and validates it against the Section 3 schema. Per-file
//! failures accumulate into a `ValidationError` collection rather than
//! aborting the walk; the catalog and error collection are replaced
//! atomically under a single `RwLock` write guard.

use orc_core::{StepDef, ValidationError, WorkloadDefinition};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::RwLock;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to walk workload root {path}: {source}")]
    WalkFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn semver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$").expect("valid regex")
    })
}

struct CatalogEntry {
    definition: WorkloadDefinition,
    path: PathBuf,
}

#[derive(Default)]
struct CatalogState {
    workloads: HashMap<String, CatalogEntry>,
    errors: Vec<ValidationError>,
}

/// Discovers, validates, and caches the workload catalog.
pub struct Loader {
    personal_root: PathBuf,
    examples_root: PathBuf,
    state: RwLock<CatalogState>,
}

impl Loader {
    pub fn new(personal_root: PathBuf, examples_root: PathBuf) -> Self {
        Self {
            personal_root,
            examples_root,
            state: RwLock::new(CatalogState::default()),
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkloadDefinition> {
        self.state
            .read()
            .expect("loader lock poisoned")
            .workloads
            .get(id)
            .map(|e| e.definition.clone())
    }

    pub fn list(&self) -> Vec<WorkloadDefinition> {
        self.state
            .read()
            .expect("loader lock poisoned")
            .workloads
            .values()
            .map(|e| e.definition.clone())
            .collect()
    }

    pub fn path_of(&self, id: &str) -> Option<PathBuf> {
        self.state
            .read()
            .expect("loader lock poisoned")
            .workloads
            .get(id)
            .map(|e| e.path.clone())
    }

    pub fn errors(&self) -> Vec<ValidationError> {
        self.state.read().expect("loader lock poisoned").errors.clone()
    }

    /// Root under which the REST façade writes new/updated workload files
    /// (Section 4.1 personal-shadows-examples ordering).
    pub fn personal_root(&self) -> &Path {
        &self.personal_root
    }

    /// Synchronous, idempotent reload. Builds a fresh catalog off to the
    /// side and only then swaps it in, so readers never observe a
    /// half-replaced catalog.
    pub fn reload(&self) -> Result<(), LoaderError> {
        let mut workloads: HashMap<String, CatalogEntry> = HashMap::new();
        let mut errors = Vec::new();

        // Examples first, personal second, so personal shadows on conflict.
        for root in [&self.examples_root, &self.personal_root] {
            if !root.is_dir() {
                continue;
            }
            for file in discover_yaml_files(root)? {
                match load_one(&file) {
                    Ok(definition) => {
                        workloads.insert(
                            definition.id.clone(),
                            CatalogEntry {
                                definition,
                                path: file,
                            },
                        );
                    }
                    Err(file_errors) => errors.push(ValidationError {
                        file: file.display().to_string(),
                        errors: file_errors,
                        warnings: Vec::new(),
                    }),
                }
            }
        }

        info!(
            workloads = workloads.len(),
            errors = errors.len(),
            "workload catalog reloaded"
        );
        let mut state = self.state.write().expect("loader lock poisoned");
        state.workloads = workloads;
        state.errors = errors;
        Ok(())
    }
}

fn discover_yaml_files(root: &Path) -> Result<Vec<PathBuf>, LoaderError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| LoaderError::WalkFailed {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| LoaderError::WalkFailed {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn load_one(path: &Path) -> Result<WorkloadDefinition, Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| vec![format!("read error: {e}")])?;
    let definition: WorkloadDefinition =
        serde_yaml::from_str(&content).map_err(|e| vec![format!("parse error: {e}")])?;
    let errors = validate(&definition);
    if errors.is_empty() {
        Ok(definition)
    } else {
        Err(errors)
    }
}

/// Validate a parsed definition against Section 3's invariants. Returns
/// the list of hard errors (empty means valid).
pub fn validate(definition: &WorkloadDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    if definition.id.trim().is_empty() {
        errors.push("id must not be empty".to_string());
    }
    if definition.name.trim().is_empty() {
        errors.push("name must not be empty".to_string());
    }
    if !semver_re().is_match(&definition.version) {
        errors.push(format!("version '{}' is not valid semver", definition.version));
    }

    if let Some(steps) = definition.steps() {
        errors.extend(validate_steps(steps));
    }

    errors
}

fn validate_steps(steps: &[StepDef]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen_ids = HashSet::new();
    for step in steps {
        if !seen_ids.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
    }

    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                errors.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }
    }

    if errors.is_empty() && has_cycle(steps) {
        errors.push("workload contains circular dependencies between steps".to_string());
    }

    errors
}

fn has_cycle(steps: &[StepDef]) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; steps.len()];

    fn visit(
        i: usize,
        steps: &[StepDef],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
    ) -> bool {
        match marks[i] {
            Mark::Done => return false,
            Mark::InProgress => return true,
            Mark::Unvisited => {}
        }
        marks[i] = Mark::InProgress;
        for dep in &steps[i].depends_on {
            if let Some(&j) = index.get(dep.as_str()) {
                if visit(j, steps, index, marks) {
                    return true;
                }
            }
        }
        marks[i] = Mark::Done;
        false
    }

    for i in 0..steps.len() {
        if visit(i, steps, &index, &mut marks) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_workload(dir: &Path, file_name: &str, content: &str) -> PathBuf {
        let path = dir.join(file_name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn loads_valid_prompt_workload() {
        let personal = tempdir().unwrap();
        let examples = tempdir().unwrap();
        write_workload(
            personal.path(),
            "weather.yaml",
            r#"
id: weather
name: Weather
version: "1.0.0"
prompt: "Weather for {{location}}"
output:
  format: json
"#,
        );
        let loader = Loader::new(personal.path().to_path_buf(), examples.path().to_path_buf());
        loader.reload().unwrap();
        assert!(loader.get("weather").is_some());
        assert!(loader.errors().is_empty());
    }

    #[test]
    fn personal_shadows_examples_on_id_collision() {
        let personal = tempdir().unwrap();
        let examples = tempdir().unwrap();
        write_workload(
            examples.path(),
            "weather.yaml",
            "id: weather\nname: Example\nversion: \"1.0.0\"\nprompt: hi\noutput:\n  format: text\n",
        );
        write_workload(
            personal.path(),
            "weather.yaml",
            "id: weather\nname: Personal\nversion: \"1.0.0\"\nprompt: hi\noutput:\n  format: text\n",
        );
        let loader = Loader::new(personal.path().to_path_buf(), examples.path().to_path_buf());
        loader.reload().unwrap();
        assert_eq!(loader.get("weather").unwrap().name, "Personal");
    }

    #[test]
    fn cycle_is_a_hard_validation_error() {
        let dir = tempdir().unwrap();
        write_workload(
            dir.path(),
            "cyclic.yaml",
            r#"
id: cyclic
name: Cyclic
version: "1.0.0"
steps:
  - id: A
    name: A
    worker: exec
    output: a.json
    dependsOn: [B]
  - id: B
    name: B
    worker: exec
    output: b.json
    dependsOn: [A]
"#,
        );
        let loader = Loader::new(dir.path().to_path_buf(), tempdir().unwrap().path().to_path_buf());
        loader.reload().unwrap();
        assert!(loader.get("cyclic").is_none());
        let errors = loader.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].errors.iter().any(|e| e.contains("circular dependencies")));
    }

    #[test]
    fn missing_dependency_is_a_hard_error() {
        let dir = tempdir().unwrap();
        write_workload(
            dir.path(),
            "bad.yaml",
            r#"
id: bad
name: Bad
version: "1.0.0"
steps:
  - id: A
    name: A
    worker: exec
    output: a.json
    dependsOn: [ghost]
"#,
        );
        let loader = Loader::new(dir.path().to_path_buf(), tempdir().unwrap().path().to_path_buf());
        loader.reload().unwrap();
        assert!(loader.get("bad").is_none());
    }

    #[test]
    fn one_bad_file_does_not_abort_the_walk() {
        let dir = tempdir().unwrap();
        write_workload(dir.path(), "broken.yaml", "not: [valid yaml");
        write_workload(
            dir.path(),
            "ok.yaml",
            "id: ok\nname: Ok\nversion: \"1.0.0\"\nprompt: hi\noutput:\n  format: text\n",
        );
        let loader = Loader::new(dir.path().to_path_buf(), tempdir().unwrap().path().to_path_buf());
        loader.reload().unwrap();
        assert!(loader.get("ok").is_some());
        assert_eq!(loader.errors().len(), 1);
    }

    #[test]
    fn reload_on_unchanged_filesystem_is_idempotent() {
        let dir = tempdir().unwrap();
        write_workload(
            dir.path(),
            "ok.yaml",
            "id: ok\nname: Ok\nversion: \"1.0.0\"\nprompt: hi\noutput:\n  format: text\n",
        );
        let loader = Loader::new(dir.path().to_path_buf(), tempdir().unwrap().path().to_path_buf());
        loader.reload().unwrap();
        let first = loader.list().len();
        loader.reload().unwrap();
        assert_eq!(loader.list().len(), first);
    }
}
