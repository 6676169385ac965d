//! Configuration loading (§6): a hierarchical TOML document with one key
//! per stage category plus `general`. Follows the teacher's `Config::load`
//! shape (env-var override of the path, `#[serde(default = ...)]` per
//! field) but, unlike the teacher, a parse/validation failure is part of
//! the core contract (§4.1) rather than silently falling back to defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

const ENV_CONFIG_PATH: &str = "LEAKPIPE_CONFIG";

fn default_input_buffer_size() -> usize {
    1
}

fn default_max_parallel_threads() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeOptions {
    #[serde(default = "default_input_buffer_size", rename = "input-buffer-size")]
    pub input_buffer_size: usize,
    #[serde(
        default = "default_max_parallel_threads",
        rename = "max-parallel-threads"
    )]
    pub max_parallel_threads: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            input_buffer_size: default_input_buffer_size(),
            max_parallel_threads: default_max_parallel_threads(),
        }
    }
}

/// One stage's configuration: which module to instantiate, its free-form
/// options, and the shared runtime knobs (§6).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StageConfig {
    pub module: String,
    #[serde(default, rename = "module-options")]
    pub module_options: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub options: RuntimeOptions,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GeneralConfig {
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
    #[serde(default)]
    pub store_traces: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub constants: BTreeMap<String, String>,
    #[serde(default, rename = "base-file")]
    pub base_file: Option<PathBuf>,
    pub testcase: StageConfig,
    pub trace: StageConfig,
    pub preprocess: StageConfig,
    #[serde(default)]
    pub analysis: Vec<StageConfig>,
}

impl RawConfig {
    /// Load from the given path, or the default path overridden by
    /// `LEAKPIPE_CONFIG`, applying constant/env interpolation and
    /// base-file layering before parsing into stage configs.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(
                std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| "leakpipe.toml".to_string()),
            ),
        };
        let raw_text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let mut value: toml::Value = toml::from_str(&raw_text)?;
        let constants = read_constants(&value);
        interpolate(&mut value, &constants);

        if let Some(base_path) = value
            .get("base-file")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
        {
            let base_text = std::fs::read_to_string(&base_path).map_err(|source| ConfigError::Io {
                path: base_path.clone(),
                source,
            })?;
            let mut base_value: toml::Value = toml::from_str(&base_text)?;
            let base_constants = read_constants(&base_value);
            interpolate(&mut base_value, &base_constants);
            merge(&mut base_value, value);
            value = base_value;
        }

        Ok(RawConfig::deserialize(value)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.store_traces && self.general.output_directory.is_none() {
            return Err(ConfigError::MissingOutputDirectory);
        }
        if self.testcase.options.max_parallel_threads > 1 {
            return Err(ConfigError::TestcaseStageParallelism);
        }
        for (name, stage) in [
            ("testcase", &self.testcase),
            ("trace", &self.trace),
            ("preprocess", &self.preprocess),
        ] {
            if stage.options.input_buffer_size < 1 {
                return Err(ConfigError::InvalidBound("input-buffer-size"));
            }
            if stage.options.max_parallel_threads < 1 {
                return Err(ConfigError::InvalidBound("max-parallel-threads"));
            }
            if stage.module.is_empty() {
                return Err(ConfigError::MissingField {
                    stage: name,
                    module: String::new(),
                    field: "module",
                });
            }
        }
        for analyzer in &self.analysis {
            if analyzer.module.is_empty() {
                return Err(ConfigError::MissingField {
                    stage: "analysis",
                    module: String::new(),
                    field: "module",
                });
            }
        }
        Ok(())
    }
}

/// Reads the `[constants]` table up front, before interpolation runs, so
/// that `$$NAME$$` substitution has something to look NAME up in.
fn read_constants(value: &toml::Value) -> BTreeMap<String, String> {
    value
        .get("constants")
        .and_then(|v| v.as_table())
        .map(|t| {
            t.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Replace `$$$VAR$$$` with the environment variable `VAR` and `$$NAME$$`
/// with the `[constants]` table entry `NAME`, recursively over every
/// string leaf in the document (§6).
fn interpolate(value: &mut toml::Value, constants: &BTreeMap<String, String>) {
    match value {
        toml::Value::String(s) => *s = interpolate_str(s, constants),
        toml::Value::Array(arr) => arr.iter_mut().for_each(|v| interpolate(v, constants)),
        toml::Value::Table(table) => table.values_mut().for_each(|v| interpolate(v, constants)),
        _ => {}
    }
}

fn interpolate_str(input: &str, constants: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i..].starts_with("$$$") {
            if let Some(end) = input[i + 3..].find("$$$") {
                let name = &input[i + 3..i + 3 + end];
                if let Ok(val) = std::env::var(name) {
                    out.push_str(&val);
                    i += 3 + end + 3;
                    continue;
                }
            }
        } else if input[i..].starts_with("$$") {
            if let Some(end) = input[i + 2..].find("$$") {
                let name = &input[i + 2..i + 2 + end];
                if let Some(val) = constants.get(name) {
                    out.push_str(val);
                    i += 2 + end + 2;
                    continue;
                }
            }
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Shallow-recursive merge: keys present in `overlay` win; nested tables
/// are merged key-by-key rather than replaced wholesale.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, overlay_val) => *base_slot = overlay_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
[general]
output_directory = "/tmp/out"
store_traces = true

[testcase]
module = "random-bytes"

[trace]
module = "command"

[preprocess]
module = "native"

[[analysis]]
module = "call-stack"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{toml}").unwrap();
        let cfg = RawConfig::load(Some(file.path())).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.testcase.module, "random-bytes");
        assert_eq!(cfg.analysis.len(), 1);
        assert_eq!(cfg.testcase.options.input_buffer_size, 1);
    }

    #[test]
    fn rejects_store_traces_without_output_directory() {
        let toml = r#"
[general]
store_traces = true

[testcase]
module = "random-bytes"
[trace]
module = "command"
[preprocess]
module = "native"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{toml}").unwrap();
        let cfg = RawConfig::load(Some(file.path())).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingOutputDirectory)
        ));
    }

    #[test]
    fn rejects_parallel_testcase_stage() {
        let toml = r#"
[testcase]
module = "random-bytes"
[testcase.options]
max-parallel-threads = 2
[trace]
module = "command"
[preprocess]
module = "native"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{toml}").unwrap();
        let cfg = RawConfig::load(Some(file.path())).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TestcaseStageParallelism)
        ));
    }

    #[test]
    fn interpolates_constants_and_env() {
        unsafe {
            std::env::set_var("LEAKPIPE_TEST_VAR", "/from/env");
        }
        let toml = r#"
[constants]
NAME = "unused"

[testcase]
module = "random-bytes"
[testcase.module-options]
seed_dir = "$$$LEAKPIPE_TEST_VAR$$$/seeds"
[trace]
module = "command"
[preprocess]
module = "native"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{toml}").unwrap();
        let cfg = RawConfig::load(Some(file.path())).unwrap();
        let seed_dir = cfg
            .testcase
            .module_options
            .get("seed_dir")
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(seed_dir, "/from/env/seeds");
        unsafe {
            std::env::remove_var("LEAKPIPE_TEST_VAR");
        }
    }

    #[test]
    fn interpolates_constants_table() {
        let toml = r#"
[constants]
TARGET_DIR = "/opt/target"

[testcase]
module = "directory"
[testcase.module-options]
directory = "$$TARGET_DIR$$/seeds"
[trace]
module = "command"
[preprocess]
module = "native"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{toml}").unwrap();
        let cfg = RawConfig::load(Some(file.path())).unwrap();
        let directory = cfg
            .testcase
            .module_options
            .get("directory")
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(directory, "/opt/target/seeds");
    }
}
