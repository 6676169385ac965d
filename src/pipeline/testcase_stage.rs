//! The test-case stage (§4.1): always single-worker, assigns the
//! monotonic, gap-free entity id.

use std::path::{Path, PathBuf};
use std::process::Command;

use crossbeam_channel::Sender;
use rand::RngCore;
use walkdir::WalkDir;

use crate::cancel::CancellationToken;
use crate::entity::TraceEntity;
use crate::error::{ConfigError, ModuleError};
use crate::pipeline::queue::send_cancellable;
use crate::pipeline::stage::{ModuleOptions, TestcaseProducer};

fn opt_str<'a>(opts: &'a ModuleOptions, key: &'static str) -> Option<&'a str> {
    opts.get(key).and_then(|v| v.as_str())
}

fn require_str(opts: &ModuleOptions, key: &'static str) -> Result<String, ConfigError> {
    opt_str(opts, key)
        .map(|s| s.to_string())
        .ok_or(ConfigError::MissingField {
            stage: "testcase",
            module: String::new(),
            field: key,
        })
}

/// Generates `count` random byte blobs of `length` bytes each, written
/// under `output_directory`. The simplest possible testcase source,
/// useful for smoke-testing a pipeline config end to end.
pub struct RandomBytesGenerator {
    output_directory: PathBuf,
    length: usize,
    remaining: u64,
    next_id: u64,
}

impl RandomBytesGenerator {
    pub fn from_options(opts: &ModuleOptions) -> Result<Self, ConfigError> {
        let output_directory = PathBuf::from(require_str(opts, "output_directory")?);
        let count = opts
            .get("count")
            .and_then(|v| v.as_integer())
            .ok_or(ConfigError::MissingField {
                stage: "testcase",
                module: "random-bytes".into(),
                field: "count",
            })? as u64;
        let length = opts
            .get("length")
            .and_then(|v| v.as_integer())
            .unwrap_or(64) as usize;
        std::fs::create_dir_all(&output_directory).map_err(|source| ConfigError::Io {
            path: output_directory.clone(),
            source,
        })?;
        Ok(Self {
            output_directory,
            length,
            remaining: count,
            next_id: 0,
        })
    }
}

impl TestcaseProducer for RandomBytesGenerator {
    fn name(&self) -> &'static str {
        "random-bytes"
    }

    fn is_done(&mut self) -> bool {
        self.remaining == 0
    }

    fn next_testcase(&mut self, _cancel: &CancellationToken) -> Result<PathBuf, ModuleError> {
        let mut buf = vec![0u8; self.length];
        rand::thread_rng().fill_bytes(&mut buf);
        let path = self.output_directory.join(format!("{}.testcase", self.next_id));
        std::fs::write(&path, &buf)
            .map_err(|e| ModuleError::new("testcase", "random-bytes", e.to_string()))?;
        self.next_id += 1;
        self.remaining -= 1;
        Ok(path)
    }
}

/// Walks a directory of pre-existing test-case files in sorted order.
pub struct DirectoryTestcaseGenerator {
    paths: std::vec::IntoIter<PathBuf>,
}

impl DirectoryTestcaseGenerator {
    pub fn from_options(opts: &ModuleOptions) -> Result<Self, ConfigError> {
        let directory = PathBuf::from(require_str(opts, "directory")?);
        let mut paths: Vec<PathBuf> = WalkDir::new(&directory)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect();
        paths.sort();
        Ok(Self {
            paths: paths.into_iter(),
        })
    }
}

impl TestcaseProducer for DirectoryTestcaseGenerator {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn is_done(&mut self) -> bool {
        self.paths.len() == 0
    }

    fn next_testcase(&mut self, _cancel: &CancellationToken) -> Result<PathBuf, ModuleError> {
        self.paths
            .next()
            .ok_or_else(|| ModuleError::new("testcase", "directory", "exhausted"))
    }
}

/// Invokes an external command once per test case; the command writes one
/// path to stdout (or exits non-zero/empty to signal exhaustion).
pub struct CommandTestcaseGenerator {
    command: String,
    args: Vec<String>,
    done: bool,
}

impl CommandTestcaseGenerator {
    pub fn from_options(opts: &ModuleOptions) -> Result<Self, ConfigError> {
        let command = require_str(opts, "command")?;
        let args = opts
            .get("args")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Ok(Self {
            command,
            args,
            done: false,
        })
    }
}

impl TestcaseProducer for CommandTestcaseGenerator {
    fn name(&self) -> &'static str {
        "command"
    }

    fn is_done(&mut self) -> bool {
        self.done
    }

    fn next_testcase(&mut self, _cancel: &CancellationToken) -> Result<PathBuf, ModuleError> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .output()
            .map_err(|e| ModuleError::new("testcase", "command", e.to_string()))?;
        if !output.status.success() {
            self.done = true;
            return Err(ModuleError::new("testcase", "command", "generator exited non-zero"));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout.trim();
        if path.is_empty() {
            self.done = true;
            return Err(ModuleError::new("testcase", "command", "no path produced"));
        }
        Ok(Path::new(path).to_path_buf())
    }
}

/// Drives the test-case stage: repeatedly asks the producer for the next
/// test case, assigns a monotonic id starting at 0, and pushes the
/// resulting entity downstream. Closes the queue when done (dropping
/// `tx`), which propagates shutdown to the trace stage.
pub fn run(
    mut producer: Box<dyn TestcaseProducer>,
    tx: Sender<TraceEntity>,
    cancel: &CancellationToken,
) {
    let mut next_id = 0u64;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if producer.is_done() {
            break;
        }
        match producer.next_testcase(cancel) {
            Ok(path) => {
                let entity = TraceEntity::new(next_id, path);
                next_id += 1;
                if send_cancellable(&tx, entity, cancel).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("testcase/{}: {e}", producer.name());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_generator_produces_the_requested_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = ModuleOptions::new();
        opts.insert(
            "output_directory".into(),
            toml::Value::String(dir.path().to_str().unwrap().into()),
        );
        opts.insert("count".into(), toml::Value::Integer(3));
        opts.insert("length".into(), toml::Value::Integer(8));
        let mut gen = RandomBytesGenerator::from_options(&opts).unwrap();
        let cancel = CancellationToken::new();

        let mut paths = Vec::new();
        while !gen.is_done() {
            paths.push(gen.next_testcase(&cancel).unwrap());
        }
        assert_eq!(paths.len(), 3);
        for p in &paths {
            assert_eq!(std::fs::read(p).unwrap().len(), 8);
        }
    }

    #[test]
    fn directory_generator_yields_sorted_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.testcase"), b"1").unwrap();
        std::fs::write(dir.path().join("a.testcase"), b"2").unwrap();
        let mut opts = ModuleOptions::new();
        opts.insert(
            "directory".into(),
            toml::Value::String(dir.path().to_str().unwrap().into()),
        );
        let mut gen = DirectoryTestcaseGenerator::from_options(&opts).unwrap();
        let cancel = CancellationToken::new();
        let first = gen.next_testcase(&cancel).unwrap();
        assert!(first.ends_with("a.testcase"));
        let second = gen.next_testcase(&cancel).unwrap();
        assert!(second.ends_with("b.testcase"));
        assert!(gen.is_done());
    }

    #[test]
    fn run_assigns_dense_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = ModuleOptions::new();
        opts.insert(
            "output_directory".into(),
            toml::Value::String(dir.path().to_str().unwrap().into()),
        );
        opts.insert("count".into(), toml::Value::Integer(5));
        let gen = Box::new(RandomBytesGenerator::from_options(&opts).unwrap());
        let (tx, rx) = crossbeam_channel::bounded(10);
        let cancel = CancellationToken::new();
        run(gen, tx, &cancel);
        let ids: Vec<u64> = rx.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }
}
