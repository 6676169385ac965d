//! The trace stage (§4.1): runs the instrumented target once per test case
//! and records where its raw trace landed. The target itself is an
//! external collaborator (§1) — this module only knows how to invoke a
//! configured command template and wait for it.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::cancel::CancellationToken;
use crate::entity::TraceEntity;
use crate::error::{ConfigError, ItemError, ModuleError};
use crate::pipeline::queue::{recv_cancellable, send_cancellable};
use crate::pipeline::stage::{ModuleOptions, TraceProducer};

/// Runs `{command} {args...}` with `{testcase}` substituted by the test
/// case path and `{output}` substituted by a generated raw-trace path
/// under `raw_trace_directory`.
pub struct CommandTraceProducer {
    command: String,
    args: Vec<String>,
    raw_trace_directory: PathBuf,
    parallel: bool,
}

impl CommandTraceProducer {
    pub fn from_options(opts: &ModuleOptions) -> Result<Self, ConfigError> {
        let command = opts
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or(ConfigError::MissingField {
                stage: "trace",
                module: "command".into(),
                field: "command",
            })?
            .to_string();
        let args = opts
            .get("args")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let raw_trace_directory = PathBuf::from(
            opts.get("raw_trace_directory")
                .and_then(|v| v.as_str())
                .unwrap_or("."),
        );
        let parallel = opts
            .get("parallel")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        std::fs::create_dir_all(&raw_trace_directory).map_err(|source| ConfigError::Io {
            path: raw_trace_directory.clone(),
            source,
        })?;
        Ok(Self {
            command,
            args,
            raw_trace_directory,
            parallel,
        })
    }
}

impl TraceProducer for CommandTraceProducer {
    fn name(&self) -> &'static str {
        "command"
    }

    fn supports_parallelism(&self) -> bool {
        self.parallel
    }

    fn produce(&self, entity: &mut TraceEntity, _cancel: &CancellationToken) -> Result<(), ItemError> {
        let output_path = self.raw_trace_directory.join(format!("t{}.trace", entity.id));
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{testcase}", entity.testcase_path.to_string_lossy().as_ref())
                    .replace("{output}", output_path.to_string_lossy().as_ref())
            })
            .collect();
        let status = Command::new(&self.command)
            .args(&args)
            .status()
            .map_err(|e| ModuleError::new("trace", "command", e.to_string()))?;
        if !status.success() {
            return Err(ModuleError::new(
                "trace",
                "command",
                format!("target exited with status {status}"),
            )
            .into());
        }
        entity.raw_trace_path = Some(output_path);
        Ok(())
    }
}

pub fn effective_thread_count(configured: usize, supports_parallelism: bool) -> usize {
    if supports_parallelism {
        configured.max(1)
    } else {
        1
    }
}

/// Spawns the trace stage's worker pool. Workers dequeue from `rx`,
/// invoke the module, and push the (possibly mutated) entity onto `tx`.
/// Item errors are logged and the entity is dropped; the pipeline
/// continues per §7.
pub fn spawn(
    producer: Arc<dyn TraceProducer>,
    thread_count: usize,
    rx: Receiver<TraceEntity>,
    tx: Sender<TraceEntity>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..thread_count.max(1))
        .map(|_| {
            let producer = Arc::clone(&producer);
            let rx = rx.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                while let Some(mut entity) = recv_cancellable(&rx, &cancel) {
                    match producer.produce(&mut entity, &cancel) {
                        Ok(()) => {
                            if send_cancellable(&tx, entity, &cancel).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::error!("trace/{}: {e}", producer.name());
                            if matches!(e, ItemError::Io(_)) {
                                cancel.cancel_with_origin("trace", producer.name());
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_producer_records_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let testcase = dir.path().join("0.testcase");
        std::fs::write(&testcase, b"hi").unwrap();

        let mut opts = ModuleOptions::new();
        opts.insert("command".into(), toml::Value::String("true".into()));
        opts.insert(
            "raw_trace_directory".into(),
            toml::Value::String(dir.path().to_str().unwrap().into()),
        );
        let producer = CommandTraceProducer::from_options(&opts).unwrap();
        let mut entity = TraceEntity::new(0, testcase);
        producer.produce(&mut entity, &CancellationToken::new()).unwrap();
        assert!(entity.raw_trace_path.unwrap().ends_with("t0.trace"));
    }

    #[test]
    fn nonzero_exit_is_an_item_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = ModuleOptions::new();
        opts.insert("command".into(), toml::Value::String("false".into()));
        opts.insert(
            "raw_trace_directory".into(),
            toml::Value::String(dir.path().to_str().unwrap().into()),
        );
        let producer = CommandTraceProducer::from_options(&opts).unwrap();
        let mut entity = TraceEntity::new(0, dir.path().join("x"));
        assert!(producer.produce(&mut entity, &CancellationToken::new()).is_err());
    }
}
