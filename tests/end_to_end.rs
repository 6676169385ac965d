//! Exercises the whole pipeline through its public configuration surface:
//! real testcase/trace/preprocess/analysis modules wired together and run
//! to completion, rather than individual module unit tests.

use std::collections::BTreeMap;

use leakpipe::config::{GeneralConfig, RawConfig, StageConfig};
use leakpipe::error::PipelineError;
use leakpipe::pipeline::Pipeline;

fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, toml::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), toml::Value::String(v.to_string())))
        .collect()
}

fn write_testcases(dir: &std::path::Path, count: usize) {
    for i in 0..count {
        std::fs::write(dir.join(format!("{i}.testcase")), format!("case {i}")).unwrap();
    }
}

#[test]
fn pipeline_runs_end_to_end_and_writes_a_report() {
    let root = tempfile::tempdir().unwrap();
    let testcase_dir = root.path().join("testcases");
    let raw_dir = root.path().join("raw");
    let output_dir = root.path().join("out");
    std::fs::create_dir_all(&testcase_dir).unwrap();
    write_testcases(&testcase_dir, 2);

    let images_file = root.path().join("images.txt");
    std::fs::write(&images_file, "").unwrap();
    let prefix_trace_file = root.path().join("prefix.trace");
    std::fs::write(&prefix_trace_file, []).unwrap();

    let config = RawConfig {
        general: GeneralConfig {
            output_directory: Some(output_dir.clone()),
            store_traces: false,
        },
        constants: BTreeMap::new(),
        base_file: None,
        testcase: StageConfig {
            module: "directory".into(),
            module_options: opts(&[("directory", testcase_dir.to_str().unwrap())]),
            ..Default::default()
        },
        trace: StageConfig {
            module: "command".into(),
            module_options: opts(&[
                ("command", "touch"),
                ("raw_trace_directory", raw_dir.to_str().unwrap()),
            ])
            .into_iter()
            .chain(std::iter::once((
                "args".to_string(),
                toml::Value::Array(vec![toml::Value::String("{output}".into())]),
            )))
            .collect(),
            ..Default::default()
        },
        preprocess: StageConfig {
            module: "native".into(),
            module_options: opts(&[
                ("images_file", images_file.to_str().unwrap()),
                ("prefix_trace_file", prefix_trace_file.to_str().unwrap()),
            ]),
            ..Default::default()
        },
        analysis: vec![StageConfig {
            module: "call-stack".into(),
            ..Default::default()
        }],
    };

    let pipeline = Pipeline::build(&config).unwrap();
    pipeline.run().unwrap();

    assert!(output_dir.join("call-stacks.txt").exists());
    assert!(output_dir.join("call-stacks.json").exists());
}

#[test]
fn a_missing_raw_trace_cancels_the_pipeline_with_a_fatal_preprocess_error() {
    let root = tempfile::tempdir().unwrap();
    let testcase_dir = root.path().join("testcases");
    let raw_dir = root.path().join("raw");
    std::fs::create_dir_all(&testcase_dir).unwrap();
    write_testcases(&testcase_dir, 1);

    let images_file = root.path().join("images.txt");
    std::fs::write(&images_file, "").unwrap();
    let prefix_trace_file = root.path().join("prefix.trace");
    std::fs::write(&prefix_trace_file, []).unwrap();

    let config = RawConfig {
        general: GeneralConfig {
            output_directory: None,
            store_traces: false,
        },
        constants: BTreeMap::new(),
        base_file: None,
        testcase: StageConfig {
            module: "directory".into(),
            module_options: opts(&[("directory", testcase_dir.to_str().unwrap())]),
            ..Default::default()
        },
        trace: StageConfig {
            module: "command".into(),
            // "true" succeeds without ever creating the output file, so the
            // preprocessor sees a raw_trace_path that doesn't exist on disk.
            module_options: opts(&[
                ("command", "true"),
                ("raw_trace_directory", raw_dir.to_str().unwrap()),
            ]),
            ..Default::default()
        },
        preprocess: StageConfig {
            module: "native".into(),
            module_options: opts(&[
                ("images_file", images_file.to_str().unwrap()),
                ("prefix_trace_file", prefix_trace_file.to_str().unwrap()),
            ]),
            ..Default::default()
        },
        analysis: vec![StageConfig {
            module: "call-stack".into(),
            ..Default::default()
        }],
    };

    let pipeline = Pipeline::build(&config).unwrap();
    let err = pipeline.run().unwrap_err();
    match err {
        PipelineError::Fatal { stage, .. } => assert_eq!(stage, "preprocess"),
        other => panic!("expected a fatal preprocess error, got {other:?}"),
    }
}
