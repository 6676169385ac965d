//! The call-stack leakage analyzer (§4.5): merges every preprocessed trace
//! into one consolidated call tree and reports per-access leakage scores.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use rand::Rng;
use serde::Serialize;

use crate::entity::TraceEntity;
use crate::error::{ConfigError, FatalError, ModuleError};
use crate::format::{AccessKind, TraceFormatError};
use crate::pipeline::stage::{Analyzer, ModuleOptions};

use super::call_tree::{AccessKey, BranchKey, CallKey, SequenceNode, StepKey};

/// Testcases below this count get a reported standard deviation of 0
/// rather than a bootstrap resample (§4.5).
const BOOTSTRAP_MIN_TESTCASES: usize = 8;
const BOOTSTRAP_ITERATIONS: usize = 200;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum SiteDescriptor {
    Access {
        instr_img: i32,
        instr_off: u32,
        access_kind: &'static str,
    },
    Call {
        caller_img: i32,
        caller_off: u32,
        callee_img: i32,
        callee_off: u32,
    },
    Branch {
        src_img: i32,
        src_off: u32,
        dst_img: i32,
        dst_off: u32,
    },
}

impl SiteDescriptor {
    fn from_key(key: &StepKey) -> Self {
        match key {
            StepKey::Access(AccessKey { instr_img, instr_off, kind }) => SiteDescriptor::Access {
                instr_img: *instr_img,
                instr_off: *instr_off,
                access_kind: match kind {
                    AccessKind::Image => "image",
                    AccessKind::Heap => "heap",
                    AccessKind::Stack => "stack",
                },
            },
            StepKey::Call(CallKey {
                caller_img,
                caller_off,
                callee_img,
                callee_off,
            }) => SiteDescriptor::Call {
                caller_img: *caller_img,
                caller_off: *caller_off,
                callee_img: *callee_img,
                callee_off: *callee_off,
            },
            StepKey::Jump(BranchKey {
                src_img,
                src_off,
                dst_img,
                dst_off,
            }) => SiteDescriptor::Branch {
                src_img: *src_img,
                src_off: *src_off,
                dst_img: *dst_img,
                dst_off: *dst_off,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeakageEntry {
    pub site: SiteDescriptor,
    pub testcase_count: usize,
    pub mutual_information: f64,
    pub conditional_guessing_entropy: f64,
    pub min_conditional_guessing_entropy: f64,
    pub score: f64,
    pub score_stddev: f64,
}

pub fn severity(score: f64) -> &'static str {
    if score > 80.0 {
        "error"
    } else if score > 20.0 {
        "warning"
    } else {
        "info"
    }
}

fn entropy_of_group_sizes(sizes: impl Iterator<Item = usize>, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    sizes
        .filter(|&s| s > 0)
        .map(|s| {
            let p = s as f64 / n as f64;
            -p * p.log2()
        })
        .sum()
}

fn entropy_of_partitioned_observation(observation: &HashMap<u64, u64>, population: &BTreeSet<u64>) -> f64 {
    let n = population.len();
    let mut by_value: HashMap<u64, usize> = HashMap::new();
    for tid in population {
        if let Some(&v) = observation.get(tid) {
            *by_value.entry(v).or_insert(0) += 1;
        }
    }
    entropy_of_group_sizes(by_value.values().copied(), n)
}

/// Computes the three leakage measures of §4.5 for one site.
///
/// `observation` maps testcase id to the value observed at this site
/// (an access target, or a split's alternative index). `partition` is the
/// testcase grouping imposed by the most recent *enclosing* split (empty
/// if there is none, in which case the whole reached set is one bucket).
fn leakage_stats(reached: &BTreeSet<u64>, observation: &HashMap<u64, u64>, partition: &[BTreeSet<u64>]) -> Stats {
    let n = reached.len();
    let log_n = (n as f64).log2();

    let h_target = entropy_of_partitioned_observation(observation, reached);

    let effective_partition: Vec<BTreeSet<u64>> = if partition.is_empty() {
        vec![reached.clone()]
    } else {
        partition
            .iter()
            .map(|bucket| bucket.intersection(reached).copied().collect::<BTreeSet<u64>>())
            .filter(|bucket| !bucket.is_empty())
            .collect()
    };

    let h_given_partition: f64 = effective_partition
        .iter()
        .map(|bucket| {
            let weight = bucket.len() as f64 / n as f64;
            weight * entropy_of_partitioned_observation(observation, bucket)
        })
        .sum();

    let mutual_information = (h_target - h_given_partition).max(0.0);
    let conditional_guessing_entropy = (log_n - h_target).max(0.0);

    let min_conditional_guessing_entropy = effective_partition
        .iter()
        .map(|bucket| {
            let bucket_n = bucket.len() as f64;
            (bucket_n.log2() - entropy_of_partitioned_observation(observation, bucket)).max(0.0)
        })
        .fold(f64::INFINITY, f64::min);
    let min_conditional_guessing_entropy = if min_conditional_guessing_entropy.is_finite() {
        min_conditional_guessing_entropy
    } else {
        conditional_guessing_entropy
    };

    let score = if log_n > 0.0 {
        (100.0 * (1.0 - min_conditional_guessing_entropy / log_n)).clamp(0.0, 100.0)
    } else {
        0.0
    };

    Stats {
        mutual_information,
        conditional_guessing_entropy,
        min_conditional_guessing_entropy,
        score,
    }
}

struct Stats {
    mutual_information: f64,
    conditional_guessing_entropy: f64,
    min_conditional_guessing_entropy: f64,
    score: f64,
}

fn bootstrap_score_stddev(reached: &BTreeSet<u64>, observation: &HashMap<u64, u64>, partition: &[BTreeSet<u64>]) -> f64 {
    if reached.len() < BOOTSTRAP_MIN_TESTCASES {
        return 0.0;
    }
    let ids: Vec<u64> = reached.iter().copied().collect();
    let mut rng = rand::thread_rng();
    let mut scores = Vec::with_capacity(BOOTSTRAP_ITERATIONS);
    for _ in 0..BOOTSTRAP_ITERATIONS {
        // Resample with replacement; duplicate ids are given fresh synthetic
        // identities so they contribute independent weight to the group
        // counts instead of collapsing via the `BTreeSet`.
        let mut resampled_reached = BTreeSet::new();
        let mut resampled_observation = HashMap::new();
        let mut resampled_partition: Vec<BTreeSet<u64>> = partition.iter().map(|_| BTreeSet::new()).collect();
        for slot in 0..ids.len() {
            let pick = ids[rng.gen_range(0..ids.len())];
            let synthetic_id = slot as u64;
            resampled_reached.insert(synthetic_id);
            if let Some(&v) = observation.get(&pick) {
                resampled_observation.insert(synthetic_id, v);
            }
            for (bucket, resampled_bucket) in partition.iter().zip(resampled_partition.iter_mut()) {
                if bucket.contains(&pick) {
                    resampled_bucket.insert(synthetic_id);
                    break;
                }
            }
        }
        let stats = leakage_stats(&resampled_reached, &resampled_observation, &resampled_partition);
        scores.push(stats.score);
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
    variance.sqrt()
}

/// A report node: one leaf-or-split block in the call-stack dump (§4.5).
#[derive(Serialize)]
pub struct ReportNode {
    pub call_stack_id: u64,
    pub site: Option<SiteDescriptor>,
    pub depth: usize,
    pub leakage_entries: Vec<LeakageEntry>,
}

fn walk(
    node: &SequenceNode,
    partition: &[BTreeSet<u64>],
    depth: usize,
    next_id: &mut u64,
    out: &mut Vec<ReportNode>,
) {
    let is_split = node.is_split();
    let new_partition: Vec<BTreeSet<u64>> = if is_split {
        node.children().map(|(_, b)| b.tagset.clone()).collect()
    } else {
        partition.to_vec()
    };

    if is_split {
        let reached: BTreeSet<u64> = new_partition.iter().flatten().copied().collect();
        if reached.len() >= 2 {
            let mut observation = HashMap::new();
            for (idx, (_, branch)) in node.children().enumerate() {
                for tid in &branch.tagset {
                    observation.insert(*tid, idx as u64);
                }
            }
            let stats = leakage_stats(&reached, &observation, partition);
            let stddev = bootstrap_score_stddev(&reached, &observation, partition);
            let id = *next_id;
            *next_id += 1;
            out.push(ReportNode {
                call_stack_id: id,
                site: None,
                depth,
                leakage_entries: vec![LeakageEntry {
                    site: SiteDescriptor::Branch {
                        src_img: 0,
                        src_off: 0,
                        dst_img: 0,
                        dst_off: 0,
                    },
                    testcase_count: reached.len(),
                    mutual_information: stats.mutual_information,
                    conditional_guessing_entropy: stats.conditional_guessing_entropy,
                    min_conditional_guessing_entropy: stats.min_conditional_guessing_entropy,
                    score: stats.score,
                    score_stddev: stddev,
                }],
            });
        }
    }

    for (key, branch) in node.children() {
        if !branch.histogram.is_empty() && branch.tagset.len() >= 2 {
            let stats = leakage_stats(&branch.tagset, &branch.histogram, partition);
            let stddev = bootstrap_score_stddev(&branch.tagset, &branch.histogram, partition);
            let id = *next_id;
            *next_id += 1;
            out.push(ReportNode {
                call_stack_id: id,
                site: Some(SiteDescriptor::from_key(key)),
                depth,
                leakage_entries: vec![LeakageEntry {
                    site: SiteDescriptor::from_key(key),
                    testcase_count: branch.tagset.len(),
                    mutual_information: stats.mutual_information,
                    conditional_guessing_entropy: stats.conditional_guessing_entropy,
                    min_conditional_guessing_entropy: stats.min_conditional_guessing_entropy,
                    score: stats.score,
                    score_stddev: stddev,
                }],
            });
        }
        if let Some(callee) = &branch.callee {
            walk(callee, &new_partition, depth + 1, next_id, out);
        }
        walk(&branch.continuation, &new_partition, depth, next_id, out);
    }
}

fn format_site(site: &SiteDescriptor) -> String {
    match site {
        SiteDescriptor::Access {
            instr_img,
            instr_off,
            access_kind,
        } => format!("{access_kind} access at {instr_img}:{instr_off:#x}"),
        SiteDescriptor::Call {
            caller_img,
            caller_off,
            callee_img,
            callee_off,
        } => format!("call {caller_img}:{caller_off:#x} -> {callee_img}:{callee_off:#x}"),
        SiteDescriptor::Branch {
            src_img,
            src_off,
            dst_img,
            dst_off,
        } => format!("branch {src_img}:{src_off:#x} -> {dst_img}:{dst_off:#x}"),
    }
}

fn write_text_report(path: &Path, nodes: &[ReportNode]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for node in nodes {
        let indent = "  ".repeat(node.depth);
        for entry in &node.leakage_entries {
            writeln!(
                file,
                "{indent}[{}] {} count={} mi={:.4} cge={:.4} h_min={:.4} score={:.2} (+/-{:.2}) [{}]",
                node.call_stack_id,
                format_site(&entry.site),
                entry.testcase_count,
                entry.mutual_information,
                entry.conditional_guessing_entropy,
                entry.min_conditional_guessing_entropy,
                entry.score,
                entry.score_stddev,
                severity(entry.score),
            )?;
        }
    }
    Ok(())
}

/// `CallStackAnalyzer` (§4.5): consumes every preprocessed trace, merges
/// them into a single `SequenceNode` tree under a mutex (add_trace declares
/// itself non-parallel so the runtime serializes callers), and at `finish`
/// walks the tree to compute leakage statistics and write the two report
/// files.
pub struct CallStackAnalyzer {
    tree: Mutex<SequenceNode>,
}

impl CallStackAnalyzer {
    pub fn from_options(_opts: &ModuleOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            tree: Mutex::new(SequenceNode::new()),
        })
    }

    fn load_entries(entity: &TraceEntity) -> Result<Vec<crate::format::TraceEntry>, ModuleError> {
        if let Some(trace) = &entity.preprocessed_trace {
            trace
                .iter()
                .collect::<Result<Vec<_>, TraceFormatError>>()
                .map_err(|e| ModuleError::new("analysis", "call-stack", e.to_string()))
        } else if let Some(path) = &entity.preprocessed_trace_path {
            let bytes = std::fs::read(path).map_err(|e| ModuleError::new("analysis", "call-stack", e.to_string()))?;
            crate::format::TraceReader::new(&bytes)
                .collect::<Result<Vec<_>, TraceFormatError>>()
                .map_err(|e| ModuleError::new("analysis", "call-stack", e.to_string()))
        } else {
            Err(ModuleError::new(
                "analysis",
                "call-stack",
                "trace entity carries no preprocessed trace".to_string(),
            ))
        }
    }
}

impl Analyzer for CallStackAnalyzer {
    fn name(&self) -> &'static str {
        "call-stack"
    }

    fn supports_parallel_add(&self) -> bool {
        false
    }

    fn add_trace(&self, entity: &TraceEntity) -> Result<(), ModuleError> {
        let entries = Self::load_entries(entity)?;
        let mut tree = self.tree.lock().unwrap();
        tree.insert_trace(entity.id, entries.into_iter());
        Ok(())
    }

    fn finish(&self, output_dir: Option<&Path>) -> Result<(), FatalError> {
        let Some(output_dir) = output_dir else {
            return Ok(());
        };
        let tree = self.tree.lock().unwrap();
        let mut nodes = Vec::new();
        let mut next_id = 0u64;
        walk(&tree, &[], 0, &mut next_id, &mut nodes);

        write_text_report(&output_dir.join("call-stacks.txt"), &nodes).map_err(FatalError::Io)?;

        let json = serde_json::to_vec_pretty(&nodes)
            .map_err(|e| ModuleError::new("analysis", "call-stack", e.to_string()))?;
        std::fs::write(output_dir.join("call-stacks.json"), json).map_err(FatalError::Io)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{BranchKind, TraceEntry};
    use std::collections::BTreeMap;

    fn entity_from(id: u64, entries: Vec<TraceEntry>) -> TraceEntity {
        let mut bytes = Vec::new();
        for e in &entries {
            e.encode(&mut bytes);
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("t{id}.trace.preprocessed"));
        std::fs::write(&path, &bytes).unwrap();
        std::mem::forget(dir); // keep the temp file alive for the test body
        let mut entity = TraceEntity::new(id, "x.testcase".into());
        entity.preprocessed_trace_path = Some(path);
        entity
    }

    #[test]
    fn single_testcase_reports_no_entries() {
        let analyzer = CallStackAnalyzer::from_options(&BTreeMap::new()).unwrap();
        let entries = vec![
            TraceEntry::Branch {
                src_img: 0,
                src_off: 0x10,
                dst_img: 0,
                dst_off: 0x20,
                taken: true,
                kind: BranchKind::Call,
            },
            TraceEntry::HeapMemoryAccess {
                is_write: false,
                instr_img: 0,
                instr_off: 0x30,
                alloc_id: 7,
                mem_off: 0,
            },
        ];
        analyzer.add_trace(&entity_from(0, entries)).unwrap();

        let tree = analyzer.tree.lock().unwrap();
        let mut nodes = Vec::new();
        let mut next_id = 0;
        walk(&tree, &[], 0, &mut next_id, &mut nodes);
        assert!(nodes.is_empty());
    }

    #[test]
    fn diverging_branch_after_shared_call_scores_100() {
        let analyzer = CallStackAnalyzer::from_options(&BTreeMap::new()).unwrap();
        let call = TraceEntry::Branch {
            src_img: 0,
            src_off: 0x10,
            dst_img: 0,
            dst_off: 0x20,
            taken: true,
            kind: BranchKind::Call,
        };
        let jump_a = TraceEntry::Branch {
            src_img: 0,
            src_off: 0x20,
            dst_img: 0,
            dst_off: 0x30,
            taken: true,
            kind: BranchKind::Jump,
        };
        let jump_b = TraceEntry::Branch {
            src_img: 0,
            src_off: 0x20,
            dst_img: 0,
            dst_off: 0x40,
            taken: true,
            kind: BranchKind::Jump,
        };
        analyzer.add_trace(&entity_from(0, vec![call.clone(), jump_a])).unwrap();
        analyzer.add_trace(&entity_from(1, vec![call, jump_b])).unwrap();

        let tree = analyzer.tree.lock().unwrap();
        let mut nodes = Vec::new();
        let mut next_id = 0;
        walk(&tree, &[], 0, &mut next_id, &mut nodes);

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].leakage_entries[0].testcase_count, 2);
        assert!((nodes[0].leakage_entries[0].score - 100.0).abs() < 1e-9);
    }
}
