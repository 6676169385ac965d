//! The consolidated call tree (§3, §4.5): testcases are merged into a trie
//! over their ordered step sequences (calls, intra-call jumps, memory
//! accesses). A node with more than one distinct next-step is, by
//! construction, a split: its children's tag sets are disjoint and their
//! union is this node's own reached set, which is exactly the invariant
//! §8 asks for.

use std::collections::{BTreeSet, HashMap};

use crate::format::{AccessKind, BranchKind, TraceEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub caller_img: i32,
    pub caller_off: u32,
    pub callee_img: i32,
    pub callee_off: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchKey {
    pub src_img: i32,
    pub src_off: u32,
    pub dst_img: i32,
    pub dst_off: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessKey {
    pub instr_img: i32,
    pub instr_off: u32,
    pub kind: AccessKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepKey {
    Call(CallKey),
    Jump(BranchKey),
    Access(AccessKey),
}

enum Step {
    Call { key: CallKey, body: Vec<Step> },
    Jump { key: BranchKey },
    Access { key: AccessKey, target: u64 },
}

impl Step {
    fn step_key(&self) -> StepKey {
        match self {
            Step::Call { key, .. } => StepKey::Call(*key),
            Step::Jump { key } => StepKey::Jump(*key),
            Step::Access { key, .. } => StepKey::Access(*key),
        }
    }
}

/// Parses one testcase's flat, ordered preprocessed entries into a nested
/// step tree: a `Call` owns the sub-sequence between it and its matching
/// `Return`; everything else stays at the current level. Heap/stack
/// allocation bookkeeping entries carry no call-stack-leakage signal on
/// their own and are not part of the step sequence.
fn build_steps(entries: impl Iterator<Item = TraceEntry>) -> Vec<Step> {
    let mut stack: Vec<Vec<Step>> = vec![Vec::new()];
    for entry in entries {
        match entry {
            TraceEntry::Branch {
                src_img,
                src_off,
                dst_img,
                dst_off,
                kind: BranchKind::Call,
                ..
            } => {
                stack.last_mut().unwrap().push(Step::Call {
                    key: CallKey {
                        caller_img: src_img,
                        caller_off: src_off,
                        callee_img: dst_img,
                        callee_off: dst_off,
                    },
                    body: Vec::new(),
                });
                stack.push(Vec::new());
            }
            TraceEntry::Branch {
                kind: BranchKind::Return, ..
            } => {
                if stack.len() > 1 {
                    let body = stack.pop().unwrap();
                    if let Some(Step::Call { body: b, .. }) = stack.last_mut().unwrap().last_mut() {
                        *b = body;
                    }
                }
            }
            TraceEntry::Branch {
                src_img,
                src_off,
                dst_img,
                dst_off,
                kind: BranchKind::Jump,
                ..
            } => {
                stack.last_mut().unwrap().push(Step::Jump {
                    key: BranchKey {
                        src_img,
                        src_off,
                        dst_img,
                        dst_off,
                    },
                });
            }
            other => {
                if let (Some((instr_img, instr_off, kind)), Some(target)) =
                    (other.access_site(), other.access_target())
                {
                    stack.last_mut().unwrap().push(Step::Access {
                        key: AccessKey { instr_img, instr_off, kind },
                        target,
                    });
                }
            }
        }
    }
    while stack.len() > 1 {
        let body = stack.pop().unwrap();
        if let Some(Step::Call { body: b, .. }) = stack.last_mut().unwrap().last_mut() {
            *b = body;
        }
    }
    stack.pop().unwrap_or_default()
}

/// One position in the merged tree: the distinct next-steps taken from
/// here, each carrying the set of testcases that took it (§4.5's "split
/// node" and "alternatives", unified into ordinary trie children).
#[derive(Default)]
pub struct SequenceNode {
    next: HashMap<StepKey, Branch>,
    order: Vec<StepKey>,
}

pub struct Branch {
    pub tagset: BTreeSet<u64>,
    /// Populated only for `Access` steps: testcase id -> observed target.
    pub histogram: HashMap<u64, u64>,
    pub callee: Option<Box<SequenceNode>>,
    pub continuation: Box<SequenceNode>,
}

impl SequenceNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_trace(&mut self, testcase_id: u64, entries: impl Iterator<Item = TraceEntry>) {
        let steps = build_steps(entries);
        self.insert_steps(testcase_id, &steps);
    }

    fn insert_steps(&mut self, testcase_id: u64, steps: &[Step]) {
        let Some((step, rest)) = steps.split_first() else {
            return;
        };
        let key = step.step_key();
        if !self.next.contains_key(&key) {
            self.order.push(key.clone());
        }
        let branch = self.next.entry(key).or_insert_with(|| Branch {
            tagset: BTreeSet::new(),
            histogram: HashMap::new(),
            callee: None,
            continuation: Box::new(SequenceNode::new()),
        });
        branch.tagset.insert(testcase_id);
        if let Step::Access { target, .. } = step {
            branch.histogram.insert(testcase_id, *target);
        }
        if let Step::Call { body, .. } = step {
            branch
                .callee
                .get_or_insert_with(|| Box::new(SequenceNode::new()))
                .insert_steps(testcase_id, body);
        }
        branch.continuation.insert_steps(testcase_id, rest);
    }

    /// Children in first-insertion order, alongside the step identity that
    /// reaches each one.
    pub fn children(&self) -> impl Iterator<Item = (&StepKey, &Branch)> {
        self.order.iter().map(move |k| (k, &self.next[k]))
    }

    pub fn is_split(&self) -> bool {
        self.next.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TraceEntry;

    fn call(src: u32, dst: u32) -> TraceEntry {
        TraceEntry::Branch {
            src_img: 0,
            src_off: src,
            dst_img: 0,
            dst_off: dst,
            taken: true,
            kind: BranchKind::Call,
        }
    }

    fn jump(src: u32, dst: u32) -> TraceEntry {
        TraceEntry::Branch {
            src_img: 0,
            src_off: src,
            dst_img: 0,
            dst_off: dst,
            taken: true,
            kind: BranchKind::Jump,
        }
    }

    #[test]
    fn identical_traces_share_one_path() {
        let mut root = SequenceNode::new();
        root.insert_trace(0, vec![call(0x10, 0x20)].into_iter());
        root.insert_trace(1, vec![call(0x10, 0x20)].into_iter());
        assert!(!root.is_split());
        let (_, branch) = root.children().next().unwrap();
        assert_eq!(branch.tagset, BTreeSet::from([0, 1]));
    }

    #[test]
    fn diverging_jump_after_a_shared_call_creates_a_split() {
        let mut root = SequenceNode::new();
        root.insert_trace(0, vec![call(0x10, 0x20), jump(0x20, 0x30)].into_iter());
        root.insert_trace(1, vec![call(0x10, 0x20), jump(0x20, 0x40)].into_iter());

        assert!(!root.is_split());
        let (_, call_branch) = root.children().next().unwrap();
        assert!(call_branch.continuation.is_split());
        let alt_tagsets: Vec<BTreeSet<u64>> = call_branch
            .continuation
            .children()
            .map(|(_, b)| b.tagset.clone())
            .collect();
        assert_eq!(alt_tagsets, vec![BTreeSet::from([0]), BTreeSet::from([1])]);
    }

    #[test]
    fn return_reattaches_the_body_and_resumes_the_caller_sequence() {
        let entries = vec![
            call(0x10, 0x20),
            TraceEntry::Branch {
                src_img: 0,
                src_off: 0x20,
                dst_img: 0,
                dst_off: 0x11,
                taken: true,
                kind: BranchKind::Return,
            },
            jump(0x11, 0x12),
        ];
        let mut root = SequenceNode::new();
        root.insert_trace(0, entries.into_iter());
        let (_, call_branch) = root.children().next().unwrap();
        assert!(call_branch.callee.is_none());
        assert_eq!(call_branch.continuation.children().count(), 1);
    }
}
