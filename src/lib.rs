//! The trace pipeline: four stages (test case, trace, preprocess, analysis)
//! joined by bounded queues, plus the canonical binary trace format and the
//! two reference preprocessors (§2, §4).

pub mod analysis;
pub mod cancel;
pub mod config;
pub mod entity;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod preprocessors;
