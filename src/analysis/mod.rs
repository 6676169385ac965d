//! The call-stack leakage analyzer (§4.5).

pub mod call_tree;
pub mod leakage;
