// parplan — parallelization planner for restricted data-processing programs
//
// Library root. Analysis stages live here as modules.

pub mod ast;
pub mod boundary;
pub mod ddg;
pub mod diag;
pub mod emit;
pub mod error;
pub mod estimate;
pub mod extract;
pub mod group;
pub mod id;
pub mod parallel;
pub mod pass;
pub mod pipeline;
pub mod schedule;
pub mod textscan;
