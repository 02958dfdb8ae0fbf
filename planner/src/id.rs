// id.rs — Stable identifiers for planner artifacts
//
// Line ids give statements span-independent identity inside one unit graph;
// block ids are allocated once at grouping time and never reused, so merge
// and consolidation can redirect references instead of renumbering every
// surviving block's keys.

use serde::{Deserialize, Serialize};

/// Statement position within one unit graph. Function graphs reserve line 0
/// for the synthetic parameter-binding statement; body statements count from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineId(pub u32);

/// Permanent identity of a dependency block, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);
