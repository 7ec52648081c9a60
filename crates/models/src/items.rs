//! Container-hierarchy helpers shared by the bag slot operations.

use crate::Id;

/// The slash-joined chain of container ids from the top container down to
/// an item, e.g. `PXYZ/BAG1/I123`.
pub fn join_path(chain: &[&Id]) -> String {
    chain
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

/// Merge an incoming stack of `incoming` units onto a stack currently
/// holding `count` units with capacity `stackmax`. Returns the number of
/// units moved onto the target stack.
pub fn stack_merge(count: i64, incoming: i64, stackmax: i64) -> i64 {
    (stackmax - count).clamp(0, incoming)
}
