//! Deterministic layer partitioning and group repair.
//!
//! All decisions here are pure functions of node ids, complexity hints and
//! prerequisite edges. Provider output never reaches this module, which is
//! what makes tree shape independent of call completion order.

use crate::policy::engine::first_forward_violation;
use crate::policy::{GroupChild, ViolationCode};

/// Chunk an id-sorted layer into candidate groups of at most `max` members.
///
/// A trailing chunk of one is a singleton passthrough; it still occupies a
/// slot in the group-index sequence.
pub(crate) fn chunk_layer(layer: &[GroupChild], max: usize) -> Vec<Vec<GroupChild>> {
    layer.chunks(max.max(1)).map(|c| c.to_vec()).collect()
}

/// Order a group dependency-first, id-order as tie-break.
///
/// Members arrive in id order. Repeatedly place the id-smallest member whose
/// in-group prerequisites are already placed; when a cycle leaves no member
/// eligible, place the id-smallest remaining member anyway. Acyclic groups
/// therefore always satisfy the prerequisite-order policy; cyclic groups
/// surface a residual forward edge for the split rule to act on.
pub(crate) fn order_group(members: Vec<GroupChild>) -> Vec<GroupChild> {
    let ids: Vec<_> = members.iter().map(|m| m.id.clone()).collect();
    let mut remaining = members;
    let mut placed: Vec<_> = Vec::with_capacity(remaining.len());
    let mut placed_ids: Vec<_> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let pick = remaining
            .iter()
            .position(|m| {
                m.prerequisites
                    .iter()
                    .all(|p| !ids.contains(p) || placed_ids.contains(p))
            })
            .unwrap_or(0);
        let member = remaining.remove(pick);
        placed_ids.push(member.id.clone());
        placed.push(member);
    }
    placed
}

/// Split a non-compliant group into two non-empty sub-groups.
///
/// Split point, in priority order:
/// 1. `prerequisite_order`: immediately after the first forward-violating
///    dependent, separating it from the prerequisite placed behind it.
/// 2. `complexity_band`: at the widest adjacent complexity-hint gap,
///    earliest position on ties.
/// 3. Otherwise: halve.
///
/// The choice of split point is deliberately simple; only its determinism
/// is load-bearing.
pub(crate) fn split_group(
    group: &[GroupChild],
    codes: &[ViolationCode],
) -> (Vec<GroupChild>, Vec<GroupChild>) {
    debug_assert!(group.len() >= 2, "cannot split a singleton");

    if codes.contains(&ViolationCode::PrerequisiteOrder) {
        if let Some((dependent, _)) = first_forward_violation(group) {
            let at = dependent + 1;
            if at < group.len() {
                return (group[..at].to_vec(), group[at..].to_vec());
            }
        }
    }

    if codes.contains(&ViolationCode::ComplexityBand) {
        if let Some(at) = widest_gap_split(group) {
            return (group[..at].to_vec(), group[at..].to_vec());
        }
    }

    let mid = (group.len() / 2).max(1);
    (group[..mid].to_vec(), group[mid..].to_vec())
}

/// Split index after the left side of the widest gap between adjacent
/// complexity hints, or None when fewer than two members carry hints.
fn widest_gap_split(group: &[GroupChild]) -> Option<usize> {
    let hinted: Vec<(usize, u32)> = group
        .iter()
        .enumerate()
        .filter_map(|(ix, m)| m.complexity.map(|c| (ix, c)))
        .collect();
    if hinted.len() < 2 {
        return None;
    }

    let mut best: Option<(u32, usize)> = None;
    for pair in hinted.windows(2) {
        let (left, lc) = pair[0];
        let (_, rc) = pair[1];
        let gap = lc.abs_diff(rc);
        let at = left + 1;
        if best.map_or(true, |(bg, _)| gap > bg) {
            best = Some((gap, at));
        }
    }
    best.and_then(|(gap, at)| (gap > 0 && at < group.len()).then_some(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn child(id: &str, complexity: Option<u32>, prereqs: &[&str]) -> GroupChild {
        GroupChild {
            id: NodeId::new(id),
            complexity,
            statement: format!("statement {id}"),
            prerequisites: prereqs.iter().map(|p| NodeId::new(*p)).collect(),
        }
    }

    #[test]
    fn test_chunk_layer_sizes() {
        let layer: Vec<GroupChild> = (0..7).map(|i| child(&format!("l{i}"), None, &[])).collect();
        let chunks = chunk_layer(&layer, 3);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_order_group_places_prerequisites_first() {
        // In id order l1 depends on l2.
        let group = vec![child("l1", None, &["l2"]), child("l2", None, &[])];
        let ordered = order_group(group);
        let ids: Vec<&str> = ordered.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["l2", "l1"]);
    }

    #[test]
    fn test_order_group_breaks_cycles_by_id() {
        let group = vec![
            child("a", None, &["d"]),
            child("b", None, &["a"]),
            child("c", None, &["b"]),
            child("d", None, &["c"]),
        ];
        let ordered = order_group(group);
        let ids: Vec<&str> = ordered.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_split_on_prerequisite_violation() {
        // Residual cycle edge: a (placed first) requires d (placed last).
        let group = vec![
            child("a", None, &["d"]),
            child("b", None, &["a"]),
            child("c", None, &["b"]),
            child("d", None, &["c"]),
        ];
        let (left, right) = split_group(&group, &[ViolationCode::PrerequisiteOrder]);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id.as_str(), "a");
        assert_eq!(right.len(), 3);
    }

    #[test]
    fn test_split_on_widest_complexity_gap() {
        let group = vec![
            child("l1", Some(1), &[]),
            child("l2", Some(2), &[]),
            child("l3", Some(7), &[]),
            child("l4", Some(8), &[]),
        ];
        let (left, right) = split_group(&group, &[ViolationCode::ComplexityBand]);
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 2);
        assert_eq!(right[0].id.as_str(), "l3");
    }

    #[test]
    fn test_split_halves_without_gap_information() {
        let group = vec![
            child("l1", None, &[]),
            child("l2", None, &[]),
            child("l3", None, &[]),
        ];
        let (left, right) = split_group(&group, &[ViolationCode::EvidenceCoverage]);
        assert_eq!(left.len(), 1);
        assert_eq!(right.len(), 2);
    }

    #[test]
    fn test_split_is_deterministic() {
        let group = vec![
            child("l1", Some(2), &[]),
            child("l2", Some(3), &[]),
            child("l3", Some(3), &[]),
            child("l4", Some(4), &[]),
        ];
        let a = split_group(&group, &[ViolationCode::ComplexityBand]);
        let b = split_group(&group, &[ViolationCode::ComplexityBand]);
        assert_eq!(a, b);
    }
}
