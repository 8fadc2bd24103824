use std::collections::BTreeMap;

/// The part of a live document the resolver ranks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRow {
    pub document_id: i64,
    pub collection_id: i64,
    pub ordering_key: i64,
    pub sequence_number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub document_id: i64,
    pub collection_id: i64,
    pub old_number: i64,
    pub target_number: i64,
}

impl Assignment {
    pub fn is_move(&self) -> bool {
        self.old_number != self.target_number
    }
}

/// Target numbers for every live document in scope, grouped by collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenumberPlan {
    collections: BTreeMap<i64, Vec<Assignment>>,
}

impl RenumberPlan {
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub fn document_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    /// All assignments, in collection order then target order.
    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.collections.values().flatten()
    }

    /// Assignments whose number actually changes. Unchanged documents are never written.
    pub fn moves(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments().filter(|assignment| assignment.is_move())
    }

    pub fn move_count(&self) -> usize {
        self.moves().count()
    }

    /// Collections with at least one move.
    pub fn touched_collections(&self) -> Vec<i64> {
        self.collections
            .iter()
            .filter(|(_, assignments)| assignments.iter().any(Assignment::is_move))
            .map(|(collection_id, _)| *collection_id)
            .collect()
    }

    pub fn collection(&self, collection_id: i64) -> &[Assignment] {
        self.collections
            .get(&collection_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Rank every row within its collection by `(ordering_key, sequence_number)`.
///
/// Target numbers are dense from 1. Document id breaks any remaining tie so the
/// result is deterministic even for input that already violates uniqueness.
pub fn resolve_targets(rows: &[SnapshotRow]) -> RenumberPlan {
    let mut grouped: BTreeMap<i64, Vec<&SnapshotRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.collection_id).or_default().push(row);
    }

    let collections = grouped
        .into_iter()
        .map(|(collection_id, mut members)| {
            members.sort_by_key(|row| (row.ordering_key, row.sequence_number, row.document_id));
            let assignments: Vec<Assignment> = members
                .into_iter()
                .zip(1i64..)
                .map(|(row, target_number)| Assignment {
                    document_id: row.document_id,
                    collection_id,
                    old_number: row.sequence_number,
                    target_number,
                })
                .collect();
            (collection_id, assignments)
        })
        .collect();

    RenumberPlan { collections }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(document_id: i64, collection_id: i64, ordering_key: i64, sequence_number: i64) -> SnapshotRow {
        SnapshotRow {
            document_id,
            collection_id,
            ordering_key,
            sequence_number,
        }
    }

    fn targets(plan: &RenumberPlan, collection_id: i64) -> Vec<(i64, i64)> {
        let mut out: Vec<(i64, i64)> = plan
            .collection(collection_id)
            .iter()
            .map(|a| (a.document_id, a.target_number))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn ranks_by_ordering_key_within_collection() {
        let plan = resolve_targets(&[row(10, 1, 100, 3), row(11, 1, 200, 1), row(12, 1, 300, 2)]);
        assert_eq!(targets(&plan, 1), vec![(10, 1), (11, 2), (12, 3)]);
        assert_eq!(plan.move_count(), 3);
        assert_eq!(plan.touched_collections(), vec![1]);
    }

    #[test]
    fn equal_ordering_keys_fall_back_to_previous_number() {
        let plan = resolve_targets(&[row(1, 5, 50, 9), row(2, 5, 50, 4), row(3, 5, 10, 7)]);
        assert_eq!(targets(&plan, 5), vec![(1, 3), (2, 2), (3, 1)]);
    }

    #[test]
    fn sparse_numbers_compact_to_dense_range() {
        let plan = resolve_targets(&[row(1, 2, 1, 4), row(2, 2, 2, 10), row(3, 2, 3, 11)]);
        let numbers: Vec<i64> = plan.collection(2).iter().map(|a| a.target_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(plan.move_count(), 3);
    }

    #[test]
    fn already_ordered_collections_produce_no_moves() {
        let plan = resolve_targets(&[row(1, 1, 10, 1), row(2, 1, 20, 2), row(3, 2, 5, 1)]);
        assert_eq!(plan.collection_count(), 2);
        assert_eq!(plan.document_count(), 3);
        assert_eq!(plan.move_count(), 0);
        assert!(plan.touched_collections().is_empty());
    }

    #[test]
    fn collections_are_ranked_independently() {
        let plan = resolve_targets(&[row(1, 1, 30, 1), row(2, 2, 10, 1), row(3, 1, 20, 2)]);
        assert_eq!(targets(&plan, 1), vec![(1, 2), (3, 1)]);
        assert_eq!(targets(&plan, 2), vec![(2, 1)]);
        assert_eq!(plan.touched_collections(), vec![1]);
    }

    #[test]
    fn empty_snapshot_yields_empty_plan() {
        let plan = resolve_targets(&[]);
        assert_eq!(plan, RenumberPlan::default());
        assert!(plan.collection(1).is_empty());
    }
}
