//! Splitting a batch into lots

use crate::models::FeaturePayload;
use std::collections::HashMap;

/// Partition item indices into lots of at most `lot_size`
///
/// When items carry more than one distinguishable kind, indices are first
/// interleaved round-robin across kinds (in order of first appearance) so
/// each lot holds a balanced mix instead of one kind per lot.
pub fn partition(items: &[FeaturePayload], lot_size: usize) -> Vec<Vec<usize>> {
    let lot_size = lot_size.max(1);
    let order = interleave_by_kind(items);
    order.chunks(lot_size).map(|chunk| chunk.to_vec()).collect()
}

fn interleave_by_kind(items: &[FeaturePayload]) -> Vec<usize> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut group_of: HashMap<Option<String>, usize> = HashMap::new();

    for (index, item) in items.iter().enumerate() {
        let label = item.kind_label();
        let slot = match group_of.get(&label) {
            Some(slot) => *slot,
            None => {
                groups.push(Vec::new());
                group_of.insert(label, groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[slot].push(index);
    }

    if groups.len() <= 1 {
        return (0..items.len()).collect();
    }

    let longest = groups.iter().map(Vec::len).max().unwrap_or(0);
    let mut order = Vec::with_capacity(items.len());
    for round in 0..longest {
        for group in &groups {
            if let Some(index) = group.get(round) {
                order.push(*index);
            }
        }
    }
    order
}
