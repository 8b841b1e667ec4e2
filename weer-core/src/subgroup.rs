//! Partitioning of a bin's walkers into subgroups.
//!
//! Split/merge decisions are made within subgroups first so that distinct
//! histories are not merged away before the bin-wide count adjustment.
//! Policies are trait objects tagged with `typetag`, so a configuration file
//! can name the policy it wants:
//!
//! ```toml
//! [subgroup]
//! type = "by_parent"
//! ```

use crate::errors::{WeError, WeResult};
use crate::walker::Walker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Policy that partitions the walkers of one bin.
///
/// Implementations return groups of indices into `walkers`. Every index must
/// appear in exactly one group and no group may be empty.
#[typetag::serde(tag = "type")]
pub trait SubgroupFunction: std::fmt::Debug + Send + Sync {
    fn partition(&self, bin_index: usize, walkers: &[Walker]) -> Vec<Vec<usize>>;
}

/// Every walker of the bin in a single subgroup.
///
/// With this policy the controller reduces to the classic Huber–Kim scheme.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityGrouping {}

#[typetag::serde(name = "identity")]
impl SubgroupFunction for IdentityGrouping {
    fn partition(&self, _bin_index: usize, walkers: &[Walker]) -> Vec<Vec<usize>> {
        if walkers.is_empty() {
            return vec![];
        }
        vec![(0..walkers.len()).collect()]
    }
}

/// One subgroup per lineage parent, in order of first appearance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentGrouping {}

#[typetag::serde(name = "by_parent")]
impl SubgroupFunction for ParentGrouping {
    fn partition(&self, _bin_index: usize, walkers: &[Walker]) -> Vec<Vec<usize>> {
        let mut order: Vec<i64> = Vec::new();
        let mut groups: HashMap<i64, Vec<usize>> = HashMap::new();

        for (i, walker) in walkers.iter().enumerate() {
            groups
                .entry(walker.parent_id)
                .or_insert_with(|| {
                    order.push(walker.parent_id);
                    Vec::new()
                })
                .push(i);
        }

        order
            .into_iter()
            .filter_map(|parent| groups.remove(&parent))
            .collect()
    }
}

/// Apply a subgroup policy, moving the bin's walkers into their subgroups.
///
/// Rejects partitions that drop, duplicate or invent walkers, contain empty
/// groups, or produce no groups for a non-empty bin.
pub fn form_subgroups(
    function: &dyn SubgroupFunction,
    bin_index: usize,
    walkers: Vec<Walker>,
) -> WeResult<Vec<Vec<Walker>>> {
    if walkers.is_empty() {
        return Ok(vec![]);
    }

    let partition = function.partition(bin_index, &walkers);
    if partition.is_empty() {
        return Err(WeError::Configuration(format!(
            "Subgroup function {:?} returned no subgroups for bin {} with {} walkers",
            function,
            bin_index,
            walkers.len()
        )));
    }

    let mut seen = vec![false; walkers.len()];
    for group in &partition {
        if group.is_empty() {
            return Err(WeError::Configuration(format!(
                "Subgroup function {:?} returned an empty subgroup for bin {}",
                function, bin_index
            )));
        }
        for &i in group {
            match seen.get_mut(i) {
                Some(flag) if !*flag => *flag = true,
                Some(_) => {
                    return Err(WeError::Configuration(format!(
                        "Walker {} of bin {} appears in more than one subgroup",
                        i, bin_index
                    )))
                }
                None => {
                    return Err(WeError::Configuration(format!(
                        "Subgroup index {} is out of range for bin {} with {} walkers",
                        i,
                        bin_index,
                        walkers.len()
                    )))
                }
            }
        }
    }
    if let Some(missing) = seen.iter().position(|flag| !flag) {
        return Err(WeError::Configuration(format!(
            "Walker {} of bin {} is not assigned to any subgroup",
            missing, bin_index
        )));
    }

    let mut slots: Vec<Option<Walker>> = walkers.into_iter().map(Some).collect();
    Ok(partition
        .into_iter()
        .map(|group| group.into_iter().filter_map(|i| slots[i].take()).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walker(parent: i64) -> Walker {
        Walker::from_trajectory(0.1, vec![1.0])
            .unwrap()
            .with_parent(parent)
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct FixedPartition {
        groups: Vec<Vec<usize>>,
    }

    #[typetag::serde(name = "fixed")]
    impl SubgroupFunction for FixedPartition {
        fn partition(&self, _bin_index: usize, _walkers: &[Walker]) -> Vec<Vec<usize>> {
            self.groups.clone()
        }
    }

    #[test]
    fn test_identity_grouping() {
        let walkers = vec![walker(1), walker(2), walker(1)];
        let groups = form_subgroups(&IdentityGrouping {}, 0, walkers).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn test_parent_grouping_preserves_first_appearance() {
        let walkers = vec![walker(5), walker(2), walker(5), walker(9), walker(2)];
        let partition = ParentGrouping {}.partition(0, &walkers);
        assert_eq!(partition, vec![vec![0, 2], vec![1, 4], vec![3]]);

        let groups = form_subgroups(&ParentGrouping {}, 0, walkers).unwrap();
        let parents: Vec<i64> = groups.iter().map(|g| g[0].parent_id).collect();
        assert_eq!(parents, vec![5, 2, 9]);
    }

    #[test]
    fn test_empty_bin_has_no_subgroups() {
        let groups = form_subgroups(&IdentityGrouping {}, 0, vec![]).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_invalid_partitions_rejected() {
        let cases = vec![
            vec![],
            vec![vec![0, 1]],
            vec![vec![0, 1], vec![1, 2]],
            vec![vec![0, 1, 2, 3]],
            vec![vec![0, 1, 2], vec![]],
        ];
        for groups in cases {
            let function = FixedPartition {
                groups: groups.clone(),
            };
            let result = form_subgroups(&function, 3, vec![walker(1), walker(2), walker(3)]);
            assert!(
                matches!(result, Err(WeError::Configuration(_))),
                "partition {:?} should be rejected",
                groups
            );
        }
    }

    #[test]
    fn test_policy_serialization() {
        let policy: Box<dyn SubgroupFunction> = Box::new(ParentGrouping {});
        let serialised = serde_json::to_string(&policy).unwrap();
        assert_eq!(serialised, r#"{"type":"by_parent"}"#);

        let deserialised: Box<dyn SubgroupFunction> = serde_json::from_str(&serialised).unwrap();
        let walkers = vec![walker(1), walker(2)];
        assert_eq!(deserialised.partition(0, &walkers).len(), 2);
    }
}
