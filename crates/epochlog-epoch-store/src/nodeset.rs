//! Replica set selection
//!
//! Candidates are ranked per log by hashing (rendezvous style), so the same
//! log keeps landing on the same shards while the nodes configuration is
//! unchanged. The ranked list is then walked from the biggest failure
//! domain down so the replication property is covered first.

use epochlog_common::{
    Error, FailureDomainChecker, LocationScope, LogId, NodesConfiguration, ReplicationProperty,
    Result, ShardId,
};
use std::collections::{BTreeMap, HashSet};
use xxhash_rust::xxh64::xxh64;

fn score(log: LogId, shard: ShardId) -> u64 {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&log.get().to_le_bytes());
    key[8..10].copy_from_slice(&shard.node.get().to_le_bytes());
    key[10..].copy_from_slice(&shard.shard.to_le_bytes());
    xxh64(&key, 0)
}

/// Pick `size` shards for `log` (at least the replication factor), one per
/// node, spanning the failure domains `replication` requires.
pub fn select_replica_set(
    log: LogId,
    nodes: &NodesConfiguration,
    replication: &ReplicationProperty,
    size: usize,
) -> Result<Vec<ShardId>> {
    replication.validate()?;
    let target = size.max(usize::from(replication.replication_factor()));

    // Best-ranked shard of every writable node.
    let mut best: BTreeMap<_, ShardId> = BTreeMap::new();
    for shard in nodes.writable_shards() {
        let entry = best.entry(shard.node).or_insert(shard);
        if score(log, shard) > score(log, *entry) {
            *entry = shard;
        }
    }
    let mut ranked: Vec<ShardId> = best.into_values().collect();
    ranked.sort_by_key(|s| std::cmp::Reverse(score(log, *s)));

    let mut selected: Vec<ShardId> = Vec::with_capacity(target);
    for scope in LocationScope::ALL.iter().rev() {
        let required = usize::from(replication.effective(*scope));
        let mut covered: HashSet<String> = selected
            .iter()
            .filter_map(|s| nodes.domain_of(*s, *scope))
            .collect();
        for candidate in &ranked {
            if covered.len() >= required || selected.len() >= target {
                break;
            }
            if selected.contains(candidate) {
                continue;
            }
            if let Some(domain) = nodes.domain_of(*candidate, *scope)
                && covered.insert(domain)
            {
                selected.push(*candidate);
            }
        }
    }
    for candidate in &ranked {
        if selected.len() >= target {
            break;
        }
        if !selected.contains(candidate) {
            selected.push(*candidate);
        }
    }

    if !FailureDomainChecker::new(nodes, replication).can_replicate(&selected) {
        return Err(Error::Failed(format!(
            "cannot place log {log} with replication {replication} on {} writable nodes",
            ranked.len()
        )));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochlog_common::{NodeInfo, NodeLocation};

    #[test]
    fn test_selection_is_stable() {
        let nodes = NodesConfiguration::flat(5);
        let repl = ReplicationProperty::nodes(3);
        let a = select_replica_set(LogId::new(7), &nodes, &repl, 3).unwrap();
        let b = select_replica_set(LogId::new(7), &nodes, &repl, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        let distinct: HashSet<_> = a.iter().map(|s| s.node).collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_selection_spans_racks() {
        let nodes = NodesConfiguration::new(
            1,
            (0..6).map(|i| NodeInfo::new(i, NodeLocation::new("r", "dc", format!("rack{}", i % 2)))),
        );
        let repl = ReplicationProperty::nodes(2).with(LocationScope::Rack, 2);
        for log in 1..20 {
            let set = select_replica_set(LogId::new(log), &nodes, &repl, 2).unwrap();
            assert!(FailureDomainChecker::new(&nodes, &repl).can_replicate(&set));
        }
    }

    #[test]
    fn test_not_enough_nodes() {
        let nodes = NodesConfiguration::flat(2);
        let repl = ReplicationProperty::nodes(3);
        assert!(matches!(
            select_replica_set(LogId::new(1), &nodes, &repl, 3),
            Err(Error::Failed(_))
        ));
    }

    #[test]
    fn test_nodeset_larger_than_replication() {
        let nodes = NodesConfiguration::flat(5);
        let repl = ReplicationProperty::nodes(2);
        let set = select_replica_set(LogId::new(3), &nodes, &repl, 4).unwrap();
        assert_eq!(set.len(), 4);
    }
}
