// src/orchestrator/partition.rs
//! Graph partitioning
//!
//! Splits a graph of agents into per-instance shards whose sizes differ
//! by at most one, with the remainder spread over the leading shards.
//! Concatenating the shards in instance order reconstructs the input.

use crate::api::CreateAgent;

/// Partition `graph` into `n` shards of near-equal size
///
/// Returns an empty vector when `n` is zero; callers are expected to
/// have rejected an empty instance set before partitioning.
pub fn partition(graph: &[CreateAgent], n: usize) -> Vec<Vec<CreateAgent>> {
    if n == 0 {
        return Vec::new();
    }

    let base = graph.len() / n;
    let extra = graph.len() % n;

    let mut shards = Vec::with_capacity(n);
    let mut offset = 0;
    for i in 0..n {
        let size = if i < extra { base + 1 } else { base };
        shards.push(graph[offset..offset + size].to_vec());
        offset += size;
    }

    shards
}
