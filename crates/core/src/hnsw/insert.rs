//! HNSW insertion.
//!
//! Three phases: greedy descent to the node's level, per-layer candidate
//! collection with heuristic neighbor selection (Algorithm 4 from the HNSW
//! paper), then bidirectional linking with over-capacity pruning. Recycled
//! IDs re-link their old slot in place; the stale inbound edges keep working
//! because the slot holds live data again.

use std::cell::RefCell;

use crate::error::{Error, Result};
use crate::hnsw::graph::HnswGraph;
use crate::hnsw::search::search_layer;
use crate::hnsw::visited::VisitedSet;
use crate::types::IntId;

thread_local! {
    /// Reused per-thread visited set; avoids a fresh allocation per insert.
    static INSERT_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::default());
}

impl HnswGraph {
    /// Insert or re-link a point under `id`.
    ///
    /// `replace_deleted` marks the insert as the reuse of a recycled ID; the
    /// old slot's data and links are overwritten in place. Inserting over a
    /// live slot has update semantics: new data, fresh links.
    pub fn add_point(&mut self, datum: &[u8], id: IntId, replace_deleted: bool) -> Result<()> {
        if datum.len() != self.state.data_size {
            return Err(Error::InvalidArgument(format!(
                "datum is {} bytes, space requires {}",
                datum.len(),
                self.state.data_size
            )));
        }
        self.ensure_slot(id)?;
        let slot = id as usize;
        if self.state.occupied[slot] && self.state.deleted[slot] && !replace_deleted {
            tracing::debug!(id, "re-linking a tombstoned slot without replace_deleted");
        }

        let level = self.random_level();
        let Some(entry) = self.resolve_entry(id) else {
            // First live node: no links to build.
            self.write_node(slot, datum, level);
            self.state.entry_point = Some(id);
            self.state.max_layer = level;
            return Ok(());
        };

        // Phases 1 and 2 run against the graph as it is, before this node's
        // links are rewritten; the node itself is excluded from candidates.
        let top = level.min(self.state.max_layer);
        let node_neighbors = INSERT_VISITED.with(|cell| {
            let mut visited = cell.borrow_mut();
            visited.ensure_capacity(self.state.occupied.len());
            visited.clear();
            let accept_all = |_: IntId| true;

            let mut current = entry;
            for layer in (level + 1..=self.state.max_layer).rev() {
                let nearest = search_layer(
                    self,
                    datum,
                    std::slice::from_ref(&current),
                    1,
                    layer,
                    &mut visited,
                    &accept_all,
                );
                if let Some(&(_, found)) = nearest.first() {
                    if found != id {
                        current = found;
                    }
                }
            }

            let mut node_neighbors: Vec<Vec<IntId>> = vec![Vec::new(); level + 1];
            let mut entry_points = vec![current];
            for layer in (0..=top).rev() {
                let candidates: Vec<(f32, IntId)> = search_layer(
                    self,
                    datum,
                    &entry_points,
                    self.state.config.ef_construction,
                    layer,
                    &mut visited,
                    &accept_all,
                )
                .into_iter()
                .filter(|&(_, c)| c != id)
                .collect();

                let m_max = if layer == 0 {
                    self.state.config.m_max0
                } else {
                    self.state.config.m
                };
                let selected = self.select_neighbors(&candidates, m_max);
                node_neighbors[layer] = selected.iter().map(|&(_, n)| n).collect();

                entry_points.clear();
                entry_points.extend(candidates.iter().map(|&(_, n)| n));
                if entry_points.is_empty() {
                    entry_points.push(entry);
                }
            }
            node_neighbors
        });

        self.write_node(slot, datum, level);
        self.state.neighbors[slot] = node_neighbors;

        // Phase 3: backlinks with pruning.
        for layer in 0..=top {
            let m_max = if layer == 0 {
                self.state.config.m_max0
            } else {
                self.state.config.m
            };

            let my_neighbors = self.state.neighbors[slot][layer].clone();
            for &neighbor in &my_neighbors {
                let n_slot = neighbor as usize;
                while self.state.neighbors[n_slot].len() <= layer {
                    self.state.neighbors[n_slot].push(Vec::new());
                }
                if !self.state.neighbors[n_slot][layer].contains(&id) {
                    self.state.neighbors[n_slot][layer].push(id);
                }

                if self.state.neighbors[n_slot][layer].len() > m_max {
                    let ids = self.state.neighbors[n_slot][layer].clone();
                    let base = self.vector(neighbor);
                    let candidates: Vec<(f32, IntId)> = ids
                        .iter()
                        .map(|&cid| (self.space.distance(base, self.vector(cid)), cid))
                        .collect();
                    let pruned = self.select_neighbors(&candidates, m_max);
                    self.state.neighbors[n_slot][layer] =
                        pruned.iter().map(|&(_, n)| n).collect();
                }
            }
        }

        if level > self.state.max_layer {
            self.state.max_layer = level;
            self.state.entry_point = Some(id);
        }
        Ok(())
    }

    /// Overwrite a slot's data and reset its link state for `level + 1`
    /// layers.
    fn write_node(&mut self, slot: usize, datum: &[u8], level: usize) {
        let start = slot * self.state.data_size;
        self.state.data[start..start + self.state.data_size].copy_from_slice(datum);
        self.state.occupied[slot] = true;
        self.state.deleted[slot] = false;
        self.state.layers[slot] = level as u8;
        self.state.neighbors[slot] = vec![Vec::new(); level + 1];
    }

    /// Pick the navigation entry for inserting `id`: the entry point, unless
    /// that is `id` itself, in which case any other live node. `None` means
    /// the graph has no other live node to navigate from.
    fn resolve_entry(&self, id: IntId) -> Option<IntId> {
        match self.state.entry_point {
            None => None,
            Some(ep) if ep != id => Some(ep),
            Some(_) => (0..self.state.occupied.len())
                .find(|&s| {
                    s != id as usize && self.state.occupied[s] && !self.state.deleted[s]
                })
                .map(|s| s as IntId),
        }
    }

    /// Heuristic neighbor selection (HNSW paper, Algorithm 4).
    ///
    /// A candidate is kept only while it is closer to the base than to every
    /// already-selected neighbor, which spreads links across directions
    /// instead of clustering them. Leftover slots are filled with the
    /// closest unused candidates.
    fn select_neighbors(&self, candidates: &[(f32, IntId)], m: usize) -> Vec<(f32, IntId)> {
        let mut sorted = candidates.to_vec();
        sorted.sort_unstable_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut selected: Vec<(f32, IntId)> = Vec::with_capacity(m);
        for &(dist_to_base, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            let candidate_vec = self.vector(cid);
            let diverse = selected.iter().all(|&(_, sid)| {
                dist_to_base <= self.space.distance(candidate_vec, self.vector(sid))
            });
            if diverse {
                selected.push((dist_to_base, cid));
            }
        }

        if selected.len() < m {
            for &(dist, cid) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|&(_, sid)| sid == cid) {
                    selected.push((dist, cid));
                }
            }
        }
        selected
    }
}
