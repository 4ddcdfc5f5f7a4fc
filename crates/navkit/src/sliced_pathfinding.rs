//! Sliced path search
//!
//! [`SlicedFindPath`] holds the whole A* state (node pool, open list, best
//! node so far) and borrows the mesh only for the duration of each call, so a
//! driver can step it once per tick and mutate the mesh in between. Every
//! step first re-validates the references it holds; a search whose tiles were
//! swapped out underneath it fails with `StaleReference` instead of walking
//! into recycled polygons.

use navkit_common::{vdist, vis_finite, Error, Result};

use super::node_pool::{NodeFlags, NodeIndex, NodePool, NodeQueue};
use super::{NavMesh, PolyRef, QueryFilter, Status};

/// Scale applied to the distance heuristic to keep it admissible
pub const H_SCALE: f32 = 0.999;

/// State of a sliced path search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicedPathState {
    /// Budget ran out with open nodes left
    InProgress,
    /// The end polygon was reached
    Succeeded,
    /// The open list emptied before reaching the end
    PartialFailed,
    /// The node pool ran out or the mesh changed under the search
    Failed,
}

impl SlicedPathState {
    pub fn is_terminal(&self) -> bool {
        *self != SlicedPathState::InProgress
    }
}

/// Ordered polygon corridor from a finished search
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathCorridor {
    /// Polygons from start to the end (or the best reachable polygon)
    pub polys: Vec<PolyRef>,
    /// The corridor stops short of the requested end polygon
    pub partial: bool,
    /// The corridor was cut at the requested maximum length
    pub truncated: bool,
}

/// Resumable A* search over the polygon graph
#[derive(Debug)]
pub struct SlicedFindPath {
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: [f32; 3],
    end_pos: [f32; 3],
    filter: QueryFilter,
    h_scale: f32,
    pool: NodePool,
    open: NodeQueue,
    state: SlicedPathState,
    failure: Option<Status>,
    last_best: NodeIndex,
    last_best_cost: f32,
    out_of_nodes: bool,
    order: u64,
    iterations: usize,
}

impl SlicedFindPath {
    /// Validates the endpoints and seeds the open list with the start polygon
    pub fn init(
        mesh: &NavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_nodes: usize,
    ) -> Result<Self> {
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(Status::InvalidStart.into());
        }
        if !mesh.is_valid_poly_ref(end_ref) {
            return Err(Status::InvalidEnd.into());
        }
        if !vis_finite(start_pos) || !vis_finite(end_pos) {
            return Err(Status::InvalidParam.into());
        }
        if max_nodes == 0 {
            return Err(Error::InvalidInput("max_nodes must be positive".into()));
        }

        let mut pool = NodePool::new(max_nodes);
        let mut open = NodeQueue::new(max_nodes);
        let h_scale = H_SCALE * filter.min_area_cost();

        let start = pool.get_node(start_ref).ok_or(Status::OutOfNodes)?;
        let heuristic = vdist(start_pos, end_pos) * h_scale;
        {
            let node = pool.node_mut(start);
            node.pos = *start_pos;
            node.cost = 0.0;
            node.total = heuristic;
            node.parent = None;
            node.flags = NodeFlags::OPEN;
        }

        let state = if start_ref == end_ref {
            SlicedPathState::Succeeded
        } else {
            open.push(start, &pool);
            SlicedPathState::InProgress
        };

        Ok(Self {
            start_ref,
            end_ref,
            start_pos: *start_pos,
            end_pos: *end_pos,
            filter: filter.clone(),
            h_scale,
            pool,
            open,
            state,
            failure: None,
            last_best: start,
            last_best_cost: heuristic,
            out_of_nodes: false,
            order: 0,
            iterations: 0,
        })
    }

    pub fn state(&self) -> SlicedPathState {
        self.state
    }

    pub fn start_ref(&self) -> PolyRef {
        self.start_ref
    }

    pub fn end_ref(&self) -> PolyRef {
        self.end_ref
    }

    /// Nodes expanded over all calls so far
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Expands up to `max_iter` nodes
    ///
    /// Returns the number of nodes expanded in this call and the resulting
    /// state. Expanding the end node finishes the search in the same call.
    pub fn update(&mut self, mesh: &NavMesh, max_iter: usize) -> Result<(usize, SlicedPathState)> {
        if self.state.is_terminal() {
            return Ok((0, self.state));
        }

        if !mesh.is_valid_poly_ref(self.end_ref)
            || self.pool.nodes().iter().any(|n| !mesh.is_valid_poly_ref(n.id))
        {
            self.fail(Status::StaleReference);
            return Err(Status::StaleReference.into());
        }

        let mut iter = 0;
        while iter < max_iter {
            let Some(best) = self.open.pop(&self.pool) else {
                break;
            };
            iter += 1;
            {
                let node = self.pool.node_mut(best);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }

            let best_ref = self.pool.node(best).id;
            if best_ref == self.end_ref {
                self.last_best = best;
                self.iterations += iter;
                self.finish(SlicedPathState::Succeeded);
                return Ok((iter, self.state));
            }

            self.expand(mesh, best)?;
        }
        self.iterations += iter;

        if self.open.is_empty() {
            if self.out_of_nodes {
                self.fail(Status::OutOfNodes);
            } else {
                self.finish(SlicedPathState::PartialFailed);
            }
        }
        Ok((iter, self.state))
    }

    fn expand(&mut self, mesh: &NavMesh, best: NodeIndex) -> Result<()> {
        let best_ref = self.pool.node(best).id;
        let best_pos = self.pool.node(best).pos;
        let best_cost = self.pool.node(best).cost;
        let parent_ref = self.pool.node(best).parent.map(|p| self.pool.node(p).id);

        let (best_tile, best_poly) = match mesh.get_tile_and_poly_by_ref(best_ref) {
            Ok(found) => found,
            Err(e) => {
                self.fail(Status::StaleReference);
                return Err(e);
            }
        };

        for link in best_tile.poly_links(best_poly) {
            let nei_ref = link.reference;
            if !nei_ref.is_valid() || Some(nei_ref) == parent_ref {
                continue;
            }
            let Ok((_, nei_poly)) = mesh.get_tile_and_poly_by_ref(nei_ref) else {
                continue;
            };
            if !self.filter.pass_filter(nei_poly) {
                continue;
            }

            let Some(nei) = self.pool.get_node(nei_ref) else {
                self.out_of_nodes = true;
                continue;
            };

            if self.pool.node(nei).flags.is_empty() {
                let Ok(mid) = mesh.get_edge_mid_point(best_ref, nei_ref) else {
                    continue;
                };
                self.pool.node_mut(nei).pos = mid;
            }
            let nei_pos = self.pool.node(nei).pos;

            let (cost, heuristic) = if nei_ref == self.end_ref {
                let cur_cost = self.filter.get_cost(&best_pos, &nei_pos, best_poly.area);
                let end_cost = self.filter.get_cost(&nei_pos, &self.end_pos, nei_poly.area);
                (best_cost + cur_cost + end_cost, 0.0)
            } else {
                let cur_cost = self.filter.get_cost(&best_pos, &nei_pos, best_poly.area);
                (
                    best_cost + cur_cost,
                    vdist(&nei_pos, &self.end_pos) * self.h_scale,
                )
            };
            let total = cost + heuristic;

            let flags = self.pool.node(nei).flags;
            if flags.intersects(NodeFlags::OPEN | NodeFlags::CLOSED)
                && total >= self.pool.node(nei).total
            {
                continue;
            }

            self.order += 1;
            {
                let node = self.pool.node_mut(nei);
                node.parent = Some(best);
                node.cost = cost;
                node.total = total;
                node.order = self.order;
                node.flags.remove(NodeFlags::CLOSED);
            }

            if flags.contains(NodeFlags::OPEN) {
                self.open.modify(nei, &self.pool);
            } else {
                self.pool.node_mut(nei).flags.insert(NodeFlags::OPEN);
                self.open.push(nei, &self.pool);
            }

            if heuristic < self.last_best_cost {
                self.last_best_cost = heuristic;
                self.last_best = nei;
            }
        }
        Ok(())
    }

    fn finish(&mut self, state: SlicedPathState) {
        self.state = state;
        log::debug!(
            "sliced search {} -> {} finished as {:?} after {} iterations",
            self.start_ref,
            self.end_ref,
            state,
            self.iterations
        );
    }

    fn fail(&mut self, status: Status) {
        self.failure = Some(status);
        self.finish(SlicedPathState::Failed);
    }

    /// Corridor from the start to the closest node reached so far
    ///
    /// Available in any state; while in progress it follows the current best
    /// guess.
    pub fn current_corridor(&self) -> Vec<PolyRef> {
        self.corridor_to(self.last_best)
    }

    fn corridor_to(&self, end: NodeIndex) -> Vec<PolyRef> {
        let mut polys = Vec::new();
        let mut cur = Some(end);
        while let Some(idx) = cur {
            let node = self.pool.node(idx);
            polys.push(node.id);
            cur = node.parent;
        }
        polys.reverse();
        polys
    }

    fn terminal_failure(&self) -> Result<()> {
        match self.state {
            SlicedPathState::InProgress => Err(Status::QueryNotFinished.into()),
            SlicedPathState::Failed => {
                Err(self.failure.unwrap_or(Status::OutOfNodes).into())
            }
            SlicedPathState::Succeeded | SlicedPathState::PartialFailed => Ok(()),
        }
    }

    /// Extracts the corridor of a finished search
    ///
    /// Fails with `NotFinished` before a terminal state and with the failure
    /// cause after `Failed`. A `PartialFailed` search yields the corridor to
    /// the polygon closest to the end.
    pub fn finalize(&self, max_path: usize) -> Result<PathCorridor> {
        self.terminal_failure()?;
        let polys = self.corridor_to(self.last_best);
        let partial = self.state == SlicedPathState::PartialFailed
            || polys.last() != Some(&self.end_ref);
        Ok(Self::clip(polys, partial, max_path))
    }

    /// Extracts a corridor leading to the furthest polygon of `existing` that
    /// the search visited
    ///
    /// Used to replan cheaply along a previous corridor. Falls back to the
    /// best node when none of `existing` was visited.
    pub fn finalize_partial(&self, existing: &[PolyRef], max_path: usize) -> Result<PathCorridor> {
        if existing.is_empty() {
            return Err(Status::InvalidParam.into());
        }
        if self.state == SlicedPathState::Failed {
            return self.terminal_failure().map(|_| PathCorridor::default());
        }

        let target = existing
            .iter()
            .rev()
            .find_map(|&r| self.pool.find_node(r))
            .unwrap_or(self.last_best);
        let polys = self.corridor_to(target);
        let partial = polys.last() != Some(&self.end_ref);
        Ok(Self::clip(polys, partial, max_path))
    }

    fn clip(mut polys: Vec<PolyRef>, partial: bool, max_path: usize) -> PathCorridor {
        let truncated = polys.len() > max_path;
        polys.truncate(max_path);
        PathCorridor {
            polys,
            partial,
            truncated,
        }
    }

    /// Start position the search was initialized with
    pub fn start_pos(&self) -> &[f32; 3] {
        &self.start_pos
    }

    pub fn end_pos(&self) -> &[f32; 3] {
        &self.end_pos
    }
}

/// Runs a sliced search to completion in steps of `slice_size` nodes
///
/// Returns the corridor and the number of calls that were needed.
#[allow(clippy::too_many_arguments)]
pub fn find_path_sliced(
    mesh: &NavMesh,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: &[f32; 3],
    end_pos: &[f32; 3],
    filter: &QueryFilter,
    max_nodes: usize,
    slice_size: usize,
) -> Result<(PathCorridor, usize)> {
    if slice_size == 0 {
        return Err(Status::InvalidParam.into());
    }
    let mut search = SlicedFindPath::init(
        mesh, start_ref, end_ref, start_pos, end_pos, filter, max_nodes,
    )?;
    let mut calls = 0;
    while !search.state().is_terminal() {
        search.update(mesh, slice_size)?;
        calls += 1;
    }
    Ok((search.finalize(usize::MAX)?, calls))
}
