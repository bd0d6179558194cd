//! Exact transportation simplex (MODI / u–v method).
//!
//! The basis is a spanning tree of the bipartite row/column graph with
//! `n + m − 1` cells. Each pivot:
//!
//! 1. solves `u_i + v_j = C[i, j]` on the tree (breadth-first from row 0),
//! 2. picks the non-basic cell with the most negative reduced cost
//!    `C[i, j] − u_i − v_j` (stop when none is negative),
//! 3. walks the tree path closing the cycle through that cell and shifts
//!    the smallest flow on the cycle's losing cells.
//!
//! Masses are integers. Uniform marginals `1/N` and `1/M` are scaled by
//! `L = lcm(N, M)` so every supply is `L/N` and every demand is `L/M`; the
//! pivots are then exact and the returned plan meets its marginals up to
//! the final division by `L`.

use ndarray::{Array2, ArrayView2};
use std::collections::VecDeque;
use tracing::debug;

use super::{check_finite, TransportPlan};
use crate::error::{OtError, OtResult};

/// Exact transportation simplex over integer masses.
#[derive(Debug, Clone)]
pub struct TransportSimplex {
    supply: Vec<i64>,
    demand: Vec<i64>,
    max_pivots: usize,
}

impl TransportSimplex {
    /// Uniform masses `1/n` and `1/m`, scaled to integers.
    pub fn uniform(n: usize, m: usize) -> Self {
        let g = gcd(n.max(1), m.max(1));
        Self {
            supply: vec![(m / g) as i64; n],
            demand: vec![(n / g) as i64; m],
            max_pivots: 1_000_000,
        }
    }

    /// Arbitrary positive integer masses with equal totals.
    pub fn new(supply: Vec<i64>, demand: Vec<i64>) -> OtResult<Self> {
        if supply.is_empty() || demand.is_empty() {
            return Err(OtError::empty_input("transportation masses"));
        }
        if supply.iter().chain(&demand).any(|&w| w <= 0) {
            return Err(OtError::invalid_parameter("masses", "every mass must be > 0"));
        }
        let (s, d): (i64, i64) = (supply.iter().sum(), demand.iter().sum());
        if s != d {
            return Err(OtError::invalid_parameter("masses", format!("supply {s} != demand {d}")));
        }
        Ok(Self { supply, demand, max_pivots: 1_000_000 })
    }

    /// Cap on the number of pivots. Default: **1_000_000**.
    pub fn with_max_pivots(mut self, max_pivots: usize) -> Self {
        self.max_pivots = max_pivots.max(1);
        self
    }

    /// Solve for the cost matrix `cost` (rows = supplies, cols = demands).
    pub fn solve(&self, cost: ArrayView2<'_, f64>) -> OtResult<TransportPlan> {
        let (n, m) = cost.dim();
        if n != self.supply.len() || m != self.demand.len() {
            return Err(OtError::shape_mismatch(vec![self.supply.len(), self.demand.len()], vec![n, m]));
        }
        if n == 0 || m == 0 {
            return Err(OtError::empty_input("cost matrix"));
        }
        check_finite(&cost)?;

        let scale = cost.iter().fold(0.0_f64, |acc, c| acc.max(c.abs()));
        let tol = 1e-12 * (1.0 + scale);

        let mut basis = Basis::northwest_corner(&self.supply, &self.demand);
        let mut tree = Tree::new(n, m);
        let mut pivots = 0;

        loop {
            tree.rebuild(&basis, cost);

            let mut entering = None;
            let mut best = -tol;
            for i in 0..n {
                let ui = tree.potential[i];
                for j in 0..m {
                    if basis.contains(i, j, m) {
                        continue;
                    }
                    let reduced = cost[[i, j]] - ui - tree.potential[n + j];
                    if reduced < best {
                        best = reduced;
                        entering = Some((i, j));
                    }
                }
            }

            let Some((ei, ej)) = entering else {
                debug!(pivots, n, m, "transportation simplex reached optimality");
                break;
            };
            if pivots == self.max_pivots {
                return Err(OtError::SolverStalled { iterations: pivots });
            }
            pivots += 1;

            // Cells on the tree path from column ej back to row ei; even
            // positions lose flow, odd positions gain it.
            let path = tree.path(n + ej, ei);
            let leaving_pos = path
                .iter()
                .step_by(2)
                .enumerate()
                .min_by_key(|&(_, &cell)| basis.flow[cell])
                .map(|(k, _)| 2 * k)
                .ok_or_else(|| OtError::numerical_instability("empty pivot cycle in transportation simplex"))?;
            let leaving = path[leaving_pos];
            let theta = basis.flow[leaving];

            for (k, &cell) in path.iter().enumerate() {
                if k % 2 == 0 {
                    basis.flow[cell] -= theta;
                } else {
                    basis.flow[cell] += theta;
                }
            }
            basis.replace(leaving, (ei, ej), theta, m);
        }

        let total: i64 = self.supply.iter().sum();
        let mut plan = Array2::zeros((n, m));
        for (&(i, j), &f) in basis.cells.iter().zip(&basis.flow) {
            plan[[i, j]] = f as f64 / total as f64;
        }

        let transport_cost = (&plan * &cost).sum();
        let marginal_error = self.marginal_error(&plan, total);
        Ok(TransportPlan { plan, cost: transport_cost, iterations: pivots, marginal_error, converged: true })
    }

    fn marginal_error(&self, plan: &Array2<f64>, total: i64) -> f64 {
        let t = total as f64;
        let rows: f64 = plan.outer_iter().zip(&self.supply).map(|(r, &s)| (r.sum() - s as f64 / t).abs()).sum();
        let cols: f64 = plan.columns().into_iter().zip(&self.demand).map(|(c, &d)| (c.sum() - d as f64 / t).abs()).sum();
        rows + cols
    }
}

// ---------------------------------------------------------------------------
// Basis
// ---------------------------------------------------------------------------

struct Basis {
    cells: Vec<(usize, usize)>,
    flow: Vec<i64>,
    member: Vec<bool>,
}

impl Basis {
    /// Initial feasible tree; ties (row and column exhausted together) keep
    /// a zero-flow cell so the basis always has `n + m − 1` cells.
    fn northwest_corner(supply: &[i64], demand: &[i64]) -> Self {
        let (n, m) = (supply.len(), demand.len());
        let mut s = supply.to_vec();
        let mut d = demand.to_vec();
        let mut basis = Basis {
            cells: Vec::with_capacity(n + m - 1),
            flow: Vec::with_capacity(n + m - 1),
            member: vec![false; n * m],
        };

        let (mut i, mut j) = (0, 0);
        loop {
            let q = s[i].min(d[j]);
            s[i] -= q;
            d[j] -= q;
            basis.cells.push((i, j));
            basis.flow.push(q);
            basis.member[i * m + j] = true;

            if i == n - 1 && j == m - 1 {
                break;
            }
            if i == n - 1 {
                j += 1;
            } else if j == m - 1 || s[i] == 0 {
                i += 1;
            } else {
                j += 1;
            }
        }
        basis
    }

    fn contains(&self, i: usize, j: usize, m: usize) -> bool {
        self.member[i * m + j]
    }

    fn replace(&mut self, slot: usize, cell: (usize, usize), flow: i64, m: usize) {
        let (oi, oj) = self.cells[slot];
        self.member[oi * m + oj] = false;
        self.cells[slot] = cell;
        self.flow[slot] = flow;
        self.member[cell.0 * m + cell.1] = true;
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// Basis tree rooted at row 0. Nodes `0..n` are rows, `n..n+m` columns.
struct Tree {
    n: usize,
    adjacency: Vec<Vec<usize>>,
    potential: Vec<f64>,
    parent: Vec<usize>,
    parent_cell: Vec<usize>,
    depth: Vec<usize>,
}

impl Tree {
    fn new(n: usize, m: usize) -> Self {
        let nodes = n + m;
        Self {
            n,
            adjacency: vec![Vec::new(); nodes],
            potential: vec![0.0; nodes],
            parent: vec![usize::MAX; nodes],
            parent_cell: vec![usize::MAX; nodes],
            depth: vec![0; nodes],
        }
    }

    fn rebuild(&mut self, basis: &Basis, cost: ArrayView2<'_, f64>) {
        for adj in &mut self.adjacency {
            adj.clear();
        }
        for (k, &(i, j)) in basis.cells.iter().enumerate() {
            self.adjacency[i].push(k);
            self.adjacency[self.n + j].push(k);
        }
        self.parent.fill(usize::MAX);

        let mut queue = VecDeque::from([0usize]);
        self.potential[0] = 0.0;
        self.depth[0] = 0;
        self.parent[0] = 0;
        while let Some(node) = queue.pop_front() {
            for &k in &self.adjacency[node] {
                let (i, j) = basis.cells[k];
                let next = if node < self.n { self.n + j } else { i };
                if self.parent[next] != usize::MAX {
                    continue;
                }
                // u_i + v_j = C[i, j]
                self.potential[next] = cost[[i, j]] - self.potential[node];
                self.parent[next] = node;
                self.parent_cell[next] = k;
                self.depth[next] = self.depth[node] + 1;
                queue.push_back(next);
            }
        }
    }

    /// Basis cells on the tree path from `from` to `to`, in walk order.
    fn path(&self, from: usize, to: usize) -> Vec<usize> {
        let (mut a, mut b) = (from, to);
        let mut head = Vec::new();
        let mut tail = Vec::new();
        while self.depth[a] > self.depth[b] {
            head.push(self.parent_cell[a]);
            a = self.parent[a];
        }
        while self.depth[b] > self.depth[a] {
            tail.push(self.parent_cell[b]);
            b = self.parent[b];
        }
        while a != b {
            head.push(self.parent_cell[a]);
            a = self.parent[a];
            tail.push(self.parent_cell[b]);
            b = self.parent[b];
        }
        head.extend(tail.into_iter().rev());
        head
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
