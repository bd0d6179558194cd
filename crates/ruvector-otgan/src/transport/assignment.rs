//! Hungarian algorithm (Kuhn–Munkres with potentials), O(n³).
//!
//! For N == M an optimal permutation is a vertex of the uniform transport
//! polytope, so the assignment scaled by `1/N` is an exact OT plan.

use ndarray::ArrayView2;

/// Minimum-cost assignment between rows and columns of `cost`.
///
/// Returns `(row, col)` pairs sorted by row. Rectangular inputs are padded
/// with zero-cost dummies, so `min(rows, cols)` pairs are returned.
pub fn hungarian_assignment(cost: ArrayView2<'_, f64>) -> Vec<(usize, usize)> {
    let (n_rows, n_cols) = cost.dim();
    if n_rows == 0 || n_cols == 0 {
        return vec![];
    }

    let n = n_rows.max(n_cols);
    let entry = |i: usize, j: usize| -> f64 {
        if i < n_rows && j < n_cols {
            cost[[i, j]]
        } else {
            0.0
        }
    };

    // u[i]: row potential (1-indexed), v[j]: column potential (index 0 = dummy source).
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; n + 1];
    // p[j]: 1-indexed row assigned to column j (0 = unassigned).
    let mut p = vec![0_usize; n + 1];
    // way[j]: predecessor column of j on the current augmenting path.
    let mut way = vec![0_usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0_usize;
        let mut min_val = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        // Dijkstra-like search for the shortest augmenting path.
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0_usize;

            for j in 1..=n {
                if !used[j] {
                    let val = entry(i0 - 1, j - 1) - u[i0] - v[j];
                    if val < min_val[j] {
                        min_val[j] = val;
                        way[j] = j0;
                    }
                    if min_val[j] < delta {
                        delta = min_val[j];
                        j1 = j;
                    }
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_val[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // Augment along the path.
        loop {
            p[j0] = p[way[j0]];
            j0 = way[j0];
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignments: Vec<(usize, usize)> = (1..=n)
        .filter(|&j| p[j] != 0 && p[j] - 1 < n_rows && j - 1 < n_cols)
        .map(|j| (p[j] - 1, j - 1))
        .collect();
    assignments.sort_unstable();
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn total(cost: &ndarray::Array2<f64>, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(i, j)| cost[[i, j]]).sum()
    }

    #[test]
    fn identity_cost_prefers_diagonal() {
        let c = array![[0.0, 1.0, 1.0], [1.0, 0.0, 1.0], [1.0, 1.0, 0.0]];
        assert_eq!(hungarian_assignment(c.view()), vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn finds_anti_diagonal_optimum() {
        let c = array![[10.0, 10.0, 1.0], [10.0, 1.0, 10.0], [1.0, 10.0, 10.0]];
        let pairs = hungarian_assignment(c.view());
        assert_eq!(pairs, vec![(0, 2), (1, 1), (2, 0)]);
        assert_eq!(total(&c, &pairs), 3.0);
    }

    #[test]
    fn matches_brute_force_on_4x4() {
        let c = array![
            [9.0, 2.0, 7.0, 8.0],
            [6.0, 4.0, 3.0, 7.0],
            [5.0, 8.0, 1.0, 8.0],
            [7.0, 6.0, 9.0, 4.0]
        ];
        let pairs = hungarian_assignment(c.view());
        // Known optimum: 0->1, 1->0, 2->2, 3->3 = 2 + 6 + 1 + 4.
        assert_eq!(total(&c, &pairs), 13.0);

        let mut best = f64::INFINITY;
        let idx = [0usize, 1, 2, 3];
        for a in idx {
            for b in idx {
                for d in idx {
                    for e in idx {
                        let perm = [a, b, d, e];
                        let mut seen = [false; 4];
                        if perm.iter().all(|&k| !std::mem::replace(&mut seen[k], true)) {
                            best = best.min((0..4).map(|i| c[[i, perm[i]]]).sum());
                        }
                    }
                }
            }
        }
        assert_eq!(total(&c, &pairs), best);
    }

    #[test]
    fn rectangular_returns_min_side_pairs() {
        let c = array![[5.0, 1.0, 9.0], [1.0, 5.0, 9.0]];
        let pairs = hungarian_assignment(c.view());
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn empty_input_returns_empty() {
        let c = ndarray::Array2::<f64>::zeros((0, 0));
        assert!(hungarian_assignment(c.view()).is_empty());
    }
}
