//! Dense linear algebra for the projection solve.
//!
//! The projection extractor builds a `2^n × 2^n` system over the product
//! basis of a column's dependencies and solves it for the coefficient
//! vector. Plain Gaussian elimination with partial pivoting is enough at
//! these sizes (n is the number of attributes one output column depends
//! on, in practice ≤ 4).

const EPS: f64 = 1e-9;

/// Rank of a matrix, computed on a working copy.
pub fn rank(matrix: &[Vec<f64>]) -> usize {
    if matrix.is_empty() {
        return 0;
    }
    let rows = matrix.len();
    let cols = matrix[0].len();
    let mut m: Vec<Vec<f64>> = matrix.to_vec();

    let mut rank = 0;
    let mut pivot_row = 0;
    for col in 0..cols {
        if pivot_row >= rows {
            break;
        }
        // Partial pivot: largest magnitude in this column.
        let mut best = pivot_row;
        for r in pivot_row + 1..rows {
            if m[r][col].abs() > m[best][col].abs() {
                best = r;
            }
        }
        if m[best][col].abs() < EPS {
            continue;
        }
        m.swap(pivot_row, best);
        for r in pivot_row + 1..rows {
            let factor = m[r][col] / m[pivot_row][col];
            for c in col..cols {
                m[r][c] -= factor * m[pivot_row][c];
            }
        }
        pivot_row += 1;
        rank += 1;
    }
    rank
}

/// Solve `A·x = b`. Returns `None` when the system is singular.
pub fn solve(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = a.len();
    if n == 0 || b.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }

    // Augmented working copy.
    let mut m: Vec<Vec<f64>> = a
        .iter()
        .zip(b.iter())
        .map(|(row, &bi)| {
            let mut r = row.clone();
            r.push(bi);
            r
        })
        .collect();

    for col in 0..n {
        let mut best = col;
        for r in col + 1..n {
            if m[r][col].abs() > m[best][col].abs() {
                best = r;
            }
        }
        if m[best][col].abs() < EPS {
            return None;
        }
        m.swap(col, best);
        for r in col + 1..n {
            let factor = m[r][col] / m[col][col];
            for c in col..=n {
                m[r][c] -= factor * m[col][c];
            }
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = m[row][n];
        for c in row + 1..n {
            acc -= m[row][c] * x[c];
        }
        x[row] = acc / m[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_solve_identity() {
        let a = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let x = solve(&a, &[3.0, -2.0]).unwrap();
        assert!((x[0] - 3.0).abs() < 1e-9);
        assert!((x[1] + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_solve_affine_column() {
        // Recover y = 2.5*v + 7 from two observations.
        let a = vec![vec![2.0, 1.0], vec![10.0, 1.0]];
        let b = [2.5 * 2.0 + 7.0, 2.5 * 10.0 + 7.0];
        let x = solve(&a, &b).unwrap();
        assert!((x[0] - 2.5).abs() < 1e-9);
        assert!((x[1] - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_solve_singular_returns_none() {
        let a = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        assert!(solve(&a, &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_rank() {
        assert_eq!(rank(&[vec![1.0, 2.0], vec![2.0, 4.0]]), 1);
        assert_eq!(rank(&[vec![1.0, 0.0], vec![0.0, 1.0]]), 2);
        assert_eq!(rank(&[vec![0.0, 0.0], vec![0.0, 0.0]]), 0);
        // Rank cannot exceed the smaller dimension.
        assert_eq!(
            rank(&[vec![1.0, 0.0, 3.0], vec![0.0, 1.0, 4.0]]),
            2
        );
    }

    proptest! {
        /// Diagonally dominant systems are nonsingular; solving A·x for a
        /// known x must recover it.
        #[test]
        fn prop_solve_round_trip(
            vals in proptest::collection::vec(-100.0f64..100.0, 9),
            x in proptest::collection::vec(-50.0f64..50.0, 3),
        ) {
            let mut a: Vec<Vec<f64>> = vals.chunks(3).map(|c| c.to_vec()).collect();
            for (i, row) in a.iter_mut().enumerate() {
                let dominance: f64 = row.iter().map(|v| v.abs()).sum::<f64>() + 1.0;
                row[i] = dominance;
            }
            let b: Vec<f64> = a
                .iter()
                .map(|row| row.iter().zip(x.iter()).map(|(c, v)| c * v).sum())
                .collect();
            let got = solve(&a, &b).expect("dominant matrix is solvable");
            for (g, want) in got.iter().zip(x.iter()) {
                prop_assert!((g - want).abs() < 1e-6);
            }
        }
    }
}
