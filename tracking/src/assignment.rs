use nalgebra::DMatrix;

/// Result of one greedy assignment pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Accepted `(row, col)` pairs.
    pub pairs: Vec<(usize, usize)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// Greedy best-score assignment over an N x M score matrix.
///
/// Rows are processed in ascending index order; each row claims its
/// best-scoring column strictly above `floor`, and a claimed column is zeroed
/// for all later rows. Score ties within one row are broken by
/// `col_preference` (higher wins), then by smaller column index. Callers
/// wanting id-stable results order their rows by ascending track id.
///
/// This is not globally optimal, but with the floor in place it behaves like
/// the optimal assignment for the well-separated score matrices tracking
/// produces, at a fraction of the bookkeeping.
pub fn greedy_assign(
    scores: &DMatrix<f64>,
    floor: f64,
    col_preference: &[f32],
) -> Assignment {
    assert_eq!(scores.ncols(), col_preference.len());

    let mut scores = scores.clone();
    let mut pairs = Vec::new();
    let mut col_taken = vec![false; scores.ncols()];

    for row in 0..scores.nrows() {
        let mut best: Option<(usize, f64)> = None;
        for col in 0..scores.ncols() {
            if col_taken[col] {
                continue;
            }
            let s = scores[(row, col)];
            if s <= floor {
                continue;
            }
            best = match best {
                None => Some((col, s)),
                Some((bcol, bs)) => {
                    if s > bs || (s == bs && col_preference[col] > col_preference[bcol]) {
                        Some((col, s))
                    } else {
                        Some((bcol, bs))
                    }
                }
            };
        }
        if let Some((col, _)) = best {
            col_taken[col] = true;
            for r in 0..scores.nrows() {
                scores[(r, col)] = 0.0;
            }
            pairs.push((row, col));
        }
    }

    let matched_rows: Vec<usize> = pairs.iter().map(|(r, _)| *r).collect();
    let unmatched_rows = (0..scores.nrows())
        .filter(|r| !matched_rows.contains(r))
        .collect();
    let unmatched_cols = (0..scores.ncols()).filter(|c| !col_taken[*c]).collect();

    Assignment {
        pairs,
        unmatched_rows,
        unmatched_cols,
    }
}
