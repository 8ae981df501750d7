use std::ops::Range;

/// The `index`-th of `parts` contiguous slices of `0..total`; earlier slices take the remainder.
pub fn partition_range(total: usize, parts: usize, index: usize) -> Range<usize> {
    let parts = parts.max(1);
    let base = total / parts;
    let extra = total % parts;
    let start = index * base + index.min(extra);
    let len = base + usize::from(index < extra);
    start.min(total)..(start + len).min(total)
}

/// Consecutive sub-ranges of `range`, each at most `size` long.
pub fn chunk_ranges(range: Range<usize>, size: usize) -> impl Iterator<Item = Range<usize>> {
    let size = size.max(1);
    let end = range.end;
    range
        .step_by(size)
        .map(move |start| start..(start + size).min(end))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl Block {
    pub fn is_diagonal(&self) -> bool {
        self.rows == self.cols
    }

    /// Index pairs evaluated for this block; diagonal blocks of a symmetric grid keep `j >= i`.
    pub fn pairs(&self, symmetric: bool) -> Vec<(usize, usize)> {
        let upper_only = symmetric && self.is_diagonal();
        self.rows
            .clone()
            .flat_map(|i| self.cols.clone().map(move |j| (i, j)))
            .filter(|(i, j)| !upper_only || j >= i)
            .collect()
    }
}

/// Row-major tiling of an `nrows x ncols` grid.
pub fn general_blocks(nrows: usize, ncols: usize, row_chunk: usize, col_chunk: usize) -> Vec<Block> {
    chunk_ranges(0..nrows, row_chunk)
        .flat_map(|rows| {
            chunk_ranges(0..ncols, col_chunk).map(move |cols| Block {
                rows: rows.clone(),
                cols,
            })
        })
        .collect()
}

/// Row-major tiling of the upper triangle (diagonal included) of an `n x n` grid.
pub fn symmetric_blocks(n: usize, chunk: usize) -> Vec<Block> {
    let owned: Vec<Range<usize>> = chunk_ranges(0..n, chunk).collect();
    let ranges = &owned;
    ranges
        .iter()
        .enumerate()
        .flat_map(move |(bi, rows)| {
            ranges[bi..].iter().map(move |cols| Block {
                rows: rows.clone(),
                cols: cols.clone(),
            })
        })
        .collect()
}

/// Vector budget of one output pass of a linear combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombinePlan {
    /// Accumulators held at once.
    pub outputs: usize,
    /// Temporaries live at once inside `axpy`; zero when it updates in place.
    pub scratch: usize,
    /// Basis vectors loaded per block.
    pub basis: usize,
}

impl CombinePlan {
    /// Splits `quota` between accumulators, `axpy` temporaries and a basis block.
    ///
    /// A single accumulator never needs scratch: it consumes the loaded basis vectors.
    pub fn new(quota: usize, owned: usize, axpy_in_place: bool, threads: usize) -> Self {
        let quota = quota.max(2);
        let outputs = (quota / 2).max(1).min(owned.max(1));
        let scratch = if axpy_in_place || outputs == 1 {
            0
        } else {
            threads.max(1).min(outputs).min(quota - outputs - 1)
        };
        Self {
            outputs,
            scratch,
            basis: (quota - outputs - scratch).max(1),
        }
    }

    /// Accumulators each parallel task walks through.
    pub fn accumulators_per_task(&self, live: usize) -> usize {
        if self.scratch == 0 {
            1
        } else {
            live.div_ceil(self.scratch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_cover_everything_once() {
        for total in [0, 1, 5, 17] {
            for parts in 1..6 {
                let mut covered = Vec::new();
                for index in 0..parts {
                    covered.extend(partition_range(total, parts, index));
                }
                assert_eq!(covered, (0..total).collect::<Vec<_>>());
            }
        }
        assert_eq!(partition_range(10, 3, 0), 0..4);
        assert_eq!(partition_range(10, 3, 2), 7..10);
        assert_eq!(partition_range(2, 4, 3), 2..2);
    }

    #[test]
    fn chunks_respect_size() {
        let chunks: Vec<_> = chunk_ranges(3..10, 3).collect();
        assert_eq!(chunks, vec![3..6, 6..9, 9..10]);
        assert_eq!(chunk_ranges(0..0, 4).count(), 0);
    }

    #[test]
    fn general_blocks_are_row_major() {
        let blocks = general_blocks(3, 5, 2, 3);
        let origins: Vec<_> = blocks.iter().map(|b| (b.rows.start, b.cols.start)).collect();
        assert_eq!(origins, vec![(0, 0), (0, 3), (2, 0), (2, 3)]);
    }

    #[test]
    fn symmetric_blocks_cover_the_upper_triangle_once() {
        let n = 7;
        let mut seen = vec![vec![0usize; n]; n];
        for block in symmetric_blocks(n, 3) {
            assert!(block.rows.start <= block.cols.start);
            for (i, j) in block.pairs(true) {
                seen[i][j] += 1;
            }
        }
        let evaluated: usize = seen.iter().flatten().sum();
        assert_eq!(evaluated, n * (n + 1) / 2);
        for i in 0..n {
            for j in i..n {
                assert_eq!(seen[i][j], 1, "pair ({i}, {j})");
            }
        }
    }

    #[test]
    fn combine_plan_fits_the_quota() {
        for quota in 2..40 {
            for owned in 1..12 {
                for in_place in [false, true] {
                    for threads in [1, 4, 64] {
                        let plan = CombinePlan::new(quota, owned, in_place, threads);
                        assert!(plan.outputs >= 1 && plan.basis >= 1);
                        assert!(plan.outputs <= owned);
                        assert!(
                            plan.outputs + plan.scratch + plan.basis <= quota,
                            "quota {quota}: {plan:?}"
                        );
                    }
                }
            }
        }
        let plan = CombinePlan::new(4, 4, false, 8);
        assert_eq!(plan, CombinePlan { outputs: 2, scratch: 1, basis: 1 });
        assert_eq!(plan.accumulators_per_task(2), 2);
        assert_eq!(CombinePlan::new(4, 4, true, 8).basis, 2);
    }
}
