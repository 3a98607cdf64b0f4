use serde::{Deserialize, Serialize};

/// One dense chunk of a Points × Columns array, row-major.
/// Missing values are `NaN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Block {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    pub fn filled(rows: usize, cols: usize, fill: f64) -> Self {
        Self::new(rows, cols, vec![fill; rows * cols])
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    /// Copy the given rows, in the given order, into a new block.
    pub fn take_rows(&self, rows: &[usize]) -> Block {
        let mut data = Vec::with_capacity(rows.len() * self.cols);
        for &r in rows {
            data.extend_from_slice(self.row(r));
        }
        Block::new(rows.len(), self.cols, data)
    }
}

/// A fully evaluated array held in process memory.
///
/// Keeps the chunk partition of the lazy array it came from so that a
/// [`Selection`] built from it lines up with sibling lazy arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseArray {
    chunks: Vec<usize>,
    cols: usize,
    data: Vec<f64>,
}

impl DenseArray {
    /// Concatenate blocks in chunk order.
    pub fn from_blocks<'a>(cols: usize, blocks: impl IntoIterator<Item = &'a Block>) -> Self {
        let mut chunks = Vec::new();
        let mut data = Vec::new();
        for b in blocks {
            debug_assert_eq!(b.cols, cols);
            chunks.push(b.rows);
            data.extend_from_slice(&b.data);
        }
        Self { chunks, cols, data }
    }

    /// Single-column array with one chunk per entry of `chunks`.
    pub fn from_column(chunks: Vec<usize>, values: Vec<f64>) -> Self {
        debug_assert_eq!(chunks.iter().sum::<usize>(), values.len());
        Self { chunks, cols: 1, data: values }
    }

    pub fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.data.len() / self.cols
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn chunks(&self) -> &[usize] {
        &self.chunks
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    pub fn column(&self, c: usize) -> Vec<f64> {
        (0..self.rows()).map(|r| self.get(r, c)).collect()
    }

    /// Split back into per-chunk blocks.
    pub fn to_blocks(&self) -> Vec<Block> {
        let mut out = Vec::with_capacity(self.chunks.len());
        let mut start = 0;
        for &rows in &self.chunks {
            let end = start + rows * self.cols;
            out.push(Block::new(rows, self.cols, self.data[start..end].to_vec()));
            start = end;
        }
        out
    }
}

/// Rows to keep from a chunked array, chunk by chunk.
///
/// Built from a materialized per-point array and applied to lazy arrays that
/// share its partition. Input order is preserved and chunks that end up
/// empty are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// `(source chunk, local row indices)` per output chunk.
    picks: Vec<(usize, Vec<usize>)>,
    source_chunks: Vec<usize>,
}

impl Selection {
    /// Keep every row whose values satisfy `keep`.
    pub fn from_predicate(source: &DenseArray, keep: impl Fn(&[f64]) -> bool) -> Self {
        let mut picks = Vec::new();
        let mut offset = 0;
        for (ci, &rows) in source.chunks().iter().enumerate() {
            let kept: Vec<usize> = (0..rows).filter(|&r| keep(source.row(offset + r))).collect();
            if !kept.is_empty() {
                picks.push((ci, kept));
            }
            offset += rows;
        }
        Self {
            picks,
            source_chunks: source.chunks().to_vec(),
        }
    }

    pub(crate) fn picks(&self) -> &[(usize, Vec<usize>)] {
        &self.picks
    }

    pub fn source_chunks(&self) -> &[usize] {
        &self.source_chunks
    }

    /// Chunk sizes of a selected array.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.picks.iter().map(|(_, rows)| rows.len()).collect()
    }

    /// Number of rows kept.
    pub fn len(&self) -> usize {
        self.picks.iter().map(|(_, rows)| rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.picks.is_empty()
    }

    /// Number of rows in the array the selection was built from.
    pub fn source_len(&self) -> usize {
        self.source_chunks.iter().sum()
    }

    /// Apply to an in-memory array with the same partition.
    pub fn apply_dense(&self, array: &DenseArray) -> DenseArray {
        debug_assert_eq!(array.chunks(), self.source_chunks.as_slice());
        let blocks = array.to_blocks();
        let selected: Vec<Block> = self
            .picks
            .iter()
            .map(|(ci, rows)| blocks[*ci].take_rows(rows))
            .collect();
        let mut out = DenseArray::from_blocks(array.cols(), selected.iter());
        out.chunks = self.chunk_sizes();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_chunks() -> DenseArray {
        let blocks = [
            Block::new(2, 1, vec![1.0, 0.0]),
            Block::new(2, 1, vec![0.0, 0.0]),
            Block::new(3, 1, vec![1.0, 1.0, 0.0]),
        ];
        DenseArray::from_blocks(1, blocks.iter())
    }

    #[test]
    fn selection_keeps_order_and_drops_empty_chunks() {
        let mask = three_chunks();
        let sel = Selection::from_predicate(&mask, |row| row[0] > 0.5);
        assert_eq!(sel.len(), 3);
        assert_eq!(sel.source_len(), 7);
        assert_eq!(sel.chunk_sizes(), vec![1, 2]);

        let values = DenseArray::from_column(vec![2, 2, 3], (0..7).map(|v| v as f64).collect());
        let kept = sel.apply_dense(&values);
        assert_eq!(kept.data(), &[0.0, 4.0, 5.0]);
        assert_eq!(kept.chunks(), &[1, 2]);
    }

    #[test]
    fn dense_round_trips_through_blocks() {
        let a = three_chunks();
        let b = DenseArray::from_blocks(1, a.to_blocks().iter());
        assert_eq!(a, b);
        assert_eq!(a.rows(), 7);
    }

    #[test]
    fn take_rows_copies_whole_rows() {
        let b = Block::new(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = b.take_rows(&[2, 0]);
        assert_eq!(t.data, vec![5.0, 6.0, 1.0, 2.0]);
        assert_eq!(t.rows, 2);
    }
}
