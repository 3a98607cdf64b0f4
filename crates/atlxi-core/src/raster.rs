use serde::{Deserialize, Serialize};

use crate::region::Region;

/// A regular grid of per-cell values in projected metres, row-major.
/// Row 0 is the `ymin` edge. Empty cells are `NaN` (`null` in JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    #[serde(deserialize_with = "crate::store::null_as_nan_vec")]
    pub data: Vec<f64>,
    pub width: usize,
    pub height: usize,
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    pub cell_size: f64,
}

impl Grid {
    /// Grid covering `region` with square cells, filled with `fill`.
    pub fn covering(region: &Region, cell_size: f64, fill: f64) -> Self {
        let cells = |extent: f64| ((extent / cell_size).ceil() as usize).max(1);
        let (width, height) = (cells(region.width()), cells(region.height()));
        Self {
            data: vec![fill; width * height],
            width,
            height,
            xmin: region.xmin,
            xmax: region.xmin + width as f64 * cell_size,
            ymin: region.ymin,
            ymax: region.ymin + height as f64 * cell_size,
            cell_size,
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        self.data[row * self.width + col] = val;
    }

    /// `(row, col)` of the cell holding `(x, y)`, or `None` outside the grid.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !(x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax) {
            return None;
        }
        let col = (((x - self.xmin) / self.cell_size) as usize).min(self.width - 1);
        let row = (((y - self.ymin) / self.cell_size) as usize).min(self.height - 1);
        Some((row, col))
    }

    /// Cell value at `(x, y)`; `None` outside the grid or in an empty cell.
    pub fn value_at(&self, x: f64, y: f64) -> Option<f64> {
        self.cell_of(x, y)
            .map(|(r, c)| self.get(r, c))
            .filter(|v| !v.is_nan())
    }

    pub fn filled_cells(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn min_value(&self) -> f64 {
        self.data.iter().cloned().filter(|v| !v.is_nan()).fold(f64::INFINITY, f64::min)
    }

    pub fn max_value(&self) -> f64 {
        self.data.iter().cloned().filter(|v| !v.is_nan()).fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Average the finite `values` of the points inside `region` into square
/// cells of `cell_size` metres. Cells with no contributing point stay `NaN`.
pub fn rasterize_mean(x: &[f64], y: &[f64], values: &[f64], region: &Region, cell_size: f64) -> Grid {
    let mut grid = Grid::covering(region, cell_size, 0.0);
    let mut counts = vec![0u32; grid.data.len()];
    for ((&px, &py), &v) in x.iter().zip(y).zip(values) {
        if !v.is_finite() || !region.contains(px, py) {
            continue;
        }
        if let Some((r, c)) = grid.cell_of(px, py) {
            let i = r * grid.width + c;
            grid.data[i] += v;
            counts[i] += 1;
        }
    }
    for (v, &n) in grid.data.iter_mut().zip(&counts) {
        *v = if n == 0 { f64::NAN } else { *v / n as f64 };
    }
    grid
}
