use std::cmp::Ordering;

/// Spatial binning over a rectangular area.
///
/// The area is cut into `cols x rows` cells and at most `per_cell` items survive in
/// each, chosen by a caller-supplied ranking. Used on raw keypoints (sieve 1) and on
/// verified matches (sieve 2) to spread results evenly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSieve {
    width: f64,
    height: f64,
    cols: usize,
    rows: usize,
    per_cell: usize,
}

impl GridSieve {
    pub fn new(width: f64, height: f64, cols: usize, rows: usize, per_cell: usize) -> Self {
        Self {
            width: width.max(1.0),
            height: height.max(1.0),
            cols: cols.max(1),
            rows: rows.max(1),
            per_cell,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cols * self.rows * self.per_cell
    }

    /// Cell index for a position; positions outside the area clamp to the border cells
    pub fn cell_of(&self, x: f64, y: f64) -> usize {
        let cx = ((x / self.width) * self.cols as f64).floor();
        let cy = ((y / self.height) * self.rows as f64).floor();
        let cx = (cx.max(0.0) as usize).min(self.cols - 1);
        let cy = (cy.max(0.0) as usize).min(self.rows - 1);
        cy * self.cols + cx
    }

    /// Keep the best `per_cell` items of every cell.
    ///
    /// `better(a, b)` returns `Ordering::Less` when `a` should be kept before `b`.
    /// Survivors are returned in their original relative order.
    pub fn apply<T, P, B>(&self, items: Vec<T>, position: P, better: B) -> Vec<T>
    where
        P: Fn(&T) -> (f64, f64),
        B: Fn(&T, &T) -> Ordering,
    {
        if self.per_cell == 0 {
            return Vec::new();
        }

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); self.cols * self.rows];
        for (i, item) in items.iter().enumerate() {
            let (x, y) = position(item);
            cells[self.cell_of(x, y)].push(i);
        }

        let mut keep = vec![false; items.len()];
        for cell in cells.iter_mut() {
            if cell.len() > self.per_cell {
                cell.sort_by(|&a, &b| better(&items[a], &items[b]).then(a.cmp(&b)));
                cell.truncate(self.per_cell);
            }
            for &i in cell.iter() {
                keep[i] = true;
            }
        }

        items
            .into_iter()
            .zip(keep)
            .filter_map(|(item, k)| k.then_some(item))
            .collect()
    }
}
