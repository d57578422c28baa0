//! Rat/mouse disambiguation from a device's mass-threshold grid.

use faunaproc_core::types::{Position, RatThreshold};

/// Thermal frame width in pixels.
pub const FRAME_WIDTH: f64 = 160.0;
/// Thermal frame height in pixels.
pub const FRAME_HEIGHT: f64 = 120.0;

/// Walk a track's positions over the threshold grid and decide rat vs
/// mouse.
///
/// Blank and zero-mass positions are skipped. Each position votes in every
/// grid cell its bounding box covers (inclusive on both ends): a vote for
/// rat when the mass exceeds the cell's threshold, for mouse otherwise.
/// Cells without threshold data are skipped.
pub fn is_rat(positions: &[Position], thresh: &RatThreshold) -> bool {
    let grid = thresh.grid_size;
    if grid <= 0.0 {
        return false;
    }

    let mut rat_count = 0u32;
    let mut mouse_count = 0u32;
    for p in positions {
        if p.blank || p.mass == 0.0 {
            continue;
        }

        let x_start = cell(p.x, grid);
        let x_end = cell(p.x + p.width, grid);
        let y_start = cell(p.y, grid);
        let y_end = cell(p.y + p.height, grid);

        for y in y_start..=y_end {
            for x in x_start..=x_end {
                let threshold = thresh
                    .thresholds
                    .get(y)
                    .and_then(|row| row.get(x))
                    .copied()
                    .flatten();
                let Some(threshold) = threshold else { continue };
                if p.mass > threshold {
                    rat_count += 1;
                } else {
                    mouse_count += 1;
                }
            }
        }
    }
    rat_count > mouse_count
}

fn cell(coordinate: f64, grid: f64) -> usize {
    (coordinate / grid).floor().max(0.0) as usize
}
