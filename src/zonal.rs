use geo::{BoundingRect, Line, MultiPolygon};

use crate::error::{CarbonError, Result};
use crate::model::{BoundaryCollection, ZonalResult};
use crate::raster::{CellRows, GridGeometry, PixelWindow, RasterInfo, RasterSource};

/// Which cells a polygon is considered to cover.
///
/// Sums computed under different rules are not comparable, so a run uses
/// exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapRule {
    /// A cell counts when its centre is inside the polygon (even-odd rule).
    /// Centres exactly on a boundary count when the polygon interior lies to
    /// their right along the scanline, so a centre on a left edge is in and one
    /// on a right edge is out.
    #[default]
    CellCenter,
    /// A cell counts when any part of its footprint, including its edges,
    /// meets the polygon.
    AllTouched,
}

/// Produces one raster sum per boundary record, in collection order.
pub trait ZonalAggregationEngine {
    fn zonal_sums(
        &self,
        collection: &BoundaryCollection,
        raster: &RasterInfo,
        nodata: f64,
    ) -> Result<Vec<Option<f64>>>;
}

/// Rasterizes each polygon against the raster grid and sums the covered cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridZonalEngine {
    pub rule: OverlapRule,
}

impl GridZonalEngine {
    pub fn new(rule: OverlapRule) -> Self {
        Self { rule }
    }
}

impl ZonalAggregationEngine for GridZonalEngine {
    fn zonal_sums(
        &self,
        collection: &BoundaryCollection,
        raster: &RasterInfo,
        nodata: f64,
    ) -> Result<Vec<Option<f64>>> {
        let handle = RasterSource::open(&raster.path)?;
        if handle.grid() != &raster.grid {
            return Err(CarbonError::Config(format!(
                "raster {:?} changed since it was first read",
                raster.path
            )));
        }

        let mut sums = Vec::with_capacity(collection.len());
        for (i, record) in collection.records.iter().enumerate() {
            sums.push(zonal_sum(&handle, &record.geometry, nodata, self.rule)?);
            if (i + 1) % 100 == 0 {
                tracing::debug!("Zonal sums: {}/{} polygons", i + 1, collection.len());
            }
        }
        Ok(sums)
    }
}

/// Checks the preconditions, runs `engine` and checks that every polygon got
/// exactly one result.
pub fn aggregate(
    engine: &dyn ZonalAggregationEngine,
    collection: &BoundaryCollection,
    raster: &RasterInfo,
    nodata: f64,
) -> Result<ZonalResult> {
    if collection.crs != raster.crs {
        return Err(CarbonError::Config(format!(
            "boundaries are in {} but the raster is in {}; reproject before aggregating",
            collection.crs, raster.crs
        )));
    }

    let sums = engine.zonal_sums(collection, raster, nodata)?;
    if sums.len() != collection.len() {
        return Err(CarbonError::Config(format!(
            "zonal engine returned {} sums for {} polygons",
            sums.len(),
            collection.len()
        )));
    }

    let empty = sums.iter().filter(|s| s.is_none()).count();
    tracing::info!(
        "Computed zonal sums for {} polygons ({} without valid cells)",
        sums.len(),
        empty
    );

    Ok(ZonalResult(sums))
}

/// Sum of the valid cells `geometry` covers, or `None` if it covers none.
/// Cells equal to `nodata` and NaN cells are skipped.
pub fn zonal_sum<R: CellRows + ?Sized>(
    raster: &R,
    geometry: &MultiPolygon<f64>,
    nodata: f64,
    rule: OverlapRule,
) -> Result<Option<f64>> {
    let grid = *raster.grid();
    let Some(window) = geometry
        .bounding_rect()
        .and_then(|bounds| grid.window_for(&bounds))
    else {
        return Ok(None);
    };

    let mut sum = 0.0;
    let mut count = 0usize;
    let mut crossings = Vec::new();

    for row in window.row_start..window.row_end {
        let mask = match rule {
            OverlapRule::CellCenter => center_mask(&grid, geometry, row, &window, &mut crossings),
            OverlapRule::AllTouched => touched_mask(&grid, geometry, row, &window, &mut crossings),
        };

        let (Some(first), Some(last)) = (
            mask.iter().position(|&m| m),
            mask.iter().rposition(|&m| m),
        ) else {
            continue;
        };

        let values = raster.read_row(row, window.col_start + first, last - first + 1)?;
        for (offset, value) in values.into_iter().enumerate() {
            if mask[first + offset] && value != nodata && !value.is_nan() {
                sum += value;
                count += 1;
            }
        }
    }

    Ok((count > 0).then_some(sum))
}

/// Cells of `row` (within `window`) whose centres fall inside `geometry`.
fn center_mask(
    grid: &GridGeometry,
    geometry: &MultiPolygon<f64>,
    row: usize,
    window: &PixelWindow,
    crossings: &mut Vec<f64>,
) -> Vec<bool> {
    let mut mask = vec![false; window.cols()];
    let y = grid.cell_center(row, 0).y;

    crossings.clear();
    for polygon in geometry {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
            for line in ring.lines() {
                let (a, b) = (line.start, line.end);
                if (a.y <= y) != (b.y <= y) {
                    crossings.push(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y));
                }
            }
        }
    }
    crossings.sort_by(f64::total_cmp);

    for pair in crossings.chunks_exact(2) {
        // Column c has its centre at origin + (c + 0.5) * width; keep centres in [x0, x1).
        let start = ((pair[0] - grid.origin_x) / grid.pixel_width - 0.5).ceil();
        let end = ((pair[1] - grid.origin_x) / grid.pixel_width - 0.5).ceil();
        let start = start.max(window.col_start as f64) as usize;
        let end = end.min(window.col_end as f64).max(0.0) as usize;
        for col in start..end {
            mask[col - window.col_start] = true;
        }
    }
    mask
}

/// Cells of `row` (within `window`) whose footprints meet `geometry`.
///
/// A cell touches the polygon when its centre is inside or when some ring
/// edge passes through its closed footprint, so only the columns spanned by
/// edges crossing the row band are added to the centre mask.
fn touched_mask(
    grid: &GridGeometry,
    geometry: &MultiPolygon<f64>,
    row: usize,
    window: &PixelWindow,
    crossings: &mut Vec<f64>,
) -> Vec<bool> {
    let mut mask = center_mask(grid, geometry, row, window, crossings);
    let band = grid.cell_rect(row, window.col_start);
    let (y_lo, y_hi) = (band.min().y, band.max().y);
    let last_col = (window.col_end - 1) as f64;

    for polygon in geometry {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
            for line in ring.lines() {
                let Some((x0, x1)) = clip_to_band(line, y_lo, y_hi) else {
                    continue;
                };
                // Column c spans [origin + c * width, origin + (c + 1) * width].
                let first = ((x0 - grid.origin_x) / grid.pixel_width - 1.0)
                    .ceil()
                    .max(window.col_start as f64);
                let last = ((x1 - grid.origin_x) / grid.pixel_width)
                    .floor()
                    .min(last_col);
                if first > last {
                    continue;
                }
                for col in first as usize..=last as usize {
                    mask[col - window.col_start] = true;
                }
            }
        }
    }
    mask
}

/// X extent of the part of `line` inside the horizontal band `[y_lo, y_hi]`.
fn clip_to_band(line: Line<f64>, y_lo: f64, y_hi: f64) -> Option<(f64, f64)> {
    let (a, b) = (line.start, line.end);
    let (lo, hi) = (a.y.min(b.y).max(y_lo), a.y.max(b.y).min(y_hi));
    if lo > hi {
        return None;
    }
    if a.y == b.y {
        return Some((a.x.min(b.x), a.x.max(b.x)));
    }
    let x_at = |y: f64| a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y);
    let (xa, xb) = (x_at(lo), x_at(hi));
    Some((xa.min(xb), xa.max(xb)))
}
