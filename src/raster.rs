use gdal::Dataset;
use geo::{Coord, Rect};
use std::path::{Path, PathBuf};

use crate::error::{CarbonError, Result};
use crate::model::Crs;

/// North-up pixel grid derived from a GDAL geotransform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    pub origin_x: f64,
    pub origin_y: f64,
    /// Signed cell size along x (positive for west-to-east columns).
    pub pixel_width: f64,
    /// Signed cell size along y (negative for north-up rasters).
    pub pixel_height: f64,
    pub width: usize,
    pub height: usize,
}

/// Half-open range of rows and columns inside a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl PixelWindow {
    pub fn cols(&self) -> usize {
        self.col_end - self.col_start
    }

    pub fn rows(&self) -> usize {
        self.row_end - self.row_start
    }
}

impl GridGeometry {
    pub fn from_geo_transform(
        path: &Path,
        transform: &[f64; 6],
        (width, height): (usize, usize),
    ) -> Result<Self> {
        if transform[2] != 0.0 || transform[4] != 0.0 {
            return Err(CarbonError::format(
                path,
                format!(
                    "rotated geotransform is not supported (row rotation {}, column rotation {})",
                    transform[2], transform[4]
                ),
            ));
        }
        if transform[1] <= 0.0 || transform[5] == 0.0 {
            return Err(CarbonError::format(
                path,
                format!(
                    "unsupported pixel size {} x {} (columns must run west to east)",
                    transform[1], transform[5]
                ),
            ));
        }

        Ok(Self {
            origin_x: transform[0],
            origin_y: transform[3],
            pixel_width: transform[1],
            pixel_height: transform[5],
            width,
            height,
        })
    }

    pub fn cell_area(&self) -> f64 {
        (self.pixel_width * self.pixel_height).abs()
    }

    pub fn cell_center(&self, row: usize, col: usize) -> Coord<f64> {
        Coord {
            x: self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            y: self.origin_y + (row as f64 + 0.5) * self.pixel_height,
        }
    }

    pub fn cell_rect(&self, row: usize, col: usize) -> Rect<f64> {
        let x0 = self.origin_x + col as f64 * self.pixel_width;
        let y0 = self.origin_y + row as f64 * self.pixel_height;
        Rect::new(
            Coord { x: x0, y: y0 },
            Coord {
                x: x0 + self.pixel_width,
                y: y0 + self.pixel_height,
            },
        )
    }

    /// Cells overlapping `bounds`, clipped to the raster extent.
    pub fn window_for(&self, bounds: &Rect<f64>) -> Option<PixelWindow> {
        let (col_start, col_end) = Self::span(
            (bounds.min().x - self.origin_x) / self.pixel_width,
            (bounds.max().x - self.origin_x) / self.pixel_width,
            self.width,
        )?;
        let (row_start, row_end) = Self::span(
            (bounds.min().y - self.origin_y) / self.pixel_height,
            (bounds.max().y - self.origin_y) / self.pixel_height,
            self.height,
        )?;

        Some(PixelWindow {
            row_start,
            row_end,
            col_start,
            col_end,
        })
    }

    fn span(a: f64, b: f64, limit: usize) -> Option<(usize, usize)> {
        if !a.is_finite() || !b.is_finite() {
            return None;
        }
        let (a, b) = (a.min(b), a.max(b));
        if b < 0.0 || a > limit as f64 {
            return None;
        }
        let lo = a.floor().max(0.0);
        let mut hi = b.ceil().min(limit as f64);
        // A degenerate bound (a point or a line) still touches one cell.
        if hi <= lo {
            hi = (lo + 1.0).min(limit as f64);
        }
        (lo < hi).then_some((lo as usize, hi as usize))
    }
}

/// Read access to a raster's first band, one row segment at a time.
pub trait CellRows {
    fn grid(&self) -> &GridGeometry;

    /// `len` values of `row`, starting at `col_start`, as f64.
    fn read_row(&self, row: usize, col_start: usize, len: usize) -> Result<Vec<f64>>;
}

/// Everything the pipeline keeps about a raster once its handle is released.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub path: PathBuf,
    pub crs: Crs,
    pub grid: GridGeometry,
    pub declared_nodata: Option<f64>,
}

/// An open raster dataset. Dropping the handle closes the file.
pub struct RasterHandle {
    dataset: Dataset,
    info: RasterInfo,
}

impl RasterHandle {
    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    pub fn crs(&self) -> &Crs {
        &self.info.crs
    }
}

impl CellRows for RasterHandle {
    fn grid(&self) -> &GridGeometry {
        &self.info.grid
    }

    fn read_row(&self, row: usize, col_start: usize, len: usize) -> Result<Vec<f64>> {
        let band = self.dataset.rasterband(1)?;
        let buffer = band.read_as::<f64>(
            (col_start as isize, row as isize),
            (len, 1),
            (len, 1),
            None,
        )?;
        Ok(buffer.into_iter().collect())
    }
}

pub struct RasterSource;

impl RasterSource {
    pub fn open(path: &Path) -> Result<RasterHandle> {
        CarbonError::check_readable(path)?;

        let dataset = Dataset::open(path)
            .map_err(|e| CarbonError::format(path, format!("not a readable raster: {}", e)))?;
        if dataset.raster_count() == 0 {
            return Err(CarbonError::format(path, "dataset has no raster bands"));
        }

        let declared_nodata = dataset
            .rasterband(1)
            .map_err(|e| CarbonError::format(path, format!("cannot read band 1: {}", e)))?
            .no_data_value();

        let transform = dataset
            .geo_transform()
            .map_err(|e| CarbonError::format(path, format!("missing geotransform: {}", e)))?;
        let grid = GridGeometry::from_geo_transform(path, &transform, dataset.raster_size())?;

        let srs = dataset
            .spatial_ref()
            .map_err(|e| CarbonError::format(path, format!("raster has no CRS: {}", e)))?;
        let crs = Crs::from_spatial_ref(&srs)?;

        tracing::debug!(
            "Opened raster {:?}: {} x {} cells, CRS {}",
            path,
            grid.width,
            grid.height,
            crs
        );

        Ok(RasterHandle {
            dataset,
            info: RasterInfo {
                path: path.to_path_buf(),
                crs,
                grid,
                declared_nodata,
            },
        })
    }

    /// Native CRS of the raster at `path`; the handle is closed before returning.
    pub fn coordinate_reference_system(path: &Path) -> Result<Crs> {
        Ok(Self::open(path)?.info.crs)
    }
}
