use std::path::{Path, PathBuf};

use crate::boundary::BoundaryLoader;
use crate::error::{CarbonError, Result};
use crate::metrics::{self, PIXEL_AREA_SQ_M};
use crate::model::{BoundaryCollection, Crs, EnrichedCollection, StateFilter};
use crate::raster::{RasterInfo, RasterSource};
use crate::reproject::{GdalReprojector, Reprojector};
use crate::writer::{self, SqliteWriter};
use crate::zonal::{self, GridZonalEngine, OverlapRule, ZonalAggregationEngine};

pub const DEFAULT_NODATA: f64 = 65535.0;
pub const DEFAULT_EXPORT_CRS: &str = "EPSG:4326";

#[derive(Debug, Clone, PartialEq)]
pub struct CarbonStatsConfig {
    pub raster_path: PathBuf,
    pub boundary_path: PathBuf,
    /// Raster value excluded from the sums.
    pub nodata: f64,
    /// CRS of the exported WKT geometry.
    pub export_crs: Crs,
    pub overlap: OverlapRule,
}

impl CarbonStatsConfig {
    pub fn new(raster_path: impl Into<PathBuf>, boundary_path: impl Into<PathBuf>) -> Self {
        Self {
            raster_path: raster_path.into(),
            boundary_path: boundary_path.into(),
            nodata: DEFAULT_NODATA,
            export_crs: Crs::new(DEFAULT_EXPORT_CRS),
            overlap: OverlapRule::default(),
        }
    }
}

/// Where a [`CarbonStats`] run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    RasterOpened,
    BoundariesLoaded,
    StatsComputed,
    Exported,
}

enum Stage {
    Uninitialized,
    RasterOpened {
        raster: RasterInfo,
    },
    BoundariesLoaded {
        raster: RasterInfo,
        boundaries: BoundaryCollection,
    },
    StatsComputed {
        raster: RasterInfo,
        enriched: EnrichedCollection,
    },
    Exported {
        raster: RasterInfo,
        enriched: EnrichedCollection,
        destination: PathBuf,
    },
}

/// One batch run: raster -> boundaries -> zonal statistics -> SQLite.
///
/// Each step only runs once its predecessor has produced its output, and a
/// failing step leaves the previous state untouched. Re-running an earlier
/// step discards everything computed after it.
pub struct CarbonStats {
    config: CarbonStatsConfig,
    reprojector: Box<dyn Reprojector>,
    engine: Box<dyn ZonalAggregationEngine>,
    stage: Stage,
}

impl CarbonStats {
    pub fn new(config: CarbonStatsConfig) -> Self {
        let engine = GridZonalEngine::new(config.overlap);
        Self::with_engines(config, Box::new(GdalReprojector), Box::new(engine))
    }

    pub fn with_engines(
        config: CarbonStatsConfig,
        reprojector: Box<dyn Reprojector>,
        engine: Box<dyn ZonalAggregationEngine>,
    ) -> Self {
        Self {
            config,
            reprojector,
            engine,
            stage: Stage::Uninitialized,
        }
    }

    pub fn config(&self) -> &CarbonStatsConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        match self.stage {
            Stage::Uninitialized => PipelineState::Uninitialized,
            Stage::RasterOpened { .. } => PipelineState::RasterOpened,
            Stage::BoundariesLoaded { .. } => PipelineState::BoundariesLoaded,
            Stage::StatsComputed { .. } => PipelineState::StatsComputed,
            Stage::Exported { .. } => PipelineState::Exported,
        }
    }

    pub fn raster(&self) -> Option<&RasterInfo> {
        match &self.stage {
            Stage::Uninitialized => None,
            Stage::RasterOpened { raster }
            | Stage::BoundariesLoaded { raster, .. }
            | Stage::StatsComputed { raster, .. }
            | Stage::Exported { raster, .. } => Some(raster),
        }
    }

    pub fn raster_crs(&self) -> Option<&Crs> {
        self.raster().map(|r| &r.crs)
    }

    pub fn boundaries(&self) -> Option<&BoundaryCollection> {
        match &self.stage {
            Stage::BoundariesLoaded { boundaries, .. } => Some(boundaries),
            _ => None,
        }
    }

    pub fn enriched(&self) -> Option<&EnrichedCollection> {
        match &self.stage {
            Stage::StatsComputed { enriched, .. } | Stage::Exported { enriched, .. } => {
                Some(enriched)
            }
            _ => None,
        }
    }

    /// Opens the raster just long enough to record its CRS and grid.
    pub fn read_raster(&mut self) -> Result<Crs> {
        let raster = {
            let handle = RasterSource::open(&self.config.raster_path)?;
            handle.info().clone()
        };

        let cell_area = raster.grid.cell_area();
        if (cell_area - PIXEL_AREA_SQ_M).abs() > 1e-6 {
            tracing::warn!(
                "Raster cells cover {} square units, but carbon totals assume {} (30 x 30)",
                cell_area,
                PIXEL_AREA_SQ_M
            );
        }
        if let Some(declared) = raster.declared_nodata {
            if declared != self.config.nodata {
                tracing::warn!(
                    "Raster declares nodata {} but {} is configured; only {} is excluded",
                    declared,
                    self.config.nodata,
                    self.config.nodata
                );
            }
        }

        tracing::info!(
            "Raster {:?}: {} x {} cells, CRS {}",
            raster.path,
            raster.grid.width,
            raster.grid.height,
            raster.crs
        );

        let crs = raster.crs.clone();
        self.stage = Stage::RasterOpened { raster };
        Ok(crs)
    }

    /// Loads the boundaries, keeps the states in `filter` (all of them when
    /// `None` or empty) and reprojects them into the raster CRS.
    pub fn process_boundaries(
        &mut self,
        filter: Option<&StateFilter>,
    ) -> Result<&BoundaryCollection> {
        let raster = self.raster().cloned().ok_or_else(|| {
            CarbonError::Config(
                "raster CRS is not known yet; call read_raster before process_boundaries"
                    .to_string(),
            )
        })?;

        let mut boundaries = BoundaryLoader::load(&self.config.boundary_path)?;
        if let Some(filter) = active_filter(filter) {
            boundaries = BoundaryLoader::filter_by_state(boundaries, filter);
        }
        let boundaries =
            BoundaryLoader::reproject(boundaries, &raster.crs, self.reprojector.as_ref())?;

        self.stage = Stage::BoundariesLoaded { raster, boundaries };
        self.boundaries().ok_or_else(|| {
            CarbonError::Config("boundaries were not retained after loading".to_string())
        })
    }

    /// Zonal sums plus the derived carbon and area columns.
    pub fn calculate_stats(&mut self) -> Result<&EnrichedCollection> {
        let (raster, boundaries) = match &self.stage {
            Stage::BoundariesLoaded { raster, boundaries } => (raster.clone(), boundaries.clone()),
            Stage::StatsComputed { raster, enriched } | Stage::Exported { raster, enriched, .. } => {
                (raster.clone(), boundaries_of(enriched))
            }
            Stage::Uninitialized | Stage::RasterOpened { .. } => {
                return Err(CarbonError::Config(
                    "no boundary data loaded; call process_boundaries first".to_string(),
                ))
            }
        };

        if raster.crs.is_geographic()? {
            return Err(CarbonError::Config(format!(
                "raster CRS {} is geographic; county areas need a projected CRS",
                raster.crs
            )));
        }

        let sums = zonal::aggregate(self.engine.as_ref(), &boundaries, &raster, self.config.nodata)?;
        let enriched = metrics::compute(boundaries, &sums)?;

        self.stage = Stage::StatsComputed { raster, enriched };
        self.enriched().ok_or_else(|| {
            CarbonError::Config("statistics were not retained after computing".to_string())
        })
    }

    /// Replaces `table_name` in the SQLite database at `output_path` with the
    /// computed rows. Can be repeated; each export overwrites the table.
    pub fn export_to_sqlite(&mut self, output_path: &Path, table_name: &str) -> Result<PathBuf> {
        let enriched = self.enriched().ok_or_else(|| {
            CarbonError::Config(
                "no statistics computed; call calculate_stats before exporting".to_string(),
            )
        })?;

        let rows = writer::prepare(enriched, &self.config.export_crs, self.reprojector.as_ref())?;
        let destination = SqliteWriter::new().export(&rows, output_path, table_name)?;
        tracing::info!("Successfully exported to {:?}", destination);

        self.stage = match std::mem::replace(&mut self.stage, Stage::Uninitialized) {
            Stage::StatsComputed { raster, enriched }
            | Stage::Exported {
                raster, enriched, ..
            } => Stage::Exported {
                raster,
                enriched,
                destination: destination.clone(),
            },
            other => other,
        };
        Ok(destination)
    }

    /// The most recent export destination, once exported.
    pub fn destination(&self) -> Option<&Path> {
        match &self.stage {
            Stage::Exported { destination, .. } => Some(destination),
            _ => None,
        }
    }

    /// Every stage in order.
    pub fn run(
        &mut self,
        filter: Option<&StateFilter>,
        output_path: &Path,
        table_name: &str,
    ) -> Result<PathBuf> {
        self.read_raster()?;
        self.process_boundaries(filter)?;
        self.calculate_stats()?;
        self.export_to_sqlite(output_path, table_name)
    }
}

/// An empty filter means no filtering, same as `None`.
fn active_filter(filter: Option<&StateFilter>) -> Option<&StateFilter> {
    filter.filter(|f| !f.is_empty())
}

fn boundaries_of(enriched: &EnrichedCollection) -> BoundaryCollection {
    BoundaryCollection::new(
        enriched.crs.clone(),
        enriched.records.iter().map(|r| r.boundary.clone()).collect(),
    )
}
