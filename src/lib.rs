pub mod boundary;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod raster;
pub mod reproject;
pub mod writer;
pub mod zonal;

pub use boundary::BoundaryLoader;
pub use error::{CarbonError, Result};
pub use model::{
    BoundaryCollection, BoundaryRecord, Crs, EnrichedCollection, EnrichedRecord, ExportRow,
    ExportRowSet, StateFilter, ZonalResult,
};
pub use pipeline::{CarbonStats, CarbonStatsConfig, PipelineState};
pub use raster::{RasterHandle, RasterInfo, RasterSource};
pub use reproject::{GdalReprojector, Reprojector};
pub use writer::SqliteWriter;
pub use zonal::{GridZonalEngine, OverlapRule, ZonalAggregationEngine};
