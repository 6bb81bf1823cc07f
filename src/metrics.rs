use geo::Area;

use crate::error::{CarbonError, Result};
use crate::model::{BoundaryCollection, BoundaryRecord, EnrichedCollection, EnrichedRecord, ZonalResult};

pub const SQ_M_IN_ACRE: f64 = 4046.86;
pub const SQ_M_IN_SQ_MILE: f64 = 2589988.11;
/// Each raster cell is 30 m x 30 m.
pub const PIXEL_AREA_SQ_M: f64 = 900.0;
/// Converts a raster sum (Mg CO2e per acre per cell) into Mg CO2e.
pub const PIXEL_AREA_ADJUST: f64 = PIXEL_AREA_SQ_M / SQ_M_IN_ACRE;
pub const MG_PER_TG: f64 = 1e6;

/// Attaches the zonal sums to their boundaries and derives the carbon and
/// area columns. Areas are planar, in the collection's CRS units.
pub fn compute(collection: BoundaryCollection, zonal: &ZonalResult) -> Result<EnrichedCollection> {
    if collection.len() != zonal.len() {
        return Err(CarbonError::Config(format!(
            "{} zonal sums for {} boundaries; compute statistics on the loaded boundaries",
            zonal.len(),
            collection.len()
        )));
    }

    let records = collection
        .records
        .into_iter()
        .zip(zonal.sums())
        .map(|(boundary, &sum)| enrich(boundary, sum))
        .collect();

    Ok(EnrichedCollection {
        crs: collection.crs,
        records,
    })
}

pub fn enrich(boundary: BoundaryRecord, raster_sum: Option<f64>) -> EnrichedRecord {
    let Some(sum) = raster_sum else {
        return EnrichedRecord {
            boundary,
            raster_sum: None,
            mg_co2e: None,
            tg_co2e: None,
            county_area_sq_miles: None,
            county_area_acres: None,
            average_mg_co2e_per_acre: None,
        };
    };

    let area = boundary.geometry.unsigned_area();
    let mg_co2e = sum * PIXEL_AREA_ADJUST;
    let county_area_acres = area / SQ_M_IN_ACRE;
    let average = if county_area_acres > 0.0 {
        finite(mg_co2e / county_area_acres)
    } else {
        None
    };

    EnrichedRecord {
        boundary,
        raster_sum: finite(sum),
        mg_co2e: finite(mg_co2e),
        tg_co2e: finite(mg_co2e / MG_PER_TG),
        county_area_sq_miles: finite(area / SQ_M_IN_SQ_MILE),
        county_area_acres: finite(county_area_acres),
        average_mg_co2e_per_acre: average,
    }
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}
