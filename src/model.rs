use gdal::spatial_ref::{AxisMappingStrategy, SpatialRef};
use geo::MultiPolygon;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{CarbonError, Result};

/// A coordinate reference system, kept as the definition string OSR accepts
/// (`EPSG:5070`, WKT or a PROJ string).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Crs(String);

impl Crs {
    pub fn new(definition: impl Into<String>) -> Self {
        Crs(definition.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Authority code when OSR knows one, otherwise the full WKT.
    pub fn from_spatial_ref(srs: &SpatialRef) -> Result<Self> {
        match srs.authority() {
            Ok(authority) if !authority.is_empty() => Ok(Crs(authority)),
            _ => Ok(Crs(srs.to_wkt()?)),
        }
    }

    /// OSR spatial reference in x/y (easting, northing / lon, lat) axis order.
    pub fn to_spatial_ref(&self) -> Result<SpatialRef> {
        let mut srs = SpatialRef::from_definition(&self.0).map_err(|e| {
            CarbonError::Config(format!("Unknown CRS definition '{}': {}", self.0, e))
        })?;
        srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        Ok(srs)
    }

    pub fn is_geographic(&self) -> Result<bool> {
        Ok(self.to_spatial_ref()?.is_geographic())
    }

    /// `EPSG:4326` -> `EPSG_4326`, used to name the exported geometry column.
    pub fn column_suffix(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Crs {
    fn from(definition: &str) -> Self {
        Crs::new(definition)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryRecord {
    pub geoid: String,
    pub name: String,
    pub state_name: String,
    pub geometry: MultiPolygon<f64>,
}

/// Boundary records in source order, all in one CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryCollection {
    pub crs: Crs,
    pub records: Vec<BoundaryRecord>,
}

impl BoundaryCollection {
    pub fn new(crs: Crs, records: Vec<BoundaryRecord>) -> Self {
        Self { crs, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Set of `STATE_NAME` values to keep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFilter {
    names: BTreeSet<String>,
}

impl StateFilter {
    pub fn contains(&self, state_name: &str) -> bool {
        self.names.contains(state_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl From<&str> for StateFilter {
    fn from(name: &str) -> Self {
        std::iter::once(name).collect()
    }
}

impl From<String> for StateFilter {
    fn from(name: String) -> Self {
        std::iter::once(name).collect()
    }
}

impl From<Vec<String>> for StateFilter {
    fn from(names: Vec<String>) -> Self {
        names.into_iter().collect()
    }
}

impl From<&[&str]> for StateFilter {
    fn from(names: &[&str]) -> Self {
        names.iter().copied().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for StateFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        StateFilter {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// One raster sum per boundary record, parallel to the collection's order.
/// `None` means the polygon covered no valid cells.
#[derive(Debug, Clone, PartialEq)]
pub struct ZonalResult(pub Vec<Option<f64>>);

impl ZonalResult {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sums(&self) -> &[Option<f64>] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub boundary: BoundaryRecord,
    pub raster_sum: Option<f64>,
    pub mg_co2e: Option<f64>,
    pub tg_co2e: Option<f64>,
    pub county_area_sq_miles: Option<f64>,
    pub county_area_acres: Option<f64>,
    pub average_mg_co2e_per_acre: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedCollection {
    pub crs: Crs,
    pub records: Vec<EnrichedRecord>,
}

impl EnrichedCollection {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub geoid: String,
    pub county_name: String,
    pub state_name: String,
    pub total_tg_co2e: Option<f64>,
    pub average_mg_co2e_per_acre: Option<f64>,
    pub county_area_acres: Option<f64>,
    pub geometry_wkt: String,
}

/// Rows ready for the relational store, plus the name of their geometry column.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRowSet {
    pub geometry_column: String,
    pub rows: Vec<ExportRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_suffix() {
        assert_eq!(Crs::new("EPSG:4326").column_suffix(), "EPSG_4326");
        assert_eq!(Crs::new(" EPSG:5070 ").as_str(), "EPSG:5070");
    }

    #[test]
    fn test_state_filter_from_single_name() {
        let filter = StateFilter::from("Michigan");
        assert!(filter.contains("Michigan"));
        assert!(!filter.contains("Wisconsin"));
        assert_eq!(filter.names().count(), 1);
    }

    #[test]
    fn test_state_filter_from_many_names() {
        let filter: StateFilter = ["Michigan", "Wisconsin", "Minnesota", "Michigan"]
            .into_iter()
            .collect();
        assert_eq!(
            filter.names().collect::<Vec<_>>(),
            vec!["Michigan", "Minnesota", "Wisconsin"]
        );
    }
}
