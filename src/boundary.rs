use gdal::vector::{Feature, LayerAccess};
use gdal::Dataset;
use geo::{Geometry, MultiPolygon};
use std::path::Path;

use crate::error::{CarbonError, Result};
use crate::model::{BoundaryCollection, BoundaryRecord, Crs, StateFilter};
use crate::reproject::Reprojector;

pub const GEOID_FIELD: &str = "GEOID";
pub const NAME_FIELD: &str = "NAME";
pub const STATE_NAME_FIELD: &str = "STATE_NAME";

pub struct BoundaryLoader;

impl BoundaryLoader {
    /// Reads every feature of the first layer of an OGR-readable vector source.
    pub fn load(path: &Path) -> Result<BoundaryCollection> {
        CarbonError::check_readable(path)?;

        let dataset = Dataset::open(path)
            .map_err(|e| CarbonError::format(path, format!("not a readable vector source: {}", e)))?;
        if dataset.layer_count() == 0 {
            return Err(CarbonError::format(path, "dataset has no vector layers"));
        }
        let mut layer = dataset.layer(0)?;

        let srs = layer
            .spatial_ref()
            .ok_or_else(|| CarbonError::format(path, "layer has no coordinate reference system"))?;
        let crs = Crs::from_spatial_ref(&srs)?;

        let mut records = Vec::new();
        for feature in layer.features() {
            records.push(read_record(&feature, path)?);
        }

        tracing::info!(
            "Loaded {} boundaries from {:?} (CRS {})",
            records.len(),
            path,
            crs
        );

        Ok(BoundaryCollection::new(crs, records))
    }

    /// Keeps the records whose `STATE_NAME` is in `filter`, in their original
    /// order. Names that match nothing are not an error.
    pub fn filter_by_state(collection: BoundaryCollection, filter: &StateFilter) -> BoundaryCollection {
        let before = collection.len();
        let records: Vec<_> = collection
            .records
            .into_iter()
            .filter(|record| filter.contains(&record.state_name))
            .collect();

        for name in filter.names() {
            if !records.iter().any(|r| r.state_name == name) {
                tracing::warn!("State filter '{}' matched no boundaries", name);
            }
        }
        tracing::info!("State filter kept {} of {} boundaries", records.len(), before);

        BoundaryCollection::new(collection.crs, records)
    }

    /// Moves every geometry into `target`. Attributes and order are unchanged.
    pub fn reproject(
        collection: BoundaryCollection,
        target: &Crs,
        reprojector: &dyn Reprojector,
    ) -> Result<BoundaryCollection> {
        let geometries: Vec<MultiPolygon<f64>> = collection
            .records
            .iter()
            .map(|record| record.geometry.clone())
            .collect();
        let reprojected = reprojector.reproject(&geometries, &collection.crs, target)?;

        if reprojected.len() != collection.len() {
            return Err(CarbonError::Config(format!(
                "reprojector returned {} geometries for {} boundaries",
                reprojected.len(),
                collection.len()
            )));
        }

        let records = collection
            .records
            .into_iter()
            .zip(reprojected)
            .map(|(record, geometry)| BoundaryRecord { geometry, ..record })
            .collect();

        Ok(BoundaryCollection::new(target.clone(), records))
    }
}

fn read_record(feature: &Feature, path: &Path) -> Result<BoundaryRecord> {
    let geometry = match feature.geometry() {
        Some(geometry) => {
            let geometry = geometry.to_geo().map_err(|e| {
                CarbonError::format(path, format!("unreadable geometry: {}", e))
            })?;
            into_multi_polygon(geometry, path)?
        }
        None => MultiPolygon::new(Vec::new()),
    };

    Ok(BoundaryRecord {
        geoid: string_field(feature, GEOID_FIELD, path)?,
        name: string_field(feature, NAME_FIELD, path)?,
        state_name: string_field(feature, STATE_NAME_FIELD, path)?,
        geometry,
    })
}

fn string_field(feature: &Feature, field: &str, path: &Path) -> Result<String> {
    let index = feature
        .field_index(field)
        .map_err(|_| CarbonError::format(path, format!("missing attribute '{}'", field)))?;
    Ok(feature.field_as_string(index)?.unwrap_or_default())
}

fn into_multi_polygon(geometry: Geometry<f64>, path: &Path) -> Result<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(polygon) => Ok(MultiPolygon::new(vec![polygon])),
        Geometry::MultiPolygon(multi) => Ok(multi),
        other => Err(CarbonError::format(
            path,
            format!("expected polygon geometries, found {}", geometry_kind(&other)),
        )),
    }
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) | Geometry::MultiPoint(_) => "points",
        Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => "lines",
        Geometry::GeometryCollection(_) => "a geometry collection",
        _ => "a non-polygon geometry",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdal::DriverManager;
    use geo::polygon;
    use tempfile::TempDir;

    fn record(geoid: &str, state: &str) -> BoundaryRecord {
        BoundaryRecord {
            geoid: geoid.to_string(),
            name: format!("County {}", geoid),
            state_name: state.to_string(),
            geometry: MultiPolygon::new(vec![polygon![
                (x: 0.0, y: 0.0),
                (x: 1.0, y: 0.0),
                (x: 1.0, y: 1.0),
                (x: 0.0, y: 0.0),
            ]]),
        }
    }

    fn collection() -> BoundaryCollection {
        BoundaryCollection::new(
            Crs::new("EPSG:4269"),
            vec![
                record("26001", "Michigan"),
                record("55001", "Wisconsin"),
                record("26003", "Michigan"),
                record("27001", "Minnesota"),
            ],
        )
    }

    fn geoids(collection: &BoundaryCollection) -> Vec<&str> {
        collection.records.iter().map(|r| r.geoid.as_str()).collect()
    }

    #[test]
    fn test_filter_single_state_keeps_order() {
        let filtered = BoundaryLoader::filter_by_state(collection(), &"Michigan".into());
        assert_eq!(geoids(&filtered), vec!["26001", "26003"]);
        assert_eq!(filtered.crs, Crs::new("EPSG:4269"));
    }

    #[test]
    fn test_filter_state_set() {
        let filter: StateFilter = ["Minnesota", "Wisconsin"].into_iter().collect();
        let filtered = BoundaryLoader::filter_by_state(collection(), &filter);
        assert_eq!(geoids(&filtered), vec!["55001", "27001"]);
    }

    #[test]
    fn test_filter_without_match_is_empty() {
        let filtered = BoundaryLoader::filter_by_state(collection(), &"Atlantis".into());
        assert!(filtered.is_empty());
    }

    struct ShiftReprojector;

    impl Reprojector for ShiftReprojector {
        fn reproject(
            &self,
            geometries: &[MultiPolygon<f64>],
            _from: &Crs,
            _to: &Crs,
        ) -> Result<Vec<MultiPolygon<f64>>> {
            use geo::Translate;
            Ok(geometries.iter().map(|g| g.translate(10.0, 20.0)).collect())
        }
    }

    #[test]
    fn test_reproject_only_touches_geometry_and_crs() {
        let original = collection();
        let target = Crs::new("EPSG:5070");
        let reprojected =
            BoundaryLoader::reproject(original.clone(), &target, &ShiftReprojector).unwrap();

        assert_eq!(reprojected.crs, target);
        assert_eq!(reprojected.len(), original.len());
        for (before, after) in original.records.iter().zip(&reprojected.records) {
            assert_eq!(before.geoid, after.geoid);
            assert_eq!(before.name, after.name);
            assert_eq!(before.state_name, after.state_name);
            assert_eq!(after.geometry.0[0].exterior().0[0].x, 10.0);
        }
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = BoundaryLoader::load(Path::new("missing/counties.shp")).unwrap_err();
        assert!(matches!(err, CarbonError::Io { .. }));
    }

    const COUNTIES_GEOJSON: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    { "type": "Feature",
      "properties": { "GEOID": "26065", "NAME": "Ingham", "STATE_NAME": "Michigan" },
      "geometry": { "type": "Polygon", "coordinates": [[[-84.6, 42.4], [-84.1, 42.4], [-84.1, 42.8], [-84.6, 42.8], [-84.6, 42.4]]] } },
    { "type": "Feature",
      "properties": { "GEOID": "55025", "NAME": "Dane", "STATE_NAME": "Wisconsin" },
      "geometry": { "type": "MultiPolygon", "coordinates": [[[[-89.8, 42.8], [-89.0, 42.8], [-89.0, 43.3], [-89.8, 43.3], [-89.8, 42.8]]]] } }
  ]
}"#;

    #[test]
    fn test_load_geojson() {
        if DriverManager::get_driver_by_name("GeoJSON").is_err() {
            eprintln!("Skipping test: GeoJSON driver not available");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("counties.geojson");
        std::fs::write(&path, COUNTIES_GEOJSON).unwrap();

        let loaded = BoundaryLoader::load(&path).unwrap();
        assert_eq!(geoids(&loaded), vec!["26065", "55025"]);
        assert_eq!(loaded.records[0].name, "Ingham");
        assert_eq!(loaded.records[1].state_name, "Wisconsin");
        assert_eq!(loaded.records[0].geometry.0.len(), 1);
        assert_eq!(loaded.records[1].geometry.0.len(), 1);
    }

    #[test]
    fn test_feature_without_geometry_gets_empty_multipolygon() {
        if DriverManager::get_driver_by_name("GeoJSON").is_err() {
            eprintln!("Skipping test: GeoJSON driver not available");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("counties.geojson");
        std::fs::write(
            &path,
            r#"{
  "type": "FeatureCollection",
  "features": [
    { "type": "Feature",
      "properties": { "GEOID": "26999", "NAME": "Lost", "STATE_NAME": "Michigan" },
      "geometry": null }
  ]
}"#,
        )
        .unwrap();

        let loaded = BoundaryLoader::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.records[0].geoid, "26999");
        assert!(loaded.records[0].geometry.0.is_empty());
    }

    #[test]
    fn test_load_without_state_attribute_is_format_error() {
        if DriverManager::get_driver_by_name("GeoJSON").is_err() {
            eprintln!("Skipping test: GeoJSON driver not available");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("counties.geojson");
        std::fs::write(&path, COUNTIES_GEOJSON.replace("STATE_NAME", "STATE")).unwrap();

        let err = BoundaryLoader::load(&path).unwrap_err();
        assert!(matches!(err, CarbonError::Format { .. }));
    }
}
