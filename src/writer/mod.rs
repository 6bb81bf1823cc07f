use gdal::vector::ToGdal;
use geo::MultiPolygon;
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CarbonError, Result};
use crate::model::{Crs, EnrichedCollection, ExportRow, ExportRowSet};
use crate::reproject::Reprojector;

pub const DEFAULT_TABLE_NAME: &str = "county_carbon";

/// Exported columns ahead of the geometry column, with their SQLite types.
const VALUE_COLUMNS: [(&str, &str); 6] = [
    ("geoid", "TEXT"),
    ("county_name", "TEXT"),
    ("state_name", "TEXT"),
    ("total_Tg_CO2e", "REAL"),
    ("average_Mg_CO2e_per_acre", "REAL"),
    ("county_area_acres", "REAL"),
];

/// `geometry_wkt_EPSG_4326` for `EPSG:4326`.
pub fn geometry_column_name(export_crs: &Crs) -> String {
    format!("geometry_wkt_{}", export_crs.column_suffix())
}

/// Reprojects the enriched rows into `export_crs`, serializes their geometry
/// as WKT and keeps only the exported columns.
pub fn prepare(
    enriched: &EnrichedCollection,
    export_crs: &Crs,
    reprojector: &dyn Reprojector,
) -> Result<ExportRowSet> {
    let geometries: Vec<MultiPolygon<f64>> = enriched
        .records
        .iter()
        .map(|r| r.boundary.geometry.clone())
        .collect();
    let reprojected = reprojector.reproject(&geometries, &enriched.crs, export_crs)?;
    if reprojected.len() != enriched.len() {
        return Err(CarbonError::Config(format!(
            "reprojector returned {} geometries for {} export rows",
            reprojected.len(),
            enriched.len()
        )));
    }

    let rows = enriched
        .records
        .iter()
        .zip(&reprojected)
        .map(|(record, geometry)| {
            Ok(ExportRow {
                geoid: record.boundary.geoid.clone(),
                county_name: record.boundary.name.clone(),
                state_name: record.boundary.state_name.clone(),
                total_tg_co2e: record.tg_co2e,
                average_mg_co2e_per_acre: record.average_mg_co2e_per_acre,
                county_area_acres: record.county_area_acres,
                geometry_wkt: to_wkt(geometry)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ExportRowSet {
        geometry_column: geometry_column_name(export_crs),
        rows,
    })
}

/// Single-member multipolygons are written as plain polygons.
fn to_wkt(geometry: &MultiPolygon<f64>) -> Result<String> {
    let gdal_geometry = match geometry.0.as_slice() {
        [polygon] => polygon.to_gdal()?,
        _ => geometry.to_gdal()?,
    };
    Ok(gdal_geometry.wkt()?)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Default)]
pub struct SqliteWriter {}

impl SqliteWriter {
    pub fn new() -> Self {
        Self {}
    }

    /// Replaces `table_name` in the SQLite database at `destination` with
    /// `row_set`, creating the database and its directory as needed.
    pub fn export(
        &self,
        row_set: &ExportRowSet,
        destination: &Path,
        table_name: &str,
    ) -> Result<PathBuf> {
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CarbonError::storage(destination, e))?;
        }

        tracing::info!(
            "Writing {} rows to table '{}' in {:?}",
            row_set.rows.len(),
            table_name,
            destination
        );

        let mut conn =
            Connection::open(destination).map_err(|e| CarbonError::storage(destination, e))?;
        let written = Self::replace_table(&mut conn, row_set, table_name);
        // The connection is closed whether or not the write succeeded.
        let closed = conn.close().map_err(|(_, e)| e);

        written
            .and(closed)
            .map_err(|e| CarbonError::storage(destination, e))?;

        Ok(destination.to_path_buf())
    }

    fn replace_table(
        conn: &mut Connection,
        row_set: &ExportRowSet,
        table_name: &str,
    ) -> rusqlite::Result<()> {
        let table = quote_identifier(table_name);
        let columns: Vec<String> = VALUE_COLUMNS
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_identifier(name), ty))
            .chain(std::iter::once(format!(
                "{} TEXT",
                quote_identifier(&row_set.geometry_column)
            )))
            .collect();

        let tx = conn.transaction()?;
        tx.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
        tx.execute(
            &format!("CREATE TABLE {} ({})", table, columns.join(", ")),
            [],
        )?;
        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {} VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                table
            ))?;
            for row in &row_set.rows {
                insert.execute(params![
                    row.geoid,
                    row.county_name,
                    row.state_name,
                    row.total_tg_co2e,
                    row.average_mg_co2e_per_acre,
                    row.county_area_acres,
                    row.geometry_wkt,
                ])?;
            }
        }
        tx.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoundaryRecord, EnrichedRecord};
    use crate::reproject::GdalReprojector;
    use geo::polygon;
    use tempfile::TempDir;

    fn enriched_record(geoid: &str, tg: Option<f64>) -> EnrichedRecord {
        EnrichedRecord {
            boundary: BoundaryRecord {
                geoid: geoid.to_string(),
                name: format!("County {}", geoid),
                state_name: "Michigan".to_string(),
                geometry: MultiPolygon::new(vec![polygon![
                    (x: 0.0, y: 0.0),
                    (x: 60.0, y: 0.0),
                    (x: 60.0, y: 60.0),
                    (x: 0.0, y: 0.0),
                ]]),
            },
            raster_sum: tg.map(|t| t * 1e6 / (900.0 / 4046.86)),
            mg_co2e: tg.map(|t| t * 1e6),
            tg_co2e: tg,
            county_area_sq_miles: tg.map(|_| 0.0007),
            county_area_acres: tg.map(|_| 0.44),
            average_mg_co2e_per_acre: tg.map(|t| t * 1e6 / 0.44),
        }
    }

    fn row_set() -> ExportRowSet {
        let enriched = EnrichedCollection {
            crs: Crs::new("EPSG:4326"),
            records: vec![enriched_record("26065", Some(0.5)), enriched_record("26037", None)],
        };
        prepare(&enriched, &Crs::new("EPSG:4326"), &GdalReprojector).unwrap()
    }

    fn count_rows(path: &Path, table: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_geometry_column_name() {
        assert_eq!(
            geometry_column_name(&Crs::new("EPSG:4326")),
            "geometry_wkt_EPSG_4326"
        );
    }

    #[test]
    fn test_prepare_selects_and_renames() {
        let rows = row_set();
        assert_eq!(rows.geometry_column, "geometry_wkt_EPSG_4326");
        assert_eq!(rows.rows.len(), 2);

        let first = &rows.rows[0];
        assert_eq!(first.geoid, "26065");
        assert_eq!(first.county_name, "County 26065");
        assert_eq!(first.total_tg_co2e, Some(0.5));
        assert!(first.geometry_wkt.starts_with("POLYGON"));
        assert_eq!(rows.rows[1].total_tg_co2e, None);
    }

    #[test]
    fn test_multi_member_geometry_stays_multipolygon() {
        let square = |x: f64| {
            polygon![(x: x, y: 0.0), (x: x + 1.0, y: 0.0), (x: x + 1.0, y: 1.0), (x: x, y: 0.0)]
        };
        let wkt = to_wkt(&MultiPolygon::new(vec![square(0.0), square(5.0)])).unwrap();
        assert!(wkt.starts_with("MULTIPOLYGON"), "{}", wkt);
    }

    #[test]
    fn test_missing_geometry_exports_as_empty_multipolygon() {
        let wkt = to_wkt(&MultiPolygon::new(Vec::new())).unwrap();
        assert_eq!(wkt, "MULTIPOLYGON EMPTY");
    }

    struct DroppingReprojector;

    impl Reprojector for DroppingReprojector {
        fn reproject(
            &self,
            _geometries: &[MultiPolygon<f64>],
            _from: &Crs,
            _to: &Crs,
        ) -> Result<Vec<MultiPolygon<f64>>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_prepare_rejects_short_reprojection() {
        let enriched = EnrichedCollection {
            crs: Crs::new("EPSG:5070"),
            records: vec![enriched_record("26065", Some(0.5)), enriched_record("26037", None)],
        };
        let err = prepare(&enriched, &Crs::new("EPSG:4326"), &DroppingReprojector).unwrap_err();
        assert!(matches!(err, CarbonError::Config(_)));
    }

    #[test]
    fn test_export_creates_directory_and_table() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("outputs/nested/county_carbon.sqlite");

        let written = SqliteWriter::new()
            .export(&row_set(), &output, DEFAULT_TABLE_NAME)
            .unwrap();
        assert_eq!(written, output);
        assert_eq!(count_rows(&output, DEFAULT_TABLE_NAME), 2);

        let conn = Connection::open(&output).unwrap();
        let (geoid, tg, wkt): (String, Option<f64>, String) = conn
            .query_row(
                "SELECT geoid, total_Tg_CO2e, geometry_wkt_EPSG_4326 FROM county_carbon \
                 WHERE geoid = '26065'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(geoid, "26065");
        assert_eq!(tg, Some(0.5));
        assert!(wkt.starts_with("POLYGON"));

        let null_tg: Option<f64> = conn
            .query_row(
                "SELECT total_Tg_CO2e FROM county_carbon WHERE geoid = '26037'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(null_tg, None);
    }

    #[test]
    fn test_export_twice_replaces_table() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("county_carbon.sqlite");
        let writer = SqliteWriter::new();

        writer.export(&row_set(), &output, "county_carbon").unwrap();
        writer.export(&row_set(), &output, "county_carbon").unwrap();
        assert_eq!(count_rows(&output, "county_carbon"), 2);
    }

    #[test]
    fn test_export_empty_rows_creates_empty_table() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("empty.sqlite");
        let empty = ExportRowSet {
            geometry_column: "geometry_wkt_EPSG_4326".to_string(),
            rows: Vec::new(),
        };

        SqliteWriter::new().export(&empty, &output, "county_carbon").unwrap();
        assert_eq!(count_rows(&output, "county_carbon"), 0);
    }

    #[test]
    fn test_export_to_corrupt_file_is_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("corrupt.sqlite");
        fs::write(&output, vec![0x42u8; 4096]).unwrap();

        let err = SqliteWriter::new()
            .export(&row_set(), &output, "county_carbon")
            .unwrap_err();
        assert!(matches!(err, CarbonError::Storage { .. }));
    }
}
