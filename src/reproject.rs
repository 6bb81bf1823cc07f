use gdal::spatial_ref::CoordTransform;
use geo::{Coord, LineString, MultiPolygon, Polygon};

use crate::error::Result;
use crate::model::Crs;

/// Rewrites polygon coordinates from one CRS into another. Implementations
/// must keep ring and polygon structure intact and return one geometry per
/// input, in order.
pub trait Reprojector {
    fn reproject(
        &self,
        geometries: &[MultiPolygon<f64>],
        from: &Crs,
        to: &Crs,
    ) -> Result<Vec<MultiPolygon<f64>>>;
}

/// OSR-backed reprojection. Both ends use traditional GIS axis order, so `x`
/// is always easting or longitude.
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalReprojector;

impl Reprojector for GdalReprojector {
    fn reproject(
        &self,
        geometries: &[MultiPolygon<f64>],
        from: &Crs,
        to: &Crs,
    ) -> Result<Vec<MultiPolygon<f64>>> {
        if from == to {
            return Ok(geometries.to_vec());
        }

        let source = from.to_spatial_ref()?;
        let target = to.to_spatial_ref()?;
        let transform = CoordTransform::new(&source, &target)?;

        tracing::debug!(
            "Reprojecting {} geometries from {} to {}",
            geometries.len(),
            from,
            to
        );

        geometries
            .iter()
            .map(|geometry| transform_multi_polygon(&transform, geometry))
            .collect()
    }
}

fn transform_multi_polygon(
    transform: &CoordTransform,
    geometry: &MultiPolygon<f64>,
) -> Result<MultiPolygon<f64>> {
    let polygons = geometry
        .iter()
        .map(|polygon| {
            let exterior = transform_ring(transform, polygon.exterior())?;
            let interiors = polygon
                .interiors()
                .iter()
                .map(|ring| transform_ring(transform, ring))
                .collect::<Result<Vec<_>>>()?;
            Ok(Polygon::new(exterior, interiors))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(MultiPolygon::new(polygons))
}

fn transform_ring(transform: &CoordTransform, ring: &LineString<f64>) -> Result<LineString<f64>> {
    if ring.0.is_empty() {
        return Ok(ring.clone());
    }

    let mut xs: Vec<f64> = ring.coords().map(|c| c.x).collect();
    let mut ys: Vec<f64> = ring.coords().map(|c| c.y).collect();
    let mut zs = vec![0.0; xs.len()];
    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

    Ok(LineString::new(
        xs.into_iter()
            .zip(ys)
            .map(|(x, y)| Coord { x, y })
            .collect(),
    ))
}
