// ===========================================================================
// Web Mercator Coordinate Conversion
// ===========================================================================
// Buffering and metric distance math happen in EPSG:3857 so that a buffer of
// N meters means N meters regardless of latitude. The spherical formulas
// below are the standard tile-server ones.

use geo_types::{Coord, LineString, Point, Polygon};
use thiserror::Error;

pub const EARTH_RADIUS: f64 = 6378137.0;

/// Latitude bound of the Web Mercator domain. The projection diverges at the
/// poles; flight operations never get close, so hitting this is treated as a
/// bad input rather than a supported degradation zone.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.06;

/// Coordinate reference frames the engine moves between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Angular degrees, EPSG:4326.
    Wgs84,
    /// Planar meters, EPSG:3857.
    WebMercator,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("coordinate ({longitude}, {latitude}) outside the WGS84 angular domain")]
    CoordinateOutOfRange { longitude: f64, latitude: f64 },
    #[error("latitude {0} outside the Web Mercator domain (|lat| < {MAX_MERCATOR_LATITUDE})")]
    LatitudeOutOfDomain(f64),
}

/// Convert lat/lng (EPSG:4326) to Web Mercator (EPSG:3857).
/// Input: (longitude, latitude) in degrees. Output: (x, y) in meters.
pub fn lat_lng_to_web_merc(lon: f64, lat: f64) -> Result<(f64, f64), ProjectionError> {
    if !(-180.0..=180.0).contains(&lon)
        || !(-90.0..=90.0).contains(&lat)
        || lon.is_nan()
        || lat.is_nan()
    {
        return Err(ProjectionError::CoordinateOutOfRange {
            longitude: lon,
            latitude: lat,
        });
    }
    if lat.abs() >= MAX_MERCATOR_LATITUDE {
        return Err(ProjectionError::LatitudeOutOfDomain(lat));
    }
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * ((std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan()).ln();
    Ok((x, y))
}

/// Convert Web Mercator (EPSG:3857) back to lat/lng (EPSG:4326).
/// Input: (x, y) in meters. Output: (longitude, latitude) in degrees.
pub fn web_merc_to_lat_lng(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    (lon, lat)
}

/// Reproject a single point between frames. Pure and deterministic.
pub fn project_point(point: Point<f64>, from: Frame, to: Frame) -> Result<Point<f64>, ProjectionError> {
    match (from, to) {
        (Frame::Wgs84, Frame::WebMercator) => {
            let (x, y) = lat_lng_to_web_merc(point.x(), point.y())?;
            Ok(Point::new(x, y))
        }
        (Frame::WebMercator, Frame::Wgs84) => {
            let (lon, lat) = web_merc_to_lat_lng(point.x(), point.y());
            Ok(Point::new(lon, lat))
        }
        _ => Ok(point),
    }
}

/// Reproject a polygon ring by ring. The first out-of-domain vertex aborts
/// the whole polygon.
pub fn project_polygon(
    polygon: &Polygon<f64>,
    from: Frame,
    to: Frame,
) -> Result<Polygon<f64>, ProjectionError> {
    let exterior = project_ring(polygon.exterior(), from, to)?;
    let interiors = polygon
        .interiors()
        .iter()
        .map(|ring| project_ring(ring, from, to))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn project_ring(
    ring: &LineString<f64>,
    from: Frame,
    to: Frame,
) -> Result<LineString<f64>, ProjectionError> {
    let mut coords = Vec::with_capacity(ring.0.len());
    for coord in &ring.0 {
        let projected = project_point(Point::new(coord.x, coord.y), from, to)?;
        coords.push(Coord {
            x: projected.x(),
            y: projected.y(),
        });
    }
    Ok(LineString::new(coords))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_origin_maps_to_origin() {
        let (x, y) = lat_lng_to_web_merc(0.0, 0.0).unwrap();
        assert_relative_eq!(x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_round_trip() {
        // Valencia area, typical operating latitude
        let (lon, lat) = (-0.3763, 39.4699);
        let (x, y) = lat_lng_to_web_merc(lon, lat).unwrap();
        let (lon2, lat2) = web_merc_to_lat_lng(x, y);
        assert_relative_eq!(lon, lon2, epsilon = 1e-9);
        assert_relative_eq!(lat, lat2, epsilon = 1e-9);
    }

    #[test]
    fn test_one_degree_of_longitude_at_equator() {
        // At the equator a degree of longitude is ~111.32 km and Web Mercator
        // has no scale distortion.
        let (x0, _) = lat_lng_to_web_merc(0.0, 0.0).unwrap();
        let (x1, _) = lat_lng_to_web_merc(1.0, 0.0).unwrap();
        assert_relative_eq!(x1 - x0, 111_319.49, epsilon = 1.0);
    }

    #[test]
    fn test_pole_rejected() {
        assert!(matches!(
            lat_lng_to_web_merc(10.0, 89.0),
            Err(ProjectionError::LatitudeOutOfDomain(_))
        ));
        assert!(matches!(
            lat_lng_to_web_merc(10.0, -90.0),
            Err(ProjectionError::LatitudeOutOfDomain(_))
        ));
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            lat_lng_to_web_merc(181.0, 10.0),
            Err(ProjectionError::CoordinateOutOfRange { .. })
        ));
        assert!(matches!(
            lat_lng_to_web_merc(10.0, 91.0),
            Err(ProjectionError::CoordinateOutOfRange { .. })
        ));
    }

    #[test]
    fn test_project_point_identity_frames() {
        let p = Point::new(2.0, 41.0);
        assert_eq!(project_point(p, Frame::Wgs84, Frame::Wgs84).unwrap(), p);
    }

    #[test]
    fn test_project_polygon_round_trip() {
        let poly = Polygon::new(
            LineString::from(vec![(0.0, 39.0), (0.01, 39.0), (0.01, 39.01), (0.0, 39.0)]),
            vec![],
        );
        let merc = project_polygon(&poly, Frame::Wgs84, Frame::WebMercator).unwrap();
        let back = project_polygon(&merc, Frame::WebMercator, Frame::Wgs84).unwrap();
        for (a, b) in poly.exterior().0.iter().zip(back.exterior().0.iter()) {
            assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
            assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
        }
    }
}
