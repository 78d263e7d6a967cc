//! Great-circle distance and path simplification.
//!
//! Thin adapters over `geo` so the rest of the crate speaks [`Coordinate`].
//! Note `geo` points are (x = longitude, y = latitude).

use geo::algorithm::simplify::Simplify;
use geo::{Coord, Distance, Haversine, LineString, Point};

use crate::types::Coordinate;

fn to_point(c: Coordinate) -> Point<f64> {
    Point::new(c.longitude, c.latitude)
}

/// Great-circle distance between two coordinates (meters).
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    Haversine::distance(to_point(a), to_point(b))
}

/// Ramer-Douglas-Peucker simplification with a tolerance in degrees.
///
/// Paths of two points or fewer are returned unchanged.
pub fn simplify(path: &[Coordinate], epsilon_degrees: f64) -> Vec<Coordinate> {
    if path.len() <= 2 {
        return path.to_vec();
    }

    let line: LineString<f64> = path
        .iter()
        .map(|c| Coord { x: c.longitude, y: c.latitude })
        .collect::<Vec<_>>()
        .into();

    line.simplify(&epsilon_degrees)
        .coords()
        .map(|c| Coordinate::new(c.y, c.x))
        .collect()
}

/// Sum of great-circle legs along a path (meters).
pub fn path_length_m(path: &[Coordinate]) -> f64 {
    path.windows(2).map(|w| haversine_m(w[0], w[1])).sum()
}

/// Length of the path after simplification, which strips GPS jitter
/// before the legs are summed.
pub fn simplified_length_m(path: &[Coordinate], epsilon_degrees: f64) -> f64 {
    path_length_m(&simplify(path, epsilon_degrees))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_m(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 200.0, "distance was {d}");
    }

    #[test]
    fn test_haversine_zero() {
        let c = Coordinate::new(45.5, -122.6);
        assert_eq!(haversine_m(c, c), 0.0);
    }

    #[test]
    fn test_simplify_removes_collinear_jitter() {
        let path: Vec<_> = (0..20)
            .map(|i| {
                let jitter = if i % 2 == 0 { 0.00001 } else { -0.00001 };
                Coordinate::new(45.0 + i as f64 * 0.0005, -122.0 + jitter)
            })
            .collect();

        let simplified = simplify(&path, 0.00005);
        assert!(simplified.len() < path.len());
        assert_eq!(simplified.first(), path.first());
        assert_eq!(simplified.last(), path.last());
    }

    #[test]
    fn test_simplify_keeps_corners() {
        let path = vec![
            Coordinate::new(45.0, -122.0),
            Coordinate::new(45.01, -122.0),
            Coordinate::new(45.01, -121.99),
        ];
        assert_eq!(simplify(&path, 0.00005).len(), 3);
    }

    #[test]
    fn test_simplified_length_not_longer_than_raw() {
        let path: Vec<_> = (0..50)
            .map(|i| Coordinate::new(45.0 + i as f64 * 0.0002, -122.0 + (i % 3) as f64 * 0.00002))
            .collect();
        assert!(simplified_length_m(&path, 0.00005) <= path_length_m(&path));
        assert!(simplified_length_m(&path, 0.00005) > 1000.0);
    }

    #[test]
    fn test_short_paths() {
        assert_eq!(path_length_m(&[]), 0.0);
        assert_eq!(simplified_length_m(&[Coordinate::new(1.0, 1.0)], 0.1), 0.0);
    }
}
