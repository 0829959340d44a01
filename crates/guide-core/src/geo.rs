//! Great-circle distance and distance-based landmark ordering.

use crate::types::{GpsPosition, Landmark};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two coordinates
pub fn haversine_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Distance in meters from a position to a landmark's center
pub fn distance_to(position: &GpsPosition, landmark: &Landmark) -> f64 {
    haversine_distance(
        position.latitude,
        position.longitude,
        landmark.lat,
        landmark.lng,
    )
}

/// Whether the position is strictly inside the landmark's trigger radius
pub fn is_within_radius(position: &GpsPosition, landmark: &Landmark) -> bool {
    distance_to(position, landmark) < landmark.radius
}

/// Closest landmark to the position, with its distance
pub fn nearest_landmark<'a>(
    position: &GpsPosition,
    landmarks: &'a [Landmark],
) -> Option<(&'a Landmark, f64)> {
    landmarks
        .iter()
        .map(|l| (l, distance_to(position, l)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Landmarks paired with their distance, nearest first. Without a position the
/// original order is kept and distances are `None`.
pub fn sort_by_distance<'a>(
    position: Option<&GpsPosition>,
    landmarks: &'a [Landmark],
) -> Vec<(&'a Landmark, Option<f64>)> {
    let mut with_distance: Vec<_> = landmarks
        .iter()
        .map(|l| (l, position.map(|p| distance_to(p, l))))
        .collect();

    if position.is_some() {
        with_distance.sort_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }

    with_distance
}

/// Human-readable distance: meters below 1 km, otherwise one-decimal km
pub fn format_distance(meters: f64) -> String {
    let rounded = meters.round();
    if rounded < 1000.0 {
        format!("{} m", rounded as i64)
    } else {
        format!("{:.1} km", meters / 1000.0)
    }
}
