use sha2::Digest;

pub const MIN_ROUTE_DISTANCE_KM: f64 = 10.0;
pub const MAX_ROUTE_DISTANCE_KM: f64 = 500.0;

/// Total fare for a ride: flag-fall plus per-km rate. Non-positive distances
/// collapse to the base fare alone.
pub fn fare_cents(base_fare_cents: i64, rate_per_km_cents: i64, distance_km: f64) -> i64 {
    if distance_km <= 0.0 {
        return base_fare_cents;
    }
    base_fare_cents + (rate_per_km_cents as f64 * distance_km).round() as i64
}

/// Stand-in geocoding distance. Deterministic: the same endpoint pair always
/// maps to the same distance, derived from a SHA-256 digest of the normalized
/// labels and scaled into [MIN_ROUTE_DISTANCE_KM, MAX_ROUTE_DISTANCE_KM].
/// Production deployments swap this for a mapping-service client.
pub fn route_distance_km(source: &str, destination: &str) -> f64 {
    let key = format!("{}|{}", normalize_label(source), normalize_label(destination));
    let digest = sha2::Sha256::digest(key.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    let unit = (u64::from_be_bytes(raw) as f64) / (u64::MAX as f64);
    let km = MIN_ROUTE_DISTANCE_KM + unit * (MAX_ROUTE_DISTANCE_KM - MIN_ROUTE_DISTANCE_KM);
    // One decimal keeps quotes stable across float formatting.
    (km * 10.0).round() / 10.0
}

/// A passenger's share of the total fare, scaled by the fraction of the route
/// they cover. Degenerate distances fall back to the full fare; the result is
/// never negative and the division can never hit zero.
pub fn proportional_fare_cents(total_fare_cents: i64, total_km: f64, passenger_km: f64) -> i64 {
    if total_km <= 0.0 || passenger_km <= 0.0 {
        return total_fare_cents.max(0);
    }
    ((total_fare_cents as f64) * passenger_km / total_km)
        .round()
        .max(0.0) as i64
}

fn normalize_label(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fare_adds_rate_over_distance() {
        // 50.00 base + 5.00/km over 10 km = 100.00
        assert_eq!(fare_cents(5_000, 500, 10.0), 10_000);
    }

    #[test]
    fn fare_collapses_to_base_for_degenerate_distance() {
        assert_eq!(fare_cents(5_000, 500, 0.0), 5_000);
        assert_eq!(fare_cents(5_000, 500, -3.0), 5_000);
    }

    #[test]
    fn proportional_share_is_distance_ratio() {
        assert_eq!(proportional_fare_cents(20_000, 100.0, 25.0), 5_000);
        assert_eq!(proportional_fare_cents(20_000, 10.0, 10.0), 20_000);
    }

    #[test]
    fn proportional_share_falls_back_on_degenerate_distance() {
        assert_eq!(proportional_fare_cents(20_000, 0.0, 25.0), 20_000);
        assert_eq!(proportional_fare_cents(20_000, 100.0, 0.0), 20_000);
        assert_eq!(proportional_fare_cents(20_000, -1.0, 25.0), 20_000);
    }

    #[test]
    fn proportional_share_never_negative() {
        assert_eq!(proportional_fare_cents(-500, 100.0, 25.0), 0);
        assert_eq!(proportional_fare_cents(-500, 0.0, 0.0), 0);
    }

    #[test]
    fn ride_pricing_scenario_end_to_end() {
        // A 10 km ride at 50.00 base + 5.00/km prices at 100.00; a passenger
        // covering the full route with 2 seats owes 200.00.
        let total = fare_cents(5_000, 500, 10.0);
        assert_eq!(total, 10_000);
        let per_seat = proportional_fare_cents(total, 10.0, 10.0);
        assert_eq!(per_seat * 2, 20_000);
        // A passenger hopping off halfway owes half per seat.
        assert_eq!(proportional_fare_cents(total, 10.0, 5.0), 5_000);
    }

    #[test]
    fn distance_is_deterministic_and_bounded() {
        let a = route_distance_km("Springfield", "Shelbyville");
        let b = route_distance_km("  springfield ", "SHELBYVILLE");
        assert_eq!(a, b);
        assert!(a >= MIN_ROUTE_DISTANCE_KM);
        assert!(a <= MAX_ROUTE_DISTANCE_KM);
    }

    #[test]
    fn distance_distinguishes_directions_deterministically() {
        let ab = route_distance_km("a", "b");
        let ab2 = route_distance_km("a", "b");
        assert_eq!(ab, ab2);
        assert!(route_distance_km("b", "a") >= MIN_ROUTE_DISTANCE_KM);
    }
}
