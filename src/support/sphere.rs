//! Spherical geometry primitives shared by the catalog reader, the TNX
//! projector, and the associator.

use std::f64::consts::PI;

pub const TWO_PI: f64 = 2.0 * PI;

//fp wrap_2pi
/// Wrap an angle (radians) into `[0, 2*pi)`
pub fn wrap_2pi(a: f64) -> f64 {
    let mut a = a % TWO_PI;
    if a < 0.0 {
        a += TWO_PI;
    }
    a
}

//fp wrap_pi
/// Wrap an angle (radians) into `[-pi, pi]`, the form needed when comparing
/// two right ascensions that may straddle the 0/360 boundary
pub fn wrap_pi(a: f64) -> f64 {
    let mut a = a % TWO_PI;
    if a > PI {
        a -= TWO_PI;
    } else if a < -PI {
        a += TWO_PI;
    }
    a
}

//fp angular_distance
/// Great-circle distance between two `(ra, dec)` points, radians in and out,
/// using the numerically stable two-cosine form.
pub fn angular_distance(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let cos_d = dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * (ra1 - ra2).cos();
    cos_d.clamp(-1.0, 1.0).acos()
}

//tp RaDecBox
/// A bounding box in `(ra, spd)` used to select catalog zones for a cone
/// search. `ra_min`/`ra_max` are radians and may have `ra_max` exceed `2*pi`
/// to express wraparound; callers reduce modulo the zone count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaDecBox {
    pub ra_min: f64,
    pub ra_max: f64,
    pub spd_min: f64,
    pub spd_max: f64,
    pub full_ra: bool,
}

//fp cone_bounding_box
/// Compute the `(ra, spd)` bounding box of a cone of radius `r` (radians)
/// centered at `(ra0, dec0)` (radians), per the zone-selection rule: if the
/// cone does not reach the pole, narrow the RA range by `asin(sin r / cos
/// dec)`; otherwise take the full RA range.
pub fn cone_bounding_box(ra0: f64, dec0: f64, r: f64) -> RaDecBox {
    let spd0 = dec0 + PI / 2.0;
    let spd_min = (spd0 - r).clamp(0.0, PI);
    let spd_max = (spd0 + r).clamp(0.0, PI);

    let sin_r = r.sin();
    let cos_dec = dec0.cos();
    if sin_r < cos_dec {
        let dra = (sin_r / cos_dec).asin();
        let mut ra_min = ra0 - dra;
        let mut ra_max = ra0 + dra;
        if ra_min < 0.0 {
            ra_min += TWO_PI;
            ra_max += TWO_PI;
        }
        if ra_min > ra_max {
            ra_max += TWO_PI;
        }
        RaDecBox {
            ra_min,
            ra_max,
            spd_min,
            spd_max,
            full_ra: false,
        }
    } else {
        RaDecBox {
            ra_min: 0.0,
            ra_max: TWO_PI,
            spd_min,
            spd_max,
            full_ra: true,
        }
    }
}

//a Tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_to_self() {
        let d = angular_distance(1.0, 0.5, 1.0, 0.5);
        assert!(d.abs() < 1e-12);
    }

    #[test]
    fn quarter_turn_on_equator() {
        let d = angular_distance(0.0, 0.0, PI / 2.0, 0.0);
        assert!((d - PI / 2.0).abs() < 1e-9);
    }

    #[test]
    fn box_near_pole_takes_full_ra() {
        let b = cone_bounding_box(0.0, (89.9f64).to_radians(), (12.0f64 / 60.0).to_radians());
        assert!(b.full_ra);
    }

    #[test]
    fn box_away_from_pole_is_narrow() {
        let b = cone_bounding_box(PI, 0.0, (1.0f64).to_radians());
        assert!(!b.full_ra);
        assert!(b.ra_max - b.ra_min < (3.0f64).to_radians());
    }
}
