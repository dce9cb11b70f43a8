//! Time and annual-aberration helpers.
//!
//! The original pipeline carried two independent copies of the nutation
//! series and two spline implementations (see the design notes); this
//! module collapses that down to one vetted aberration routine using the
//! low-precision solar position formulas, which are accurate to within a
//! few milliarcseconds -- comfortably inside the pixel tolerances the
//! associator works with.

use hifitime::Epoch;

use crate::error::Error;

const ABERRATION_CONSTANT_RAD: f64 = 20.49552 / 3600.0 * std::f64::consts::PI / 180.0;
const OBLIQUITY_J2000_RAD: f64 = 23.43929111 * std::f64::consts::PI / 180.0;

//fp mjd_from_iso
/// Parse an ISO-8601 UTC timestamp (with or without fractional seconds) into
/// a Modified Julian Date.
pub fn mjd_from_iso(s: &str) -> Result<f64, Error> {
    let epoch = Epoch::from_gregorian_str(s).map_err(|e| Error::Parse(format!("bad timestamp {s:?}: {e}")))?;
    Ok(epoch.to_mjd_utc_days())
}

//fp iso_from_mjd
/// Format a Modified Julian Date back to an ISO-8601 UTC timestamp with
/// millisecond precision.
pub fn iso_from_mjd(mjd: f64) -> String {
    let epoch = Epoch::from_mjd_utc(mjd);
    epoch.to_gregorian_str(hifitime::TimeScale::UTC)
}

//fp sun_mean_longitude
/// Low-precision Sun mean ecliptic longitude (radians), Meeus-style
/// polynomial in Julian centuries since J2000.
fn sun_mean_longitude(t: f64) -> f64 {
    let l0 = 280.46646 + 36000.76983 * t + 0.0003032 * t * t;
    crate::support::sphere::wrap_2pi(l0.to_radians())
}

//fp sun_mean_anomaly
fn sun_mean_anomaly(t: f64) -> f64 {
    let m = 357.52911 + 35999.05029 * t - 0.0001537 * t * t;
    crate::support::sphere::wrap_2pi(m.to_radians())
}

//fp sun_apparent_longitude
/// Sun's apparent ecliptic longitude, accurate to a few arcseconds -- ample
/// for an aberration correction whose own amplitude is ~20 arcsec.
fn sun_apparent_longitude(mjd: f64) -> f64 {
    let t = (mjd - 51544.5) / 36525.0;
    let l0 = sun_mean_longitude(t);
    let m = sun_mean_anomaly(t);
    let c = (1.914602 - 0.004817 * t - 0.000014 * t * t) * m.sin()
        + (0.019993 - 0.000101 * t) * (2.0 * m).sin()
        + 0.000289 * (3.0 * m).sin();
    l0 + c.to_radians()
}

//fp annual_aberration
/// Annual aberration correction `(d_ra, d_dec)` in radians for a catalog
/// position `(ra, dec)` (radians, J2000) observed at modified Julian date
/// `mjd`. Both outputs are added to `(ra, dec)` to get the apparent
/// position.
pub fn annual_aberration(mjd: f64, ra: f64, dec: f64) -> (f64, f64) {
    let lambda = sun_apparent_longitude(mjd);
    let eps = OBLIQUITY_J2000_RAD;
    let k = ABERRATION_CONSTANT_RAD;

    let (sin_ra, cos_ra) = ra.sin_cos();
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_lambda, cos_lambda) = lambda.sin_cos();
    let (sin_eps, cos_eps) = eps.sin_cos();

    if cos_dec.abs() < 1e-9 {
        return (0.0, 0.0);
    }

    let d_ra = -k * (cos_ra * cos_lambda * cos_eps + sin_ra * sin_lambda) / cos_dec;
    let d_dec = -k
        * (cos_lambda * cos_eps * (sin_eps / cos_eps * cos_dec - sin_ra * sin_dec)
            + cos_ra * sin_dec * sin_lambda);
    (d_ra, d_dec)
}
