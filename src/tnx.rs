//! TNX (TAN + polynomial distortion) WCS projection and fitter (§4.2).
//!
//! A [`TnxModel`] maps image pixels to sky coordinates and back: subtract the
//! reference pixel, add a per-axis polynomial distortion term, apply the `CD`
//! matrix, then project through (or against) the tangent plane. [`fit_tnx`]
//! derives a model from a list of matched `(x, y, ra, dec)` samples, grounded
//! on the original `ProjectTNX`/`WCSTNX` pair (itself a legacy duplication —
//! see `DESIGN.md`). Every least-squares solve here routes through
//! [`crate::support::linalg::solve_normal_equations`]; there is no second
//! fitting routine.

use crate::error::Error;
use crate::support::linalg::solve_normal_equations;
use crate::support::sphere::{angular_distance, wrap_2pi};

const MAX_FIT_ITERATIONS: usize = 5;
const MIN_RETAINED_FRACTION: f64 = 0.6;
const ERRFIT_FLOOR_ARCSEC: f64 = 0.05;
const INVERSE_MAX_ITERATIONS: usize = 10;
const INVERSE_TOLERANCE_PIX: f64 = 1.0e-3;

//tp Basis
/// A polynomial basis family for the distortion surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    /// Plain powers of the (unnormalized) coordinate.
    Power,
    Legendre,
    Chebyshev,
}

//tp CrossTerm
/// How the per-axis basis functions combine into a 2-D surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossTerm {
    /// `i == 0` or `j == 0` only: `xorder + yorder - 1` terms.
    None,
    /// Every `(i, j)` pair: `xorder * yorder` terms.
    Full,
    /// Triangular subset `i + j < max(xorder, yorder)`.
    Half,
}

//fp basis_values
/// Evaluate a basis family up to `order` terms at `value`.
///
/// Chebyshev and Legendre evaluate the normalized variable
/// `n(v) = ((max+min) - 2v) / (max-min)`; `Power` uses `value` directly.
fn basis_values(basis: Basis, value: f64, min: f64, max: f64, order: usize) -> Vec<f64> {
    let mut v = vec![0.0f64; order];
    if order == 0 {
        return v;
    }
    v[0] = 1.0;
    match basis {
        Basis::Power => {
            for i in 1..order {
                v[i] = value * v[i - 1];
            }
        }
        Basis::Legendre => {
            let norm = ((max + min) - 2.0 * value) / (max - min);
            if order > 1 {
                v[1] = norm;
            }
            for i in 2..order {
                let fi = i as f64;
                v[i] = ((2.0 * fi - 1.0) * norm * v[i - 1] - (fi - 1.0) * v[i - 2]) / fi;
            }
        }
        Basis::Chebyshev => {
            let norm = ((max + min) - 2.0 * value) / (max - min);
            if order > 1 {
                v[1] = norm;
            }
            for i in 2..order {
                v[i] = 2.0 * norm * v[i - 1] - v[i - 2];
            }
        }
    }
    v
}

//fp term_pairs
/// Enumerate the `(i, j)` basis-index pairs a surface sums over.
fn term_pairs(xorder: usize, yorder: usize, cross_term: CrossTerm) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    match cross_term {
        CrossTerm::None => {
            for i in 0..xorder {
                pairs.push((i, 0));
            }
            for j in 1..yorder {
                pairs.push((0, j));
            }
        }
        CrossTerm::Full => {
            for j in 0..yorder {
                for i in 0..xorder {
                    pairs.push((i, j));
                }
            }
        }
        CrossTerm::Half => {
            let limit = xorder.max(yorder);
            for j in 0..yorder {
                for i in 0..xorder {
                    if i + j < limit {
                        pairs.push((i, j));
                    }
                }
            }
        }
    }
    pairs
}

//fp term_vector
fn term_vector(
    basis: Basis,
    cross_term: CrossTerm,
    xorder: usize,
    yorder: usize,
    xmin: f64,
    xmax: f64,
    ymin: f64,
    ymax: f64,
    x: f64,
    y: f64,
) -> Vec<f64> {
    let xv = basis_values(basis, x, xmin, xmax, xorder);
    let yv = basis_values(basis, y, ymin, ymax, yorder);
    term_pairs(xorder, yorder, cross_term)
        .into_iter()
        .map(|(i, j)| xv[i] * yv[j])
        .collect()
}

//tp PolySurface
/// One axis of the distortion model: a tagged basis variant plus its fitted
/// coefficients, evaluated in arcseconds.
#[derive(Debug, Clone)]
pub struct PolySurface {
    pub basis: Basis,
    pub cross_term: CrossTerm,
    pub xorder: usize,
    pub yorder: usize,
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    pub coef: Vec<f64>,
}

impl PolySurface {
    pub fn term_count(&self) -> usize {
        term_pairs(self.xorder, self.yorder, self.cross_term).len()
    }

    pub fn term_vector(&self, x: f64, y: f64) -> Vec<f64> {
        term_vector(
            self.basis,
            self.cross_term,
            self.xorder,
            self.yorder,
            self.xmin,
            self.xmax,
            self.ymin,
            self.ymax,
            x,
            y,
        )
    }

    /// Distortion at `(x, y)`, in arcseconds.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        self.term_vector(x, y)
            .iter()
            .zip(self.coef.iter())
            .map(|(t, c)| t * c)
            .sum()
    }
}

//tp TnxModel
/// A fitted TAN-plus-distortion WCS: reference pixel, reference sky position,
/// CD matrix (degrees/pixel) and its inverse, and one [`PolySurface`] per axis.
#[derive(Debug, Clone)]
pub struct TnxModel {
    pub x_ref: f64,
    pub y_ref: f64,
    /// Reference sky position, radians.
    pub ra_ref: f64,
    pub dec_ref: f64,
    pub cd: [[f64; 2]; 2],
    pub cd_inv: [[f64; 2]; 2],
    pub res: [PolySurface; 2],
    pub errfit_arcsec: f64,
}

impl TnxModel {
    /// `3600 * sqrt(|det CD|)`, arcsec/pixel.
    pub fn scale_arcsec_per_pixel(&self) -> f64 {
        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        3600.0 * det.abs().sqrt()
    }

    /// `atan2(CD[0][1], CD[0][0])`, degrees.
    pub fn rotation_deg(&self) -> f64 {
        self.cd[0][1].atan2(self.cd[0][0]).to_degrees()
    }

    /// Project an image pixel to `(ra_deg, dec_deg)`, J2000.
    pub fn image_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x - self.x_ref;
        let dy = y - self.y_ref;
        let xi_deg = self.cd[0][0] * dx + self.cd[0][1] * dy;
        let eta_deg = self.cd[1][0] * dx + self.cd[1][1] * dy;
        let dxi = (self.res[0].eval(x, y) / 3600.0).to_radians();
        let deta = (self.res[1].eval(x, y) / 3600.0).to_radians();
        let xi = xi_deg.to_radians() + dxi;
        let eta = eta_deg.to_radians() + deta;

        let fract = self.dec_ref.cos() - eta * self.dec_ref.sin();
        let dra = xi.atan2(fract);
        let ra = wrap_2pi(self.ra_ref + dra);
        let dec = ((eta * self.dec_ref.cos() + self.dec_ref.sin()) * dra.cos() / fract).atan();
        (ra.to_degrees(), dec.to_degrees())
    }

    /// Invert [`Self::image_to_sky`] by forward TAN projection plus `CD⁻¹`,
    /// iteratively subtracting the distortion term (≤10 iterations, `1e-3`
    /// pixel convergence).
    pub fn sky_to_image(&self, ra_deg: f64, dec_deg: f64) -> (f64, f64) {
        let ra = ra_deg.to_radians();
        let dec = dec_deg.to_radians();
        let dra = ra - self.ra_ref;
        let fract = self.dec_ref.sin() * dec.sin() + self.dec_ref.cos() * dec.cos() * dra.cos();
        let xi = dec.cos() * dra.sin() / fract;
        let eta =
            (self.dec_ref.cos() * dec.sin() - self.dec_ref.sin() * dec.cos() * dra.cos()) / fract;

        let project = |xi: f64, eta: f64| -> (f64, f64) {
            let xi_deg = xi.to_degrees();
            let eta_deg = eta.to_degrees();
            let x = self.x_ref + self.cd_inv[0][0] * xi_deg + self.cd_inv[0][1] * eta_deg;
            let y = self.y_ref + self.cd_inv[1][0] * xi_deg + self.cd_inv[1][1] * eta_deg;
            (x, y)
        };

        let (mut x, mut y) = project(xi, eta);
        for _ in 0..INVERSE_MAX_ITERATIONS {
            let dxi = (self.res[0].eval(x, y) / 3600.0).to_radians();
            let deta = (self.res[1].eval(x, y) / 3600.0).to_radians();
            let (nx, ny) = project(xi - dxi, eta - deta);
            let converged = (nx - x).abs() + (ny - y).abs() < INVERSE_TOLERANCE_PIX;
            x = nx;
            y = ny;
            if converged {
                break;
            }
        }
        (x, y)
    }
}

//tp MatchedSample
/// One `(image pixel, catalog sky position)` correspondence used to fit a [`TnxModel`].
#[derive(Debug, Clone, Copy)]
pub struct MatchedSample {
    pub x: f64,
    pub y: f64,
    pub ra_deg: f64,
    pub dec_deg: f64,
}

//tp TnxFitConfig
/// Fixed choices for a fit: basis family, cross-term rule, polynomial orders,
/// the pixel normalization box, and an optional caller-supplied reference pixel.
#[derive(Debug, Clone, Copy)]
pub struct TnxFitConfig {
    pub basis: Basis,
    pub cross_term: CrossTerm,
    pub xorder: usize,
    pub yorder: usize,
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    pub ref_pixel: Option<(f64, f64)>,
}

//fp invert2x2
fn invert2x2(m: [[f64; 2]; 2]) -> Result<[[f64; 2]; 2], Error> {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if det.abs() < 1.0e-20 {
        return Err(Error::ModelFitFailed("singular CD matrix".into()));
    }
    Ok([
        [m[1][1] / det, -m[0][1] / det],
        [-m[1][0] / det, m[0][0] / det],
    ])
}

//fp tangent_plane
/// Forward TAN projection of `(ra, dec)` (radians) about `(ra_ref, dec_ref)`,
/// returning `(xi, eta)` in radians.
fn tangent_plane(ra: f64, dec: f64, ra_ref: f64, dec_ref: f64) -> (f64, f64) {
    let dra = ra - ra_ref;
    let fract = dec_ref.sin() * dec.sin() + dec_ref.cos() * dec.cos() * dra.cos();
    let xi = dec.cos() * dra.sin() / fract;
    let eta = (dec_ref.cos() * dec.sin() - dec_ref.sin() * dec.cos() * dra.cos()) / fract;
    (xi, eta)
}

//fp fit_once
/// Steps 2-4 of the fitting algorithm: fit `CD` by linear least squares, fit
/// the two distortion surfaces against the CD residuals, then compute the
/// per-sample total angular residual and its RMS (`errfit`).
fn fit_once(
    samples: &[MatchedSample],
    x_ref: f64,
    y_ref: f64,
    ra_ref: f64,
    dec_ref: f64,
    cfg: &TnxFitConfig,
) -> Result<(TnxModel, Vec<f64>, f64), Error> {
    let m = samples.len();

    let mut basis_cd = vec![0.0f64; 2 * m];
    let mut y_xi_deg = vec![0.0f64; m];
    let mut y_eta_deg = vec![0.0f64; m];
    for (k, s) in samples.iter().enumerate() {
        basis_cd[k] = s.x - x_ref;
        basis_cd[m + k] = s.y - y_ref;
        let (xi, eta) = tangent_plane(s.ra_deg.to_radians(), s.dec_deg.to_radians(), ra_ref, dec_ref);
        y_xi_deg[k] = xi.to_degrees();
        y_eta_deg[k] = eta.to_degrees();
    }
    let cd_row0 = solve_normal_equations(m, 2, &basis_cd, &y_xi_deg)?;
    let cd_row1 = solve_normal_equations(m, 2, &basis_cd, &y_eta_deg)?;
    let cd = [[cd_row0[0], cd_row0[1]], [cd_row1[0], cd_row1[1]]];
    let cd_inv = invert2x2(cd)?;

    let term_count = term_pairs(cfg.xorder, cfg.yorder, cfg.cross_term).len();
    let mut basis_poly = vec![0.0f64; term_count * m];
    let mut resid_xi_as = vec![0.0f64; m];
    let mut resid_eta_as = vec![0.0f64; m];
    for (k, s) in samples.iter().enumerate() {
        let dx = s.x - x_ref;
        let dy = s.y - y_ref;
        let xi_fit_deg = cd[0][0] * dx + cd[0][1] * dy;
        let eta_fit_deg = cd[1][0] * dx + cd[1][1] * dy;
        resid_xi_as[k] = (y_xi_deg[k] - xi_fit_deg) * 3600.0;
        resid_eta_as[k] = (y_eta_deg[k] - eta_fit_deg) * 3600.0;

        let terms = term_vector(
            cfg.basis, cfg.cross_term, cfg.xorder, cfg.yorder, cfg.xmin, cfg.xmax, cfg.ymin,
            cfg.ymax, s.x, s.y,
        );
        for (t, v) in terms.into_iter().enumerate() {
            basis_poly[t * m + k] = v;
        }
    }
    let coef0 = solve_normal_equations(m, term_count, &basis_poly, &resid_xi_as)?;
    let coef1 = solve_normal_equations(m, term_count, &basis_poly, &resid_eta_as)?;

    let make_surface = |coef: Vec<f64>| PolySurface {
        basis: cfg.basis,
        cross_term: cfg.cross_term,
        xorder: cfg.xorder,
        yorder: cfg.yorder,
        xmin: cfg.xmin,
        xmax: cfg.xmax,
        ymin: cfg.ymin,
        ymax: cfg.ymax,
        coef,
    };
    let model = TnxModel {
        x_ref,
        y_ref,
        ra_ref,
        dec_ref,
        cd,
        cd_inv,
        res: [make_surface(coef0), make_surface(coef1)],
        errfit_arcsec: 0.0,
    };

    let mut residuals = vec![0.0f64; m];
    let mut sum_sq = 0.0f64;
    for (k, s) in samples.iter().enumerate() {
        let (ra_fit, dec_fit) = model.image_to_sky(s.x, s.y);
        let d = angular_distance(
            s.ra_deg.to_radians(),
            s.dec_deg.to_radians(),
            ra_fit.to_radians(),
            dec_fit.to_radians(),
        );
        let arcsec = d.to_degrees() * 3600.0;
        residuals[k] = arcsec;
        sum_sq += arcsec * arcsec;
    }
    let errfit = (sum_sq / m as f64).sqrt();
    Ok((model, residuals, errfit))
}

//fp fit_tnx
/// Fit a [`TnxModel`] from matched `(x, y, ra, dec)` samples (§4.2).
///
/// Fails if there are fewer samples than polynomial terms, if the CD normal
/// matrix is singular, or if 3-sigma clipping drops the retained sample count
/// below the term count.
pub fn fit_tnx(samples: &[MatchedSample], cfg: &TnxFitConfig) -> Result<TnxModel, Error> {
    let term_count = term_pairs(cfg.xorder, cfg.yorder, cfg.cross_term).len();
    let min_samples = term_count.max(2);
    if samples.len() < min_samples {
        return Err(Error::ModelFitFailed(format!(
            "{} matched samples is fewer than {min_samples} required terms",
            samples.len()
        )));
    }

    let explicit_in_box = cfg
        .ref_pixel
        .map(|(x, y)| x >= cfg.xmin && x <= cfg.xmax && y >= cfg.ymin && y <= cfg.ymax)
        .unwrap_or(false);
    let (x_ref, y_ref) = match cfg.ref_pixel {
        Some((x, y)) if explicit_in_box => (x, y),
        _ => ((cfg.xmin + cfg.xmax) / 2.0, (cfg.ymin + cfg.ymax) / 2.0),
    };

    let mut nearest = &samples[0];
    let mut best_d = (nearest.x - x_ref).abs() + (nearest.y - y_ref).abs();
    for s in &samples[1..] {
        let d = (s.x - x_ref).abs() + (s.y - y_ref).abs();
        if d < best_d {
            nearest = s;
            best_d = d;
        }
    }
    let mut ra_ref = nearest.ra_deg.to_radians();
    let mut dec_ref = nearest.dec_deg.to_radians();

    let mut active = samples.to_vec();
    let original_count = active.len();
    let (mut model, mut residuals, mut errfit) =
        fit_once(&active, x_ref, y_ref, ra_ref, dec_ref, cfg)?;

    for _ in 0..MAX_FIT_ITERATIONS {
        let threshold = 3.0 * errfit;
        let kept: Vec<MatchedSample> = active
            .iter()
            .cloned()
            .zip(residuals.iter())
            .filter(|(_, r)| r.abs() <= threshold)
            .map(|(s, _)| s)
            .collect();
        if kept.len() == active.len() {
            break;
        }
        if kept.len() < min_samples {
            return Err(Error::ModelFitFailed(
                "fewer samples than basis terms after clipping".into(),
            ));
        }
        active = kept;
        let (m2, r2, ef2) = fit_once(&active, x_ref, y_ref, ra_ref, dec_ref, cfg)?;
        model = m2;
        residuals = r2;
        errfit = ef2;
        if errfit < ERRFIT_FLOOR_ARCSEC
            || (active.len() as f64) < MIN_RETAINED_FRACTION * (original_count as f64)
        {
            break;
        }
    }

    if explicit_in_box {
        let (ra_exact, dec_exact) = model.image_to_sky(x_ref, y_ref);
        ra_ref = ra_exact.to_radians();
        dec_ref = dec_exact.to_radians();
        let (m3, _, ef3) = fit_once(&active, x_ref, y_ref, ra_ref, dec_ref, cfg)?;
        model = m3;
        errfit = ef3;
    }

    model.errfit_arcsec = errfit;
    Ok(model)
}

//a Tests
#[cfg(test)]
mod tests {
    use super::*;

    fn no_distortion_config(xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> TnxFitConfig {
        TnxFitConfig {
            basis: Basis::Power,
            cross_term: CrossTerm::None,
            xorder: 1,
            yorder: 1,
            xmin,
            xmax,
            ymin,
            ymax,
            ref_pixel: None,
        }
    }

    fn synthetic_grid(scale_arcsec_per_pix: f64, rotation_deg: f64) -> Vec<MatchedSample> {
        let ra0 = 180.0f64.to_radians();
        let dec0 = 0.0f64.to_radians();
        let theta = rotation_deg.to_radians();
        let s = scale_arcsec_per_pix / 3600.0;
        let cd = [[s * theta.cos(), -s * theta.sin()], [s * theta.sin(), s * theta.cos()]];

        let mut samples = Vec::new();
        for dxi in [-200.0, -100.0, 0.0, 100.0, 200.0] {
            for dyi in [-200.0, -100.0, 0.0, 100.0, 200.0] {
                let x = 512.0 + dxi;
                let y = 512.0 + dyi;
                let xi_deg = cd[0][0] * dxi + cd[0][1] * dyi;
                let eta_deg = cd[1][0] * dxi + cd[1][1] * dyi;
                let xi = xi_deg.to_radians();
                let eta = eta_deg.to_radians();
                let fract = dec0.cos() - eta * dec0.sin();
                let dra = xi.atan2(fract);
                let ra = ra0 + dra;
                let dec = ((eta * dec0.cos() + dec0.sin()) * dra.cos() / fract).atan();
                samples.push(MatchedSample {
                    x,
                    y,
                    ra_deg: ra.to_degrees(),
                    dec_deg: dec.to_degrees(),
                });
            }
        }
        samples
    }

    #[test]
    fn fits_scale_and_rotation_with_no_distortion() {
        let samples = synthetic_grid(8.4, 30.0);
        let cfg = no_distortion_config(312.0, 712.0, 312.0, 712.0);
        let model = fit_tnx(&samples, &cfg).expect("well-conditioned grid should fit");
        assert!((model.scale_arcsec_per_pixel() - 8.4).abs() < 1.0e-3);
        assert!((model.rotation_deg() - 30.0).abs() < 1.0e-2);
        assert!(model.errfit_arcsec < 0.05);
    }

    #[test]
    fn image_to_sky_round_trips_through_sky_to_image() {
        let samples = synthetic_grid(8.4, 30.0);
        let cfg = no_distortion_config(312.0, 712.0, 312.0, 712.0);
        let model = fit_tnx(&samples, &cfg).unwrap();
        let (ra, dec) = model.image_to_sky(560.0, 470.0);
        let (x, y) = model.sky_to_image(ra, dec);
        assert!((x - 560.0).abs() < 1.0e-3);
        assert!((y - 470.0).abs() < 1.0e-3);
    }

    #[test]
    fn rejects_colinear_samples_as_singular() {
        let cfg = no_distortion_config(0.0, 400.0, 0.0, 400.0);
        let samples = vec![
            MatchedSample { x: 100.0, y: 200.0, ra_deg: 180.0, dec_deg: 0.0 },
            MatchedSample { x: 200.0, y: 200.0, ra_deg: 180.01, dec_deg: 0.0 },
            MatchedSample { x: 300.0, y: 200.0, ra_deg: 180.02, dec_deg: 0.0 },
        ];
        assert!(fit_tnx(&samples, &cfg).is_err());
    }

    #[test]
    fn rejects_too_few_samples() {
        let cfg = TnxFitConfig {
            basis: Basis::Power,
            cross_term: CrossTerm::Full,
            xorder: 3,
            yorder: 3,
            xmin: 0.0,
            xmax: 1024.0,
            ymin: 0.0,
            ymax: 1024.0,
            ref_pixel: None,
        };
        let samples = vec![
            MatchedSample { x: 10.0, y: 10.0, ra_deg: 180.0, dec_deg: 0.0 },
            MatchedSample { x: 20.0, y: 20.0, ra_deg: 180.01, dec_deg: 0.0 },
        ];
        assert!(fit_tnx(&samples, &cfg).is_err());
    }

    #[test]
    fn term_pairs_counts_match_spec_formulas() {
        assert_eq!(term_pairs(3, 4, CrossTerm::None).len(), 3 + 4 - 1);
        assert_eq!(term_pairs(3, 4, CrossTerm::Full).len(), 3 * 4);
        assert!(term_pairs(3, 4, CrossTerm::Half).len() < 3 * 4);
    }
}
