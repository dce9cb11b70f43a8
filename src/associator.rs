//! The moving-target associator (§4.4): a streaming multi-hypothesis tracker
//! that consumes solved frames in arrival order, maintains a set of open
//! candidate tracks across the last few frames, and finalizes those candidates
//! whose length and kinematics survive two noise filters.
//!
//! Candidates and tracks share points through [`PvPoint`], reference-counted
//! so that `related` (how many candidates currently hold a point as confirmed)
//! can be tracked explicitly rather than inferred from `Rc` strong counts --
//! the count is a property of *confirmed* membership, not of every clone in
//! flight during a single frame's bookkeeping.

use std::cell::Cell;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, warn};

use crate::error::Error;
use crate::frame::Frame;
use crate::support::sphere::wrap_pi;
use crate::support::time::annual_aberration;

/// How many frames a candidate may go unextended before it is closed (§4.4 Recheck).
const MAX_FRAME_GAP: i64 = 5;
/// Minimum confirmed-point count for a candidate to become a [`Track`].
const MIN_TRACK_LENGTH: usize = 5;
/// Pairing window (pixels, both axes) when creating new candidates.
const PAIRING_WINDOW_PIX: f64 = 100.0;
/// Predicted-position tolerance (pixels, both axes) for extending a Transit candidate.
const TRANSIT_TOLERANCE_PIX: f64 = 2.0;
/// Pixel-coincidence tolerance for the Stare fallback test in `classify`.
const STARE_PIXEL_TOLERANCE: f64 = 2.0;
/// Sidereal rotation rate used for the stellar-filter rejection, arcsec/sec.
const SIDEREAL_RATE_ARCSEC_PER_SEC: f64 = 15.04108;

//tp RollingShutter
/// Per-row readout timing used to correct a finalized track point's UTC.
/// Hard-coded in the original pipeline; exposed here as configuration so a
/// future per-camera value is a non-breaking addition (§9 Open Questions).
#[derive(Debug, Clone, Copy)]
pub struct RollingShutter {
    pub read_time_ms: f64,
    pub lines: u32,
}

impl Default for RollingShutter {
    fn default() -> Self {
        Self {
            read_time_ms: 125.0,
            lines: 4096,
        }
    }
}

impl RollingShutter {
    /// Row readout delay at image row `y`, in days (for adding to an MJD).
    fn row_delay_days(&self, y: f64) -> f64 {
        let ms = (self.read_time_ms / self.lines as f64) * y;
        ms / 1000.0 / 86400.0
    }
}

//tp PvPoint
/// One measurement intended to be chained into a track.
#[derive(Debug)]
pub struct PvPoint {
    pub file: String,
    pub mid_utc_mjd: f64,
    pub frame_no: i64,
    pub source_id: u64,
    pub x: f64,
    pub y: f64,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub mag: f64,
    /// Unique within one associator instance; used to dedup point claims
    /// across candidates within a single `end_frame` pass.
    point_id: u64,
    /// How many candidates currently hold this point in their confirmed list.
    related: Cell<u32>,
}

impl PvPoint {
    pub fn related(&self) -> u32 {
        self.related.get()
    }

    fn mark_related(&self) {
        self.related.set(self.related.get() + 1);
    }

    fn unmark_related(&self) {
        self.related.set(self.related.get().saturating_sub(1));
    }
}

//tp Mode
/// A candidate's motion classification, established at creation and never
/// changed thereafter (§4.4 Classify / Add point).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Init,
    Stare,
    Transit,
}

//tp Candidate
/// An open track hypothesis.
#[derive(Debug)]
pub struct Candidate {
    pub pts: Vec<Rc<PvPoint>>,
    frmu: Vec<Rc<PvPoint>>,
    pub mode: Mode,
    /// Pixels/day, Transit mode only.
    pub velocity: Option<(f64, f64)>,
}

impl Candidate {
    fn last(&self) -> &Rc<PvPoint> {
        self.pts.last().expect("a candidate always has at least one confirmed point")
    }
}

//tp Track
/// A finalized candidate: at least [`MIN_TRACK_LENGTH`] confirmed points that
/// survived the noise and stellar filters.
#[derive(Debug)]
pub struct Track {
    pub id: u64,
    pub pts: Vec<Rc<PvPoint>>,
}

//fp classify
/// Classify the motion between two consecutive points (§4.4 Classify).
///
/// A pair coincides with a star at the diurnal rate (near-zero sky motion
/// over the elapsed time) or coincides in pixel space (a tracking mount
/// holding a star fixed on the CCD) is `Stare`; anything else is `Transit`.
fn classify(p1: &PvPoint, p2: &PvPoint) -> Mode {
    let dt_sec = (p2.mid_utc_mjd - p1.mid_utc_mjd) * 86400.0;
    let limit_arcsec = 10.0 * dt_sec.abs();

    let mut dra_deg = p2.ra_deg - p1.ra_deg;
    if dra_deg.abs() > 180.0 {
        dra_deg -= 360.0 * dra_deg.signum();
    }
    let ddec_deg = p2.dec_deg - p1.dec_deg;
    let dra_arcsec = dra_deg * 3600.0;
    let ddec_arcsec = ddec_deg * 3600.0;

    if dra_arcsec.abs() < limit_arcsec && ddec_arcsec.abs() < limit_arcsec {
        return Mode::Stare;
    }
    if (p2.x - p1.x).abs() <= STARE_PIXEL_TOLERANCE && (p2.y - p1.y).abs() <= STARE_PIXEL_TOLERANCE {
        return Mode::Stare;
    }
    Mode::Transit
}

//fp velocity_pix_per_day
fn velocity_pix_per_day(p1: &PvPoint, p2: &PvPoint) -> (f64, f64) {
    let dt_days = p2.mid_utc_mjd - p1.mid_utc_mjd;
    if dt_days.abs() < f64::EPSILON {
        return (0.0, 0.0);
    }
    ((p2.x - p1.x) / dt_days, (p2.y - p1.y) / dt_days)
}

//fp predicted_position
fn predicted_position(candidate: &Candidate, dt_days: f64) -> (f64, f64) {
    let last = candidate.last();
    match (candidate.mode, candidate.velocity) {
        (Mode::Transit, Some((vx, vy))) => (last.x + vx * dt_days, last.y + vy * dt_days),
        _ => (last.x, last.y),
    }
}

//fp try_add_point
/// §4.4 Add point: accept `p` into `candidate.frmu` if its motion mode
/// matches the candidate's established mode and (for Transit) it falls
/// within the predicted-position window.
fn try_add_point(candidate: &mut Candidate, p: Rc<PvPoint>) -> bool {
    let mode = classify(candidate.last(), &p);
    if mode != candidate.mode {
        return false;
    }
    if candidate.mode == Mode::Transit {
        let dt_days = p.mid_utc_mjd - candidate.last().mid_utc_mjd;
        let (px, py) = predicted_position(candidate, dt_days);
        if (px - p.x).abs() > TRANSIT_TOLERANCE_PIX || (py - p.y).abs() > TRANSIT_TOLERANCE_PIX {
            return false;
        }
    }
    p.mark_related();
    candidate.frmu.push(p);
    true
}

//fp pixel_spread_is_small
/// Per-step pixel spread of adjacent points: true if both axes' max-min
/// delta stays within 3 pixels, the gate that picks which of the two
/// finalize filters below applies (§4.4 Finalize).
fn pixel_spread_is_small(pts: &[Rc<PvPoint>]) -> bool {
    let mut dx_max = f64::MIN;
    let mut dx_min = f64::MAX;
    let mut dy_max = f64::MIN;
    let mut dy_min = f64::MAX;
    for w in pts.windows(2) {
        let dx = w[1].x - w[0].x;
        let dy = w[1].y - w[0].y;
        dx_max = dx_max.max(dx);
        dx_min = dx_min.min(dx);
        dy_max = dy_max.max(dy);
        dy_min = dy_min.min(dy);
    }
    dx_max - dx_min <= 3.0 && dy_max - dy_min <= 3.0
}

//fp noise_filter_rejects
/// §4.4 Finalize, small-spread branch: with adjacent steps already within 3
/// pixels on both axes, reject on endpoint pixel delta alone, each axis
/// tested independently.
fn noise_filter_rejects(pts: &[Rc<PvPoint>]) -> bool {
    let first = &pts[0];
    let last = pts.last().unwrap();
    (last.x - first.x).abs() <= 3.0 && (last.y - first.y).abs() <= 3.0
}

//fp stellar_filter_rejects
/// §4.4 Finalize, large-spread branch: reject a candidate whose endpoint sky
/// motion is indistinguishable from Earth's rotation carrying a fixed star
/// across the frame (a star the upstream photometric match missed).
fn stellar_filter_rejects(pts: &[Rc<PvPoint>]) -> bool {
    let first = &pts[0];
    let last = pts.last().unwrap();
    let mut dra_deg = (last.ra_deg - first.ra_deg).abs();
    if dra_deg > 180.0 {
        dra_deg = 360.0 - dra_deg;
    }
    let dra_arcsec = dra_deg * 3600.0;
    let ddec_arcsec = (last.dec_deg - first.dec_deg).abs() * 3600.0;
    let dt_sec = (last.mid_utc_mjd - first.mid_utc_mjd) * 86400.0;
    let dt_rate_arcsec = dt_sec.abs() * SIDEREAL_RATE_ARCSEC_PER_SEC;
    ddec_arcsec < 10.0 && dra_arcsec < dt_rate_arcsec
}

//fp finalize_filter_rejects
/// §4.4 Finalize: the noise filter and the stellar filter are not
/// independent checks -- a candidate whose per-step pixel spread is small is
/// judged on endpoint pixel delta alone and never reaches the stellar test;
/// only a candidate with real pixel motion is checked against the sidereal
/// drift budget.
fn finalize_filter_rejects(pts: &[Rc<PvPoint>]) -> bool {
    if pixel_spread_is_small(pts) {
        noise_filter_rejects(pts)
    } else {
        stellar_filter_rejects(pts)
    }
}

struct FrameAccum {
    frame_no: i64,
    pts: Vec<Rc<PvPoint>>,
}

impl FrameAccum {
    fn empty(frame_no: i64) -> Self {
        Self {
            frame_no,
            pts: Vec::new(),
        }
    }
}

//tp Associator
/// Per-pointing candidate/track state machine. Owns exactly two frames'
/// worth of unclaimed points (`prev_frame`, `cur_frame`) and the open
/// candidate list; every method call assumes single-threaded, in-order use
/// from one dispatch thread (§5).
pub struct Associator {
    prev_frame: FrameAccum,
    cur_frame: FrameAccum,
    cur_frame_no: Option<i64>,
    candidates: Vec<Candidate>,
    next_point_id: u64,
    next_track_id: u64,
    rolling_shutter: RollingShutter,
    output_root: PathBuf,
}

impl Associator {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            prev_frame: FrameAccum::empty(0),
            cur_frame: FrameAccum::empty(0),
            cur_frame_no: None,
            candidates: Vec::new(),
            next_point_id: 1,
            next_track_id: 1,
            rolling_shutter: RollingShutter::default(),
            output_root: output_root.into(),
        }
    }

    pub fn with_rolling_shutter(mut self, rs: RollingShutter) -> Self {
        self.rolling_shutter = rs;
        self
    }

    /// Process one solved frame, advancing candidate state and returning
    /// every track finalized as a side effect of this call (either the
    /// ordinary per-frame recheck, or, if `frame.frame_no` dropped relative
    /// to the previous call, the boundary finalization of the prior
    /// sequence) (§4.4).
    pub fn ingest_frame(&mut self, frame: &Frame) -> Vec<Track> {
        let mut finalized = Vec::new();
        let fno = frame.frame_no;

        if let Some(prev_fno) = self.cur_frame_no {
            if fno < prev_fno {
                debug!("frame_no dropped from {prev_fno} to {fno}: starting a new sequence");
                finalized.extend(self.finalize_all_open());
                self.candidates.clear();
                self.prev_frame = FrameAccum::empty(fno);
                self.cur_frame = FrameAccum::empty(fno);
                self.cur_frame_no = None;
            }
        }

        self.new_frame(fno);
        let mjd = frame.mid_exposure().to_mjd_utc_days();
        let file_name = frame
            .path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| frame.path.display().to_string());

        for source in frame.sources.iter().filter(|s| !s.matched) {
            let (Some(ra), Some(dec)) = (source.ra_deg, source.dec_deg) else {
                continue;
            };
            let (d_ra, d_dec) = annual_aberration(mjd, ra.to_radians(), dec.to_radians());
            let ra_app = wrap_pi(ra.to_radians() + d_ra).to_degrees();
            let dec_app = (dec.to_radians() + d_dec).to_degrees();

            let point_id = self.next_point_id;
            self.next_point_id += 1;
            self.cur_frame.pts.push(Rc::new(PvPoint {
                file: file_name.clone(),
                mid_utc_mjd: mjd,
                frame_no: fno,
                source_id: source.id,
                x: source.x,
                y: source.y,
                ra_deg: ra_app,
                dec_deg: dec_app,
                mag: source.mag_instr,
                point_id,
                related: Cell::new(0),
            }));
        }

        finalized.extend(self.end_frame());
        finalized
    }

    fn new_frame(&mut self, fno: i64) {
        let old_cur = std::mem::replace(&mut self.cur_frame, FrameAccum::empty(fno));
        self.prev_frame = old_cur;
        self.cur_frame_no = Some(fno);
    }

    /// §4.4 end_frame: recheck, append, update, create, then prune weak
    /// just-created candidates.
    fn end_frame(&mut self) -> Vec<Track> {
        let fno = self.cur_frame.frame_no;
        let mut finalized = Vec::new();

        // a. Recheck
        let mut kept = Vec::with_capacity(self.candidates.len());
        for candidate in self.candidates.drain(..) {
            if fno - candidate.last().frame_no > MAX_FRAME_GAP {
                if let Some(track) = self.close_candidate(candidate) {
                    finalized.push(track);
                }
            } else {
                kept.push(candidate);
            }
        }
        self.candidates = kept;

        // b. Append
        for candidate in &mut self.candidates {
            for p in &self.cur_frame.pts {
                try_add_point(candidate, Rc::clone(p));
            }
        }

        // c. Update, with cross-candidate dedup so a point confirms into at
        // most one candidate's list this frame (§8 `related` invariant).
        let mut claimed_this_frame: HashSet<u64> = HashSet::new();
        for candidate in &mut self.candidates {
            if candidate.frmu.is_empty() {
                continue;
            }
            let last_mjd = candidate.last().mid_utc_mjd;
            let mut best: Option<usize> = None;
            let mut best_d2 = f64::MAX;
            for (i, p) in candidate.frmu.iter().enumerate() {
                if claimed_this_frame.contains(&p.point_id) {
                    continue;
                }
                let dt_days = p.mid_utc_mjd - last_mjd;
                let (px, py) = predicted_position(candidate, dt_days);
                let d2 = (p.x - px).powi(2) + (p.y - py).powi(2);
                if d2 < best_d2 {
                    best_d2 = d2;
                    best = Some(i);
                }
            }
            let frmu = std::mem::take(&mut candidate.frmu);
            for (i, p) in frmu.into_iter().enumerate() {
                if Some(i) == best {
                    claimed_this_frame.insert(p.point_id);
                    if candidate.mode == Mode::Transit {
                        candidate.velocity = Some(velocity_pix_per_day(candidate.last(), &p));
                    }
                    candidate.pts.push(p);
                } else {
                    p.unmark_related();
                }
            }
        }

        // e. Drop weak 2-point candidates: any Transit candidate that has
        // just had its one chance (the append/update above) to extend past
        // its initial pair and failed is a chance pairing, not a track in
        // the making. A brand-new candidate is only added by step (d) below
        // -- after this check -- so it always survives to get that one
        // chance on the following frame before being judged here.
        let mut kept = Vec::with_capacity(self.candidates.len());
        for candidate in self.candidates.drain(..) {
            if candidate.mode != Mode::Stare && candidate.pts.len() <= 2 {
                for p in &candidate.pts {
                    p.unmark_related();
                }
            } else {
                kept.push(candidate);
            }
        }
        self.candidates = kept;

        // d. Create
        for p1 in &self.prev_frame.pts {
            if p1.related() > 0 {
                continue;
            }
            for p2 in &self.cur_frame.pts {
                if p2.related() > 0 {
                    continue;
                }
                if (p1.x - p2.x).abs() > PAIRING_WINDOW_PIX || (p1.y - p2.y).abs() > PAIRING_WINDOW_PIX {
                    continue;
                }
                let mode = classify(p1, p2);
                let velocity = match mode {
                    Mode::Transit => Some(velocity_pix_per_day(p1, p2)),
                    _ => None,
                };
                p1.mark_related();
                p2.mark_related();
                self.candidates.push(Candidate {
                    pts: vec![Rc::clone(p1), Rc::clone(p2)],
                    frmu: Vec::new(),
                    mode,
                    velocity,
                });
            }
        }

        finalized
    }

    /// Close every open candidate immediately, regardless of its last-seen
    /// gap. Callers typically invoke this once after the final frame of a
    /// run, since [`ingest_frame`](Self::ingest_frame) only closes
    /// candidates that have gone stale.
    pub fn finalize_all_open(&mut self) -> Vec<Track> {
        let candidates = std::mem::take(&mut self.candidates);
        candidates
            .into_iter()
            .filter_map(|c| self.close_candidate(c))
            .collect()
    }

    /// Release a candidate's hold on its confirmed points and, if it passes
    /// the length and finalize filters, turn it into a [`Track`] and persist
    /// its output files.
    fn close_candidate(&mut self, candidate: Candidate) -> Option<Track> {
        for p in &candidate.pts {
            p.unmark_related();
        }
        for p in &candidate.frmu {
            p.unmark_related();
        }
        if candidate.pts.len() < MIN_TRACK_LENGTH {
            return None;
        }
        if finalize_filter_rejects(&candidate.pts) {
            return None;
        }

        let id = self.next_track_id;
        self.next_track_id += 1;
        let pts: Vec<Rc<PvPoint>> = candidate
            .pts
            .into_iter()
            .map(|p| {
                Rc::new(PvPoint {
                    mid_utc_mjd: p.mid_utc_mjd + self.rolling_shutter.row_delay_days(p.y),
                    ..clone_point(&p)
                })
            })
            .collect();
        let track = Track { id, pts };
        if let Err(e) = write_track_outputs(&track, &self.output_root) {
            warn!("failed to write track {} output files: {e}", track.id);
        }
        Some(track)
    }
}

/// A `PvPoint` has no public constructor besides the struct literal inside
/// this module (its `related`/`point_id` bookkeeping must stay internal), so
/// finalization clones field-by-field rather than deriving `Clone`.
fn clone_point(p: &PvPoint) -> PvPoint {
    PvPoint {
        file: p.file.clone(),
        mid_utc_mjd: p.mid_utc_mjd,
        frame_no: p.frame_no,
        source_id: p.source_id,
        x: p.x,
        y: p.y,
        ra_deg: p.ra_deg,
        dec_deg: p.dec_deg,
        mag: p.mag,
        point_id: p.point_id,
        related: Cell::new(0),
    }
}

//fp format_ra_ddmmssss
/// RA as `DDDMMSSSS`: 3-digit degrees, 2-digit arcmin, 4-digit arcsec*100 (GTW §4.4).
fn format_ra_ddmmssss(ra_deg: f64) -> String {
    let ra = ra_deg.rem_euclid(360.0);
    let total_as = ra * 3600.0;
    let dd = (total_as / 3600.0).floor();
    let rem = total_as - dd * 3600.0;
    let mm = (rem / 60.0).floor();
    let ss_hundredths = ((rem - mm * 60.0) * 100.0).round();
    format!("{:03}{:02}{:04}", dd as i64, mm as i64, ss_hundredths as i64)
}

//fp format_dec_sddmmsss
/// Dec as `sDDMMSSS`: sign, 2-digit degrees, 2-digit arcmin, 3-digit arcsec*10.
fn format_dec_sddmmsss(dec_deg: f64) -> String {
    let sign = if dec_deg < 0.0 { '-' } else { '+' };
    let total_as = dec_deg.abs() * 3600.0;
    let dd = (total_as / 3600.0).floor();
    let rem = total_as - dd * 3600.0;
    let mm = (rem / 60.0).floor();
    let ss_tenths = ((rem - mm * 60.0) * 10.0).round();
    format!("{sign}{:02}{:02}{:03}", dd as i64, mm as i64, ss_tenths as i64)
}

//fp format_mag_smmm
/// Magnitude as `sMMM`: sign, 3-digit tenths of a magnitude.
fn format_mag_smmm(mag: f64) -> String {
    let sign = if mag < 0.0 { '-' } else { '+' };
    let tenths = (mag.abs() * 10.0).round() as i64;
    format!("{sign}{tenths:03}")
}

//fp yyyymmdd_of_point
fn yyyymmdd_of_point(p: &PvPoint) -> String {
    let epoch = hifitime::Epoch::from_mjd_utc(p.mid_utc_mjd);
    let (y, m, d, _, _, _, _) = epoch.to_gregorian_utc();
    format!("{y:04}{m:02}{d:02}")
}

//fp write_track_outputs
/// Persist the three per-track files (§4.4, §6): a `.obj` object list, a
/// `.txt` astrometry/photometry table, and a fixed-column GTW report.
fn write_track_outputs(track: &Track, output_root: &Path) -> Result<(), Error> {
    let yyyymmdd = yyyymmdd_of_point(&track.pts[0]);
    let dir = output_root.join(&yyyymmdd);
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

    let obj_path = dir.join(format!("{yyyymmdd}_{}.obj", track.id));
    let mut obj = std::fs::File::create(&obj_path).map_err(|e| Error::io(&obj_path, e))?;
    for p in &track.pts {
        writeln!(obj, "{} {} {}", track.id, p.file, p.source_id).map_err(|e| Error::io(&obj_path, e))?;
    }

    let txt_path = dir.join(format!("{yyyymmdd}_{}.txt", track.id));
    let mut txt = std::fs::File::create(&txt_path).map_err(|e| Error::io(&txt_path, e))?;
    for p in &track.pts {
        let epoch = hifitime::Epoch::from_mjd_utc(p.mid_utc_mjd);
        let (y, m, d, hh, mm, ss, ns) = epoch.to_gregorian_utc();
        let sec_frac = ss as f64 + ns as f64 / 1.0e9;
        let mag = if p.mag > 20.0 { 99.99 } else { p.mag };
        writeln!(
            txt,
            "{} {y:04} {m:02} {d:02} {hh:02} {mm:02} {sec_frac:06.3} {} {:.6} {:.6} {:.2} {:.3} {:.3}",
            p.file, p.frame_no, p.ra_deg, p.dec_deg, mag, p.x, p.y
        )
        .map_err(|e| Error::io(&txt_path, e))?;
    }

    let tstart = {
        let epoch = hifitime::Epoch::from_mjd_utc(track.pts[0].mid_utc_mjd);
        let (_, _, _, hh, mm, ss, _) = epoch.to_gregorian_utc();
        format!("{hh:02}{mm:02}{ss:02}")
    };
    let sid = 1 + (track.id - 1) % 999;
    let gtw_path = dir.join(format!("{yyyymmdd}_{tstart}_990{sid}_1690.GTW"));
    let mut gtw = std::fs::File::create(&gtw_path).map_err(|e| Error::io(&gtw_path, e))?;
    writeln!(gtw, "GTW REPORT").map_err(|e| Error::io(&gtw_path, e))?;
    writeln!(gtw, "TRACK {}", track.id).map_err(|e| Error::io(&gtw_path, e))?;
    writeln!(gtw, "DATE {yyyymmdd}").map_err(|e| Error::io(&gtw_path, e))?;
    writeln!(gtw, "POINTS {}", track.pts.len()).map_err(|e| Error::io(&gtw_path, e))?;
    for _ in 0..6 {
        writeln!(gtw).map_err(|e| Error::io(&gtw_path, e))?;
    }
    for p in &track.pts {
        let epoch = hifitime::Epoch::from_mjd_utc(p.mid_utc_mjd);
        let (_, _, _, hh, mm, ss, _) = epoch.to_gregorian_utc();
        writeln!(
            gtw,
            "{hh:02}{mm:02}{ss:02} {} {} {}",
            format_ra_ddmmssss(p.ra_deg),
            format_dec_sddmmsss(p.dec_deg),
            format_mag_smmm(p.mag),
        )
        .map_err(|e| Error::io(&gtw_path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DetectedSource, FrameState};

    fn make_frame(frame_no: i64, mjd: f64, sources: Vec<(f64, f64, f64, f64)>) -> Frame {
        let epoch = hifitime::Epoch::from_mjd_utc(mjd);
        let mut f = Frame::new(
            format!("f{frame_no}.fits").into(),
            "g".into(),
            "u".into(),
            "c".into(),
            frame_no,
            2048,
            2048,
            epoch,
            0.0,
        );
        f.state = FrameState::CalibratedOrMatched;
        for (id, (x, y, ra, dec)) in sources.into_iter().enumerate() {
            let mut s = DetectedSource::new(x, y, 20.0, 1000.0, 1.0, 3.0, 0.02);
            s.id = id as u64 + 1;
            s.set_sky_position(ra, dec);
            f.sources.push(s);
        }
        f
    }

    #[test]
    fn classify_detects_transit_when_motion_exceeds_drift_budget() {
        let p1 = PvPoint {
            file: "a".into(),
            mid_utc_mjd: 59000.0,
            frame_no: 1,
            source_id: 1,
            x: 100.0,
            y: 100.0,
            ra_deg: 180.0,
            dec_deg: 0.0,
            mag: 15.0,
            point_id: 1,
            related: Cell::new(0),
        };
        let p2 = PvPoint {
            ra_deg: 180.2,
            x: 105.0,
            mid_utc_mjd: 59000.0 + 30.0 / 86400.0,
            point_id: 2,
            ..clone_point(&p1)
        };
        assert_eq!(classify(&p1, &p2), Mode::Transit);
    }

    #[test]
    fn classify_detects_stare_from_near_zero_sky_motion() {
        let p1 = PvPoint {
            file: "a".into(),
            mid_utc_mjd: 59000.0,
            frame_no: 1,
            source_id: 1,
            x: 100.0,
            y: 100.0,
            ra_deg: 180.0,
            dec_deg: 0.0,
            mag: 15.0,
            point_id: 1,
            related: Cell::new(0),
        };
        let p2 = PvPoint {
            x: 100.0,
            mid_utc_mjd: 59000.0 + 30.0 / 86400.0,
            point_id: 2,
            ..clone_point(&p1)
        };
        assert_eq!(classify(&p1, &p2), Mode::Stare);
    }

    #[test]
    fn transit_source_tracked_stationary_source_rejected() {
        // End-to-end scenario 3 (§8): 7 frames 30s apart. One source fixed in
        // pixel space and sky position (Stare, rejected on endpoint pixel
        // delta); one moving 5 px/frame, Transit, also judged on endpoint
        // pixel delta since its per-step spread is small -- its sky motion
        // alone is under the sidereal drift budget and would wrongly reject
        // it if the stellar test ran unconditionally.
        let mut assoc = Associator::new(std::env::temp_dir().join("assoc-test-scratch"));
        let dt_days = 30.0 / 86400.0;
        let mjd0 = 59000.0;
        let mut all_tracks = Vec::new();
        for i in 0..7 {
            let mjd = mjd0 + i as f64 * dt_days;
            let frame = make_frame(
                i + 1,
                mjd,
                vec![
                    (100.0, 100.0, 180.0, 0.0),
                    (100.0 + 5.0 * i as f64, 100.0, 180.0 + 0.05 * i as f64, 0.0),
                ],
            );
            all_tracks.extend(assoc.ingest_frame(&frame));
        }
        all_tracks.extend(assoc.finalize_all_open());
        assert_eq!(all_tracks.len(), 1);
        let track = &all_tracks[0];
        assert_eq!(track.pts.len(), 7);
        let (vx, _) = velocity_pix_per_day(&track.pts[0], &track.pts[1]);
        assert!((vx - 5.0 / (30.0 / 86400.0)).abs() / vx.abs() < 0.2);
    }

    #[test]
    fn sequence_boundary_finalizes_then_starts_fresh() {
        // End-to-end scenario 5 (§8): frame numbers 10, 11, 12, 5, 6, 7.
        let mut assoc = Associator::new(std::env::temp_dir().join("assoc-test-scratch"));
        let dt_days = 30.0 / 86400.0;
        let mjd0 = 59000.0;
        let mut offset = 0;
        let mut all_tracks = Vec::new();
        for fno in [10, 11, 12, 5, 6, 7] {
            let mjd = mjd0 + offset as f64 * dt_days;
            offset += 1;
            let frame = make_frame(
                fno,
                mjd,
                vec![(100.0 + 5.0 * offset as f64, 100.0, 180.0 + 0.05 * offset as f64, 0.0)],
            );
            all_tracks.extend(assoc.ingest_frame(&frame));
        }
        all_tracks.extend(assoc.finalize_all_open());
        // Neither run reaches 5 points (3 frames then 3 frames), so nothing
        // should finalize into a track, but the boundary must not panic and
        // must not carry candidates across the drop in frame_no.
        assert!(all_tracks.is_empty());
    }

    #[test]
    fn rolling_shutter_shifts_mid_utc_by_expected_amount() {
        // End-to-end scenario 4 (§8).
        let rs = RollingShutter {
            read_time_ms: 125.0,
            lines: 4096,
        };
        let delay_days = rs.row_delay_days(2048.0);
        let delay_ms = delay_days * 86400.0 * 1000.0;
        assert!((delay_ms - 62.5).abs() < 1e-9);
    }

    #[test]
    fn related_count_matches_confirmed_membership() {
        let mut assoc = Associator::new(std::env::temp_dir().join("assoc-test-scratch"));
        let dt_days = 30.0 / 86400.0;
        let mjd0 = 59000.0;
        for i in 0..3 {
            let mjd = mjd0 + i as f64 * dt_days;
            let frame = make_frame(i + 1, mjd, vec![(100.0 + 5.0 * i as f64, 100.0, 180.0 + 0.05 * i as f64, 0.0)]);
            assoc.ingest_frame(&frame);
        }
        for candidate in &assoc.candidates {
            for p in &candidate.pts {
                assert_eq!(p.related(), 1);
            }
        }
    }

    #[test]
    fn noise_filter_rejects_stationary_jitter() {
        let base = PvPoint {
            file: "a".into(),
            mid_utc_mjd: 59000.0,
            frame_no: 1,
            source_id: 1,
            x: 100.0,
            y: 100.0,
            ra_deg: 180.0,
            dec_deg: 0.0,
            mag: 15.0,
            point_id: 1,
            related: Cell::new(0),
        };
        let pts: Vec<Rc<PvPoint>> = (0..5)
            .map(|i| {
                Rc::new(PvPoint {
                    x: 100.0 + (i % 2) as f64,
                    frame_no: i + 1,
                    point_id: i as u64 + 1,
                    ..clone_point(&base)
                })
            })
            .collect();
        assert!(noise_filter_rejects(&pts));
    }

    #[test]
    fn noise_filter_tests_endpoint_axes_independently() {
        // dx=2, dy=2: within the per-axis 3px budget on each axis
        // individually, even though the old summed form (dx+dy=4) would have
        // rejected it.
        let base = PvPoint {
            file: "a".into(),
            mid_utc_mjd: 59000.0,
            frame_no: 1,
            source_id: 1,
            x: 100.0,
            y: 100.0,
            ra_deg: 180.0,
            dec_deg: 0.0,
            mag: 15.0,
            point_id: 1,
            related: Cell::new(0),
        };
        let last = Rc::new(PvPoint {
            x: 102.0,
            y: 102.0,
            frame_no: 2,
            point_id: 2,
            ..clone_point(&base)
        });
        let pts = vec![Rc::new(clone_point(&base)), last];
        assert!(noise_filter_rejects(&pts));
    }

    #[test]
    fn finalize_filter_only_applies_stellar_test_when_pixel_spread_is_large() {
        // Uniform Δx=5px/frame: per-step pixel spread is 0 on both axes (<=3),
        // so this candidate is judged on endpoint pixel delta alone and must
        // never be rejected by the stellar (sidereal drift) test, even though
        // its sky motion (0.3 deg over 6 steps) is below the drift budget.
        let base = PvPoint {
            file: "a".into(),
            mid_utc_mjd: 59000.0,
            frame_no: 1,
            source_id: 1,
            x: 100.0,
            y: 100.0,
            ra_deg: 180.0,
            dec_deg: 0.0,
            mag: 15.0,
            point_id: 1,
            related: Cell::new(0),
        };
        let dt_days = 30.0 / 86400.0;
        let pts: Vec<Rc<PvPoint>> = (0..7)
            .map(|i| {
                Rc::new(PvPoint {
                    x: 100.0 + 5.0 * i as f64,
                    mid_utc_mjd: base.mid_utc_mjd + i as f64 * dt_days,
                    ra_deg: base.ra_deg + 0.05 * i as f64,
                    frame_no: i + 1,
                    point_id: i as u64 + 1,
                    ..clone_point(&base)
                })
            })
            .collect();
        assert!(pixel_spread_is_small(&pts));
        assert!(stellar_filter_rejects(&pts), "sky motion alone is below the drift budget");
        assert!(!finalize_filter_rejects(&pts), "small pixel spread must route to the noise test, not the stellar test");
    }

    #[test]
    fn format_helpers_produce_fixed_width_fields() {
        assert_eq!(format_ra_ddmmssss(180.0).len(), 9);
        assert_eq!(format_dec_sddmmsss(-45.5).len(), 8);
        assert_eq!(format_mag_smmm(12.3), "+123");
    }
}
