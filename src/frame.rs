//! Frame and detected-source data model (§3, §4.3).

use std::path::PathBuf;

use crate::refcat::ReferenceStar;

//tp FrameState
/// A frame's position in the processing pipeline. `Init -> Extracted ->
/// Solved -> CalibratedOrMatched` is the success path; each stage has a
/// matching terminal failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Init,
    Extracted,
    Solved,
    CalibratedOrMatched,
    FailedExtract,
    FailedSolve,
    FailedPhotometry,
}

impl FrameState {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            FrameState::FailedExtract | FrameState::FailedSolve | FrameState::FailedPhotometry
        )
    }
}

//tp DetectedSource
/// One star-like detection in a frame.
///
/// `ra_deg`/`dec_deg` are only valid once the owning frame has reached
/// [`FrameState::Solved`] or later.
#[derive(Debug, Clone)]
pub struct DetectedSource {
    pub x: f64,
    pub y: f64,
    pub area: f64,
    /// Instrument magnitude normalized to a 1-second exposure:
    /// `25 - 2.5*log10(flux/exptime)`.
    pub mag_instr: f64,
    pub fwhm: f64,
    pub ellipticity: f64,
    pub ra_deg: Option<f64>,
    pub dec_deg: Option<f64>,
    pub matched_star: Option<ReferenceStar>,
    pub matched: bool,
    pub id: u64,
}

impl DetectedSource {
    pub fn new(x: f64, y: f64, area: f64, flux: f64, exptime_s: f64, fwhm: f64, ellipticity: f64) -> Self {
        let mag_instr = 25.0 - 2.5 * (flux / exptime_s).log10();
        Self {
            x,
            y,
            area,
            mag_instr,
            fwhm,
            ellipticity,
            ra_deg: None,
            dec_deg: None,
            matched_star: None,
            matched: false,
            id: 0,
        }
    }

    pub fn set_sky_position(&mut self, ra_deg: f64, dec_deg: f64) {
        self.ra_deg = Some(ra_deg);
        self.dec_deg = Some(dec_deg);
    }
}

//tp Frame
/// One CCD exposure moving through the processor's state machine.
#[derive(Debug, Clone)]
pub struct Frame {
    pub path: PathBuf,
    pub gid: String,
    pub uid: String,
    pub cid: String,
    pub frame_no: i64,
    pub width: u32,
    pub height: u32,
    /// Exposure start, UTC.
    pub exposure_start: hifitime::Epoch,
    pub exptime_s: f64,
    pub state: FrameState,
    pub sources: Vec<DetectedSource>,
    pub fwhm: Option<f64>,
    pub last_id: u64,
    pub photometry_zero: Option<(f64, f64)>,
}

impl Frame {
    pub fn new(
        path: PathBuf,
        gid: String,
        uid: String,
        cid: String,
        frame_no: i64,
        width: u32,
        height: u32,
        exposure_start: hifitime::Epoch,
        exptime_s: f64,
    ) -> Self {
        Self {
            path,
            gid,
            uid,
            cid,
            frame_no,
            width,
            height,
            exposure_start,
            exptime_s,
            state: FrameState::Init,
            sources: Vec::new(),
            fwhm: None,
            last_id: 0,
            photometry_zero: None,
        }
    }

    /// Mid-exposure UTC: `start + exptime/2`.
    pub fn mid_exposure(&self) -> hifitime::Epoch {
        self.exposure_start + hifitime::Duration::from_seconds(self.exptime_s / 2.0)
    }

    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }
}
