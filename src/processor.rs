//! The frame processor: a thread-safe queue driving three external-tool
//! stages (source extraction, astrometry, catalog match) per frame (§4.3,
//! §5). Concurrency follows the teacher's preference for a small number of
//! purpose-specific OS threads over a runtime: one dispatch thread, one
//! watcher thread per in-flight extraction, a blocking wait for astrometry,
//! and a retry thread per notification sink.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::frame::{DetectedSource, Frame, FrameState};
use crate::refcat::ReferenceCatalog;
use crate::support::linalg::solve_normal_equations;
use crate::support::sphere::angular_distance;

const FILE_POLL_INTERVAL_MS: u64 = 100;
const FILE_STABLE_SAMPLES: u32 = 5;
const SINK_RETRY_PERIOD: Duration = Duration::from_secs(60);

//tp NotificationSink
/// An outbound side channel for processor events. The concrete network
/// transport lives outside this crate; the processor only depends on this
/// trait so the core pipeline never blocks on sink availability.
pub trait NotificationSink: Send + Sync {
    fn notify_fwhm(&self, gid: &str, frame_no: i64, fwhm: f64) -> Result<(), Error>;
}

//tp ReconnectingSink
/// Wraps a [`NotificationSink`], retrying a failed send once per
/// [`SINK_RETRY_PERIOD`] rather than propagating the failure to the caller.
pub struct ReconnectingSink {
    inner: Box<dyn NotificationSink>,
    connected: AtomicBool,
    last_attempt: Mutex<Option<std::time::Instant>>,
}

impl ReconnectingSink {
    pub fn new(inner: Box<dyn NotificationSink>) -> Self {
        Self {
            inner,
            connected: AtomicBool::new(true),
            last_attempt: Mutex::new(None),
        }
    }

    /// Best-effort notify: failures are logged and swallowed; a disconnected
    /// sink is only retried once the retry period has elapsed.
    pub fn notify_fwhm(&self, gid: &str, frame_no: i64, fwhm: f64) {
        if !self.connected.load(Ordering::Acquire) {
            let mut last = self.last_attempt.lock().unwrap_or_else(|e| e.into_inner());
            let due = last.map(|t| t.elapsed() >= SINK_RETRY_PERIOD).unwrap_or(true);
            if !due {
                return;
            }
            *last = Some(std::time::Instant::now());
        }
        match self.inner.notify_fwhm(gid, frame_no, fwhm) {
            Ok(()) => self.connected.store(true, Ordering::Release),
            Err(e) => {
                warn!("notification sink unreachable, will retry in 60s: {e}");
                self.connected.store(false, Ordering::Release);
            }
        }
    }
}

//fp poll_until_stable
/// Poll a file's size every `interval` until it has been unchanged for
/// `stable_samples` consecutive polls.
fn poll_until_stable(path: &Path, interval: Duration, stable_samples: u32) {
    let mut last_size: Option<u64> = None;
    let mut stable = 0u32;
    loop {
        thread::sleep(interval);
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if Some(size) == last_size && size > 0 {
            stable += 1;
            if stable >= stable_samples {
                return;
            }
        } else {
            stable = 0;
            last_size = Some(size);
        }
    }
}

//fp run_source_extraction
/// Spawn the external extractor, wait for its output file to stop growing,
/// then wait for the child itself to exit.
pub fn run_source_extraction(
    exe: &Path,
    image: &Path,
    extractor_config: &Path,
    output: &Path,
) -> Result<(), Error> {
    let mut child = Command::new(exe)
        .arg(image)
        .arg("-c")
        .arg(extractor_config)
        .arg("-CATALOG_NAME")
        .arg(output)
        .spawn()
        .map_err(|e| Error::ExtractorFailed(format!("spawn {}: {e}", exe.display())))?;

    poll_until_stable(
        output,
        Duration::from_millis(FILE_POLL_INTERVAL_MS),
        FILE_STABLE_SAMPLES,
    );

    let status = child
        .wait()
        .map_err(|e| Error::ExtractorFailed(format!("wait {}: {e}", exe.display())))?;
    if !status.success() {
        return Err(Error::ExtractorFailed(format!(
            "{} exited with {status}",
            exe.display()
        )));
    }
    Ok(())
}

//fp parse_extractor_catalog
/// Parse a source-extractor text catalog: `#`-prefixed comment lines, then
/// whitespace-separated `area x y flux fwhm ellipticity` per detection.
pub fn parse_extractor_catalog(text: &str, exptime_s: f64) -> Vec<DetectedSource> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 6 {
            continue;
        }
        let parse = |s: &str| s.parse::<f64>().ok();
        if let (Some(area), Some(x), Some(y), Some(flux), Some(fwhm), Some(ellipticity)) = (
            parse(cols[0]),
            parse(cols[1]),
            parse(cols[2]),
            parse(cols[3]),
            parse(cols[4]),
            parse(cols[5]),
        ) {
            if flux > 0.0 {
                out.push(DetectedSource::new(x, y, area, flux, exptime_s, fwhm, ellipticity));
            }
        }
    }
    out
}

//fp frame_fwhm
/// Median FWHM of well-behaved sources (`area > 10`, `ellipticity < 0.1`) in
/// the central quarter of the frame.
pub fn frame_fwhm(sources: &[DetectedSource], width: u32, height: u32) -> Option<f64> {
    let (xlo, xhi) = (width as f64 * 0.25, width as f64 * 0.75);
    let (ylo, yhi) = (height as f64 * 0.25, height as f64 * 0.75);
    let mut values: Vec<f64> = sources
        .iter()
        .filter(|s| {
            s.area > 10.0
                && s.ellipticity < 0.1
                && s.x >= xlo
                && s.x <= xhi
                && s.y >= ylo
                && s.y <= yhi
        })
        .map(|s| s.fwhm)
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(values[values.len() / 2])
}

//tp SipWcs
/// A SIP-style WCS loaded from an astrometry solver's `.wcs` output:
/// reference pixel/sky, CD matrix, and two polynomial distortion surfaces.
#[derive(Debug, Clone)]
pub struct SipWcs {
    pub crpix: (f64, f64),
    pub crval_deg: (f64, f64),
    pub cd: [[f64; 2]; 2],
    pub a_order: usize,
    pub b_order: usize,
    pub a_coef: HashMap<(usize, usize), f64>,
    pub b_coef: HashMap<(usize, usize), f64>,
}

impl SipWcs {
    /// Project an image pixel to `(ra_deg, dec_deg)` via the SIP forward
    /// polynomial plus TAN projection.
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        let u = x - self.crpix.0;
        let v = y - self.crpix.1;
        let mut fu = 0.0;
        for (&(i, j), coef) in &self.a_coef {
            fu += coef * u.powi(i as i32) * v.powi(j as i32);
        }
        let mut fv = 0.0;
        for (&(i, j), coef) in &self.b_coef {
            fv += coef * u.powi(i as i32) * v.powi(j as i32);
        }
        let up = u + fu;
        let vp = v + fv;
        let xi_deg = self.cd[0][0] * up + self.cd[0][1] * vp;
        let eta_deg = self.cd[1][0] * up + self.cd[1][1] * vp;
        let xi = xi_deg.to_radians();
        let eta = eta_deg.to_radians();
        let ra0 = self.crval_deg.0.to_radians();
        let dec0 = self.crval_deg.1.to_radians();
        let fract = dec0.cos() - eta * dec0.sin();
        let dra = xi.atan2(fract);
        let ra = crate::support::sphere::wrap_2pi(ra0 + dra);
        let dec = ((eta * dec0.cos() + dec0.sin()) * dra.cos() / fract).atan();
        (ra.to_degrees(), dec.to_degrees())
    }
}

//fp parse_sip_wcs
/// Parse FITS-style `KEYWORD = value` header cards (one per line; `/`
/// introduces a trailing comment) into a [`SipWcs`].
pub fn parse_sip_wcs(text: &str) -> Result<SipWcs, Error> {
    let mut values: HashMap<String, f64> = HashMap::new();
    let mut a_coef = HashMap::new();
    let mut b_coef = HashMap::new();
    for line in text.lines() {
        let Some(eq) = line.find('=') else { continue };
        let key = line[..eq].trim().to_string();
        let rest = &line[eq + 1..];
        let value_str = rest.split('/').next().unwrap_or("").trim();
        let Ok(value) = value_str.parse::<f64>() else { continue };
        if let Some(idx) = key.strip_prefix("A_") {
            if let Some((i, j)) = parse_ij(idx) {
                a_coef.insert((i, j), value);
                continue;
            }
        }
        if let Some(idx) = key.strip_prefix("B_") {
            if let Some((i, j)) = parse_ij(idx) {
                b_coef.insert((i, j), value);
                continue;
            }
        }
        values.insert(key, value);
    }

    let get = |k: &str| {
        values
            .get(k)
            .copied()
            .ok_or_else(|| Error::AstrometryFailed(format!("missing WCS key {k}")))
    };
    Ok(SipWcs {
        crpix: (get("CRPIX1")?, get("CRPIX2")?),
        crval_deg: (get("CRVAL1")?, get("CRVAL2")?),
        cd: [
            [get("CD1_1")?, get("CD1_2")?],
            [get("CD2_1")?, get("CD2_2")?],
        ],
        a_order: values.get("A_ORDER").copied().unwrap_or(0.0) as usize,
        b_order: values.get("B_ORDER").copied().unwrap_or(0.0) as usize,
        a_coef,
        b_coef,
    })
}

fn parse_ij(idx: &str) -> Option<(usize, usize)> {
    let mut parts = idx.split('_');
    let i = parts.next()?.parse().ok()?;
    let j = parts.next()?.parse().ok()?;
    Some((i, j))
}

//fp run_astrometry
/// Spawn the external plate-solver and block until it exits (no polling:
/// unlike extraction, the solver's `.wcs` output is only valid once it has
/// fully exited).
pub fn run_astrometry(
    exe: &Path,
    image: &Path,
    scale_low: f64,
    scale_high: f64,
) -> Result<PathBuf, Error> {
    let status = Command::new(exe)
        .arg(image)
        .arg("--scale-low")
        .arg(scale_low.to_string())
        .arg("--scale-high")
        .arg(scale_high.to_string())
        .status()
        .map_err(|e| Error::AstrometryFailed(format!("spawn {}: {e}", exe.display())))?;
    if !status.success() {
        return Err(Error::AstrometryFailed(format!(
            "{} exited with {status}",
            exe.display()
        )));
    }
    Ok(image.with_extension("wcs"))
}

//fp match_sources
/// Greedy nearest-match of a frame's sources against catalog stars within
/// `tolerance_deg`, then fit `mag_image = a + b*mag_catalog` over the
/// matched pairs via the crate's single least-squares primitive.
pub fn match_sources(
    sources: &mut [DetectedSource],
    stars: &[crate::refcat::ReferenceStar],
    tolerance_deg: f64,
) -> Result<(f64, f64), Error> {
    let mut claimed = vec![false; stars.len()];
    let mut pairs_mag: Vec<(f64, f64)> = Vec::new();

    for source in sources.iter_mut() {
        let (Some(ra), Some(dec)) = (source.ra_deg, source.dec_deg) else {
            continue;
        };
        let mut best: Option<usize> = None;
        let mut best_d = tolerance_deg.to_radians();
        for (i, star) in stars.iter().enumerate() {
            if claimed[i] {
                continue;
            }
            let d = angular_distance(
                ra.to_radians(),
                dec.to_radians(),
                star.ra_deg.to_radians(),
                star.dec_deg.to_radians(),
            );
            if d <= best_d {
                best_d = d;
                best = Some(i);
            }
        }
        if let Some(i) = best {
            claimed[i] = true;
            source.matched = true;
            source.matched_star = Some(stars[i]);
            pairs_mag.push((source.mag_instr, stars[i].mag));
        }
    }

    if pairs_mag.len() < 2 {
        return Err(Error::ModelFitFailed(format!(
            "{} matched pairs is fewer than 2 required for the zero-point fit",
            pairs_mag.len()
        )));
    }
    let m = pairs_mag.len();
    let mut basis = vec![0.0f64; 2 * m];
    let mut y = vec![0.0f64; m];
    for (k, (mag_image, mag_cat)) in pairs_mag.iter().enumerate() {
        basis[k] = 1.0;
        basis[m + k] = *mag_cat;
        y[k] = *mag_image;
    }
    let coef = solve_normal_equations(m, 2, &basis, &y)?;
    Ok((coef[0], coef[1]))
}

//tp Processor
/// Thread-safe frame queue plus per-stage dispatch. Each stage runs at most
/// one in-flight invocation at a time, enforced by the `*_busy` flags.
pub struct Processor {
    config: Config,
    frames: Mutex<Vec<Frame>>,
    cv: Condvar,
    extract_busy: AtomicBool,
    astrometry_busy: AtomicBool,
    match_busy: AtomicBool,
    sinks: Vec<ReconnectingSink>,
}

impl Processor {
    pub fn new(config: Config, sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self {
            config,
            frames: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            extract_busy: AtomicBool::new(false),
            astrometry_busy: AtomicBool::new(false),
            match_busy: AtomicBool::new(false),
            sinks: sinks.into_iter().map(ReconnectingSink::new).collect(),
        }
    }

    pub fn submit(&self, frame: Frame) {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        debug!("queued frame {} ({})", frame.frame_no, frame.path.display());
        frames.push(frame);
        self.cv.notify_one();
    }

    /// Remove frames that have reached a terminal state (success or failure).
    pub fn drain_completed(&self) -> Vec<Frame> {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        let (done, remaining): (Vec<Frame>, Vec<Frame>) = frames.drain(..).partition(|f| {
            f.state == FrameState::CalibratedOrMatched || f.state.is_terminal_failure()
        });
        *frames = remaining;
        done
    }

    fn take_oldest(&self, state: FrameState) -> Option<Frame> {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        let pos = frames.iter().position(|f| f.state == state)?;
        Some(frames.remove(pos))
    }

    fn put_back(&self, frame: Frame) {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        frames.push(frame);
        self.cv.notify_one();
    }

    fn notify_fwhm(&self, gid: &str, frame_no: i64, fwhm: f64) {
        for sink in &self.sinks {
            sink.notify_fwhm(gid, frame_no, fwhm);
        }
    }

    /// Launch the extraction stage for the oldest `Init` frame, if any and if
    /// extraction is not already in flight. Returns `true` if work was done.
    pub fn dispatch_extraction(&self) -> bool {
        if self.extract_busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(mut frame) = self.take_oldest(FrameState::Init) else {
            self.extract_busy.store(false, Ordering::Release);
            return false;
        };

        let work_dir = &self.config.work.path;
        let output = work_dir.join(format!("{}.cat", frame.frame_no));
        let result = run_source_extraction(
            &self.config.reduction.path_exe,
            &frame.path,
            &self.config.reduction.path_config,
            &output,
        )
        .and_then(|()| fs::read_to_string(&output).map_err(|e| Error::io(&output, e)));

        match result {
            Ok(text) => {
                frame.sources = parse_extractor_catalog(&text, frame.exptime_s);
                for source in &mut frame.sources {
                    frame.last_id += 1;
                    source.id = frame.last_id;
                }
                frame.fwhm = frame_fwhm(&frame.sources, frame.width, frame.height);
                frame.state = FrameState::Extracted;
                if let Some(fwhm) = frame.fwhm {
                    self.notify_fwhm(&frame.gid, frame.frame_no, fwhm);
                }
            }
            Err(e) => {
                warn!("extraction failed for {}: {e}", frame.path.display());
                frame.state = FrameState::FailedExtract;
            }
        }
        self.put_back(frame);
        self.extract_busy.store(false, Ordering::Release);
        true
    }

    /// Launch the astrometry stage for the oldest `Extracted` frame.
    pub fn dispatch_astrometry(&self) -> bool {
        if !self.config.astrometry.enable {
            return false;
        }
        if self.astrometry_busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(mut frame) = self.take_oldest(FrameState::Extracted) else {
            self.astrometry_busy.store(false, Ordering::Release);
            return false;
        };

        let result = run_astrometry(
            &self.config.astrometry.path_exe,
            &frame.path,
            self.config.astrometry.scale_low,
            self.config.astrometry.scale_high,
        )
        .and_then(|wcs_path| fs::read_to_string(&wcs_path).map_err(|e| Error::io(&wcs_path, e)))
        .and_then(|text| parse_sip_wcs(&text));

        match result {
            Ok(wcs) => {
                for source in &mut frame.sources {
                    let (ra, dec) = wcs.project(source.x, source.y);
                    source.set_sky_position(ra, dec);
                }
                frame.state = FrameState::Solved;
                info!("solved frame {} ({})", frame.frame_no, frame.path.display());
            }
            Err(e) => {
                warn!("astrometry failed for {}: {e}", frame.path.display());
                frame.state = FrameState::FailedSolve;
            }
        }
        self.put_back(frame);
        self.astrometry_busy.store(false, Ordering::Release);
        true
    }

    /// Launch the catalog-match stage for the oldest `Solved` frame.
    pub fn dispatch_match(&self, catalog: &Mutex<Box<dyn ReferenceCatalog + Send>>) -> bool {
        if !self.config.photometry.enable {
            return false;
        }
        if self.match_busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(mut frame) = self.take_oldest(FrameState::Solved) else {
            self.match_busy.store(false, Ordering::Release);
            return false;
        };

        let center = frame
            .sources
            .iter()
            .filter_map(|s| s.ra_deg.zip(s.dec_deg))
            .next();
        let result = match center {
            Some((ra, dec)) => {
                let mut cat = catalog.lock().unwrap_or_else(|e| e.into_inner());
                // A radius covering a typical wide-field frame's diagonal; see DESIGN.md.
                cat.cone_search(ra, dec, 90.0)
            }
            None => Ok(Vec::new()),
        };

        match result {
            Ok(stars) => {
                let tolerance_deg = 2.0 * 8.4 / 3600.0;
                match match_sources(&mut frame.sources, &stars, tolerance_deg) {
                    Ok(zero_point) => {
                        frame.photometry_zero = Some(zero_point);
                        frame.state = FrameState::CalibratedOrMatched;
                    }
                    Err(e) => {
                        debug!("photometric zero-point fit failed for {}: {e}", frame.path.display());
                        frame.state = FrameState::CalibratedOrMatched;
                    }
                }
            }
            Err(e) => {
                warn!("catalog match failed for {}: {e}", frame.path.display());
                frame.state = FrameState::FailedPhotometry;
            }
        }
        self.put_back(frame);
        self.match_busy.store(false, Ordering::Release);
        true
    }

    /// Block until a frame is queued, or `timeout` elapses.
    pub fn wait_for_work(&self, timeout: Duration) {
        let frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self.cv.wait_timeout(frames, timeout);
    }
}
