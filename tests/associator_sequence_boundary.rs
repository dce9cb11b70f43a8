use std::error::Error;

use wfs_reduce::frame::{DetectedSource, Frame, FrameState};
use wfs_reduce::Associator;

fn make_frame(frame_no: i64, mjd: f64, x: f64) -> Frame {
    let epoch = hifitime::Epoch::from_mjd_utc(mjd);
    let mut f = Frame::new(
        format!("frame{frame_no:04}.fits").into(),
        "g0".into(),
        "u0".into(),
        "c0".into(),
        frame_no,
        2048,
        2048,
        epoch,
        0.0,
    );
    f.state = FrameState::CalibratedOrMatched;
    let mut s = DetectedSource::new(x, 100.0, 20.0, 1000.0, 1.0, 3.0, 0.02);
    s.id = 1;
    s.set_sky_position(210.0 + 0.06 * x, -10.0);
    f.sources.push(s);
    f
}

#[test]
fn a_drop_in_frame_number_starts_a_fresh_sequence_without_carrying_candidates() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut assoc = Associator::new(dir.path());

    let dt_days = 30.0 / 86400.0;
    let mjd0 = 59600.0;
    let mut tracks = Vec::new();
    let mut offset = 0.0;
    // First run: frames 10..=14 (5 points, long enough to finalize on its own
    // once the boundary closes it). Second run: frames 5..=6 (too short).
    for fno in [10, 11, 12, 13, 14, 5, 6] {
        let frame = make_frame(fno, mjd0 + offset * dt_days, 100.0 + 6.0 * offset);
        offset += 1.0;
        tracks.extend(assoc.ingest_frame(&frame));
    }
    tracks.extend(assoc.finalize_all_open());

    assert_eq!(tracks.len(), 1, "the first run's 5-point track should finalize at the boundary");
    assert_eq!(tracks[0].pts.len(), 5);
    assert_eq!(tracks[0].pts[0].frame_no, 10);
    Ok(())
}
