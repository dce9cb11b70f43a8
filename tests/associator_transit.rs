use std::error::Error;

use wfs_reduce::frame::{DetectedSource, Frame, FrameState};
use wfs_reduce::Associator;

fn make_frame(frame_no: i64, mjd: f64, sources: &[(f64, f64, f64, f64)]) -> Frame {
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
    for (i, &(x, y, ra, dec)) in sources.iter().enumerate() {
        let mut s = DetectedSource::new(x, y, 20.0, 1000.0, 1.0, 3.0, 0.02);
        s.id = i as u64 + 1;
        s.set_sky_position(ra, dec);
        f.sources.push(s);
    }
    f
}

#[test]
fn moving_source_becomes_a_track_while_stationary_source_is_dropped() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut assoc = Associator::new(dir.path());

    let dt_days = 30.0 / 86400.0;
    let mjd0 = 59400.0;
    let mut tracks = Vec::new();
    for i in 0..7 {
        let mjd = mjd0 + i as f64 * dt_days;
        let frame = make_frame(
            i + 1,
            mjd,
            &[
                (100.0, 100.0, 210.0, -10.0),
                (100.0 + 6.0 * i as f64, 100.0, 210.0 + 0.06 * i as f64, -10.0),
            ],
        );
        tracks.extend(assoc.ingest_frame(&frame));
    }
    tracks.extend(assoc.finalize_all_open());

    assert_eq!(tracks.len(), 1, "only the moving source should finalize into a track");
    assert_eq!(tracks[0].pts.len(), 7);
    Ok(())
}
