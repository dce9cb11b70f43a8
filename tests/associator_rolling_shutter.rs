use std::error::Error;

use wfs_reduce::frame::{DetectedSource, Frame, FrameState};
use wfs_reduce::{Associator, RollingShutter};

fn make_frame(frame_no: i64, mjd: f64, y: f64) -> Frame {
    let epoch = hifitime::Epoch::from_mjd_utc(mjd);
    let mut f = Frame::new(
        format!("frame{frame_no:04}.fits").into(),
        "g0".into(),
        "u0".into(),
        "c0".into(),
        frame_no,
        2048,
        4096,
        epoch,
        0.0,
    );
    f.state = FrameState::CalibratedOrMatched;
    let mut s = DetectedSource::new(100.0, y, 20.0, 1000.0, 1.0, 3.0, 0.02);
    s.id = 1;
    s.set_sky_position(210.0 + 0.06 * frame_no as f64, -10.0);
    f.sources.push(s);
    f
}

#[test]
fn finalized_track_timestamps_carry_the_row_readout_delay() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let rs = RollingShutter {
        read_time_ms: 125.0,
        lines: 4096,
    };
    let mut assoc = Associator::new(dir.path()).with_rolling_shutter(rs);

    let dt_days = 30.0 / 86400.0;
    let mjd0 = 59500.0;
    let y = 3072.0;
    let mut tracks = Vec::new();
    for i in 0..6 {
        let frame = make_frame(i + 1, mjd0 + i as f64 * dt_days, y);
        tracks.extend(assoc.ingest_frame(&frame));
    }
    tracks.extend(assoc.finalize_all_open());

    assert_eq!(tracks.len(), 1);
    let track = &tracks[0];
    let expected_delay_days = (rs.read_time_ms / rs.lines as f64) * y / 1000.0 / 86400.0;
    for (i, p) in track.pts.iter().enumerate() {
        let raw_mjd = mjd0 + i as f64 * dt_days;
        assert!((p.mid_utc_mjd - (raw_mjd + expected_delay_days)).abs() < 1e-12);
    }
    Ok(())
}
