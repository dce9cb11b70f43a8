//! UCAC4-style catalog backend: a directory of `u4i/u4index.asc` (ASCII zone
//! index) and `u4b/z001..z900` little-endian 78-byte-record strip files, one
//! per declination zone, grounded on the original `ACatUCAC4` (§6).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::support::sphere::cone_bounding_box;

use super::{
    clamp_radius_arcmin, cone_filter, scratch_capacity, validate_pointing, ReferenceCatalog,
    ReferenceStar, ZoneIndex,
};

pub const RECORD_SIZE: usize = 78;
/// RA zone width: 0.25 degree, stored as milliarcseconds.
pub const RA_STEP_MAS: i64 = 900_000;
/// Dec (spd) zone width: 0.2 degree, stored as milliarcseconds.
pub const DEC_STEP_MAS: i64 = 720_000;

//tp Ucac4Record
/// One decoded 78-byte UCAC4 record; field names and units follow the
/// upstream binary layout verbatim (§6) so the decoder needs no per-caller
/// reinterpretation.
#[derive(Debug, Clone, Copy)]
pub struct Ucac4Record {
    pub ra_mas: i32,
    pub spd_mas: i32,
    pub magm_mmag: i16,
    pub maga_mmag: i16,
    pub sigmag: u8,
    pub objt: u8,
    pub cdf: u8,
    pub sigra: u8,
    pub sigdc: u8,
    pub na1: u8,
    pub nu1: u8,
    pub cu1: u8,
    pub cepra: i16,
    pub cepdc: i16,
    pub pmrac: i16,
    pub pmdc: i16,
    pub sigpmr: u8,
    pub sigpmd: u8,
    pub pts_key: i32,
    pub j_m: i16,
    pub k_m: i16,
    pub h_m: i16,
    pub icqflg: [u8; 3],
    pub e2mpho: [u8; 3],
    pub apasm: [i16; 5],
    pub apase: [u8; 5],
    pub gcflg: u8,
    pub icf: i32,
    pub leda: u8,
    pub x2m: u8,
    pub rnm: i32,
    pub zn2: i16,
    pub rn2: i32,
}

//fp decode_record
/// Decode one 78-byte little-endian UCAC4 record. The single decoder
/// replaces the per-field cast chains of the upstream `resolve_item` (§9).
pub fn decode_record(buf: &[u8]) -> Ucac4Record {
    assert!(buf.len() >= RECORD_SIZE);
    let i32_at = |o: usize| i32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
    let i16_at = |o: usize| i16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
    Ucac4Record {
        ra_mas: i32_at(0),
        spd_mas: i32_at(4),
        magm_mmag: i16_at(8),
        maga_mmag: i16_at(10),
        sigmag: buf[12],
        objt: buf[13],
        cdf: buf[14],
        sigra: buf[15],
        sigdc: buf[16],
        na1: buf[17],
        nu1: buf[18],
        cu1: buf[19],
        cepra: i16_at(20),
        cepdc: i16_at(22),
        pmrac: i16_at(24),
        pmdc: i16_at(26),
        sigpmr: buf[28],
        sigpmd: buf[29],
        pts_key: i32_at(30),
        j_m: i16_at(34),
        k_m: i16_at(36),
        h_m: i16_at(38),
        icqflg: [buf[40], buf[41], buf[42]],
        e2mpho: [buf[43], buf[44], buf[45]],
        apasm: [
            i16_at(46),
            i16_at(48),
            i16_at(50),
            i16_at(52),
            i16_at(54),
        ],
        apase: [buf[56], buf[57], buf[58], buf[59], buf[60]],
        gcflg: buf[61],
        icf: i32_at(62),
        leda: buf[66],
        x2m: buf[67],
        rnm: i32_at(68),
        zn2: i16_at(72),
        rn2: i32_at(74),
    }
}

impl From<Ucac4Record> for ReferenceStar {
    fn from(r: Ucac4Record) -> Self {
        ReferenceStar {
            ra_deg: r.ra_mas as f64 / 3_600_000.0,
            dec_deg: r.spd_mas as f64 / 3_600_000.0 - 90.0,
            pmra_mas_yr: r.pmrac as f64 * 0.1,
            pmdec_mas_yr: r.pmdc as f64 * 0.1,
            mag: r.magm_mmag as f64 / 1000.0,
        }
    }
}

//fp byte_swap_i32 / byte_swap_i16
/// Byte-swap helpers for reading a foreign-endian catalog on a host of the
/// opposite endianness (§9).
pub fn byte_swap_i32(v: i32) -> i32 {
    i32::from_be_bytes(v.to_le_bytes())
}
pub fn byte_swap_i16(v: i16) -> i16 {
    i16::from_be_bytes(v.to_le_bytes())
}

//tp UCAC4Catalog
/// A UCAC4-style catalog reader rooted at a directory containing
/// `u4i/u4index.asc` and `u4b/z001..z900`.
pub struct UCAC4Catalog {
    root: PathBuf,
    index: Option<ZoneIndex>,
    scratch: Vec<u8>,
}

impl UCAC4Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: None,
            scratch: Vec::new(),
        }
    }

    fn ra_zones() -> usize {
        (360 * 3_600_000 / RA_STEP_MAS) as usize
    }
    fn dec_zones() -> usize {
        (180 * 3_600_000 / DEC_STEP_MAS) as usize
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("u4i").join("u4index.asc")
    }
    fn strip_path(&self, dec_zone: usize) -> PathBuf {
        self.root.join("u4b").join(format!("z{:03}", dec_zone + 1))
    }

    fn load_index(&mut self) -> Result<&ZoneIndex, Error> {
        if self.index.is_none() {
            self.index = Some(load_asc_index(&self.index_path())?);
        }
        Ok(self.index.as_ref().unwrap())
    }
}

//fp load_asc_index
/// Parse `u4index.asc`: one `<offset> <count>` pair per line, row-major over
/// `(dec-zone, ra-zone)`.
fn load_asc_index(path: &Path) -> Result<ZoneIndex, Error> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let ra_zones = UCAC4Catalog::ra_zones();
    let dec_zones = UCAC4Catalog::dec_zones();
    let mut entries = Vec::with_capacity(ra_zones * dec_zones);
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut it = line.split_ascii_whitespace();
        let offset: u64 = it
            .next()
            .ok_or_else(|| Error::Parse(format!("short index line {line:?}")))?
            .parse()
            .map_err(|e| Error::Parse(format!("bad offset in {line:?}: {e}")))?;
        let count: u32 = it
            .next()
            .ok_or_else(|| Error::Parse(format!("short index line {line:?}")))?
            .parse()
            .map_err(|e| Error::Parse(format!("bad count in {line:?}: {e}")))?;
        entries.push((offset, count));
    }
    if entries.len() != ra_zones * dec_zones {
        return Err(Error::Parse(format!(
            "UCAC4 index has {} entries, expected {}",
            entries.len(),
            ra_zones * dec_zones
        )));
    }
    Ok(ZoneIndex::new(entries, ra_zones, dec_zones))
}

impl ReferenceCatalog for UCAC4Catalog {
    fn cone_search(
        &mut self,
        ra_deg: f64,
        dec_deg: f64,
        radius_arcmin: f64,
    ) -> Result<Vec<ReferenceStar>, Error> {
        validate_pointing(ra_deg, dec_deg)?;
        let radius_rad = clamp_radius_arcmin(radius_arcmin);
        let ra0 = ra_deg.to_radians();
        let dec0 = dec_deg.to_radians();

        let ra_zones = UCAC4Catalog::ra_zones();
        let dec_step_rad = (DEC_STEP_MAS as f64 / 3_600_000.0).to_radians();
        let ra_step_rad = (RA_STEP_MAS as f64 / 3_600_000.0).to_radians();

        self.load_index()?;
        let index = self.index.as_ref().unwrap().clone();
        let bbox = cone_bounding_box(ra0, dec0, radius_rad);

        let zd_min = (bbox.spd_min / dec_step_rad).floor().max(0.0) as usize;
        let zd_max = ((bbox.spd_max / dec_step_rad).ceil() as usize)
            .min(index.dec_zones().saturating_sub(1));
        let zr_min = (bbox.ra_min / ra_step_rad).floor() as i64;
        let zr_max = (bbox.ra_max / ra_step_rad).ceil() as i64;

        let mut out = Vec::new();
        for zd in zd_min..=zd_max {
            let path = self.strip_path(zd);
            let mut file = match File::open(&path) {
                Ok(f) => f,
                Err(_) => break, // missing strip file: stop iteration silently (§4.1)
            };
            for zr in zr_min..=zr_max {
                let zr_idx = zr.rem_euclid(ra_zones as i64) as usize;
                let (offset, count) = index.get(zd, zr_idx);
                if count == 0 {
                    continue;
                }
                let needed = scratch_capacity(count as usize) * RECORD_SIZE;
                if self.scratch.len() < needed {
                    self.scratch.resize(needed, 0);
                }
                let byte_len = count as usize * RECORD_SIZE;
                file.seek(SeekFrom::Start(offset * RECORD_SIZE as u64))
                    .map_err(|e| Error::io(&path, e))?;
                file.read_exact(&mut self.scratch[..byte_len])
                    .map_err(|e| Error::io(&path, e))?;
                for chunk in self.scratch[..byte_len].chunks_exact(RECORD_SIZE) {
                    let rec = decode_record(chunk);
                    out.push(ReferenceStar::from(rec));
                }
            }
        }
        Ok(cone_filter(out, ra_deg, dec_deg, radius_rad))
    }
}

//a Tests
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_record(ra_mas: i32, spd_mas: i32) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&ra_mas.to_le_bytes());
        buf[4..8].copy_from_slice(&spd_mas.to_le_bytes());
        buf
    }

    #[test]
    fn decode_roundtrips_ra_spd() {
        let buf = write_record(123_456_789, 987_654);
        let rec = decode_record(&buf);
        assert_eq!(rec.ra_mas, 123_456_789);
        assert_eq!(rec.spd_mas, 987_654);
    }

    #[test]
    fn cone_search_near_pole_finds_both_stars() {
        // End-to-end scenario 1 (§8): 2 stars near the pole, query radius 12'.
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("u4i")).unwrap();
        std::fs::create_dir_all(dir.path().join("u4b")).unwrap();

        let ra_zones = UCAC4Catalog::ra_zones();
        let dec_zones = UCAC4Catalog::dec_zones();

        // Star A: ra=10deg, dec=89.9deg -> spd=179.9deg
        let ra_a_mas = (10.0 * 3_600_000.0) as i32;
        let spd_a_mas = (179.9 * 3_600_000.0) as i32;
        // Star B: ra=200deg, same dec.
        let ra_b_mas = (200.0 * 3_600_000.0) as i32;

        let dec_zone = (spd_a_mas as i64 / DEC_STEP_MAS) as usize;
        let ra_zone_a = (ra_a_mas as i64 / RA_STEP_MAS) as usize % ra_zones;
        let ra_zone_b = (ra_b_mas as i64 / RA_STEP_MAS) as usize % ra_zones;

        let mut strip_data = Vec::new();
        strip_data.extend_from_slice(&write_record(ra_a_mas, spd_a_mas));
        strip_data.extend_from_slice(&write_record(ra_b_mas, spd_a_mas));

        let strip_path = dir.path().join("u4b").join(format!("z{:03}", dec_zone + 1));
        std::fs::write(&strip_path, &strip_data).unwrap();

        let mut index_text = String::new();
        for zd in 0..dec_zones {
            for zr in 0..ra_zones {
                let (offset, count) = if zd == dec_zone && zr == ra_zone_a {
                    (0, 1)
                } else if zd == dec_zone && zr == ra_zone_b {
                    (1, 1)
                } else {
                    (0, 0)
                };
                index_text.push_str(&format!("{offset} {count}\n"));
            }
        }
        let mut f = File::create(dir.path().join("u4i").join("u4index.asc")).unwrap();
        f.write_all(index_text.as_bytes()).unwrap();
        drop(f);

        let mut cat = UCAC4Catalog::new(dir.path());
        let result = cat.cone_search(0.0, 90.0, 12.0).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn missing_index_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cat = UCAC4Catalog::new(dir.path());
        assert!(cat.cone_search(10.0, 10.0, 5.0).is_err());
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let mut cat = UCAC4Catalog::new(dir.path());
        assert!(cat.cone_search(500.0, 10.0, 5.0).is_err());
    }
}
