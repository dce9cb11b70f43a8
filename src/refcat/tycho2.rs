//! Tycho2-style catalog backend: a single binary file whose first
//! `N_zones * 8` bytes are an `(offset: u32, count: u32)` index table
//! (row-major over `(dec-zone, ra-zone)`), immediately followed by packed
//! 14-byte `{ra: i32, spd: i32, pmra: i16, pmdec: i16, mag: i16}` entries
//! (§4.1, §6), grounded on the original `ACatTycho2`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use crate::error::Error;
use crate::support::sphere::cone_bounding_box;

use super::{
    clamp_radius_arcmin, cone_filter, scratch_capacity, validate_pointing, ReferenceCatalog,
    ReferenceStar, ZoneIndex,
};

pub const RECORD_SIZE: usize = 14;
pub const ZONE_ENTRY_SIZE: usize = 8;
/// Zone step: 2.5 degrees in both axes (the upstream `ACatTycho2` default).
pub const ZONE_STEP_DEG: f64 = 2.5;

#[derive(Debug, Clone, Copy)]
pub struct Tycho2Record {
    pub ra_mas: i32,
    pub spd_mas: i32,
    pub pmra_mas_yr: i16,
    pub pmdec_mas_yr: i16,
    pub mag_mmag: i16,
}

//fp decode_record
pub fn decode_record(buf: &[u8]) -> Tycho2Record {
    assert!(buf.len() >= RECORD_SIZE);
    Tycho2Record {
        ra_mas: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
        spd_mas: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
        pmra_mas_yr: i16::from_le_bytes(buf[8..10].try_into().unwrap()),
        pmdec_mas_yr: i16::from_le_bytes(buf[10..12].try_into().unwrap()),
        mag_mmag: i16::from_le_bytes(buf[12..14].try_into().unwrap()),
    }
}

impl From<Tycho2Record> for ReferenceStar {
    fn from(r: Tycho2Record) -> Self {
        ReferenceStar {
            ra_deg: r.ra_mas as f64 / 3_600_000.0,
            dec_deg: r.spd_mas as f64 / 3_600_000.0 - 90.0,
            pmra_mas_yr: r.pmra_mas_yr as f64,
            pmdec_mas_yr: r.pmdec_mas_yr as f64,
            mag: r.mag_mmag as f64 / 1000.0,
        }
    }
}

fn zone_counts() -> (usize, usize) {
    let ra_zones = (360.001 / ZONE_STEP_DEG) as usize;
    let dec_zones = (180.001 / ZONE_STEP_DEG) as usize;
    (ra_zones, dec_zones)
}

//tp Tycho2Catalog
pub struct Tycho2Catalog {
    path: PathBuf,
    index: Option<ZoneIndex>,
    data_offset: u64,
    scratch: Vec<u8>,
}

impl Tycho2Catalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: None,
            data_offset: 0,
            scratch: Vec::new(),
        }
    }

    fn load_index(&mut self) -> Result<(), Error> {
        if self.index.is_some() {
            return Ok(());
        }
        let (ra_zones, dec_zones) = zone_counts();
        let n = ra_zones * dec_zones;
        let table_bytes = n * ZONE_ENTRY_SIZE;

        let mut file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let mut buf = vec![0u8; table_bytes];
        file.read_exact(&mut buf).map_err(|e| Error::io(&self.path, e))?;

        let mut entries = Vec::with_capacity(n);
        for chunk in buf.chunks_exact(ZONE_ENTRY_SIZE) {
            let offset = u32::from_le_bytes(chunk[0..4].try_into().unwrap()) as u64;
            let count = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
            entries.push((offset, count));
        }
        self.index = Some(ZoneIndex::new(entries, ra_zones, dec_zones));
        self.data_offset = table_bytes as u64;
        Ok(())
    }
}

impl ReferenceCatalog for Tycho2Catalog {
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

        self.load_index()?;
        let index = self.index.as_ref().unwrap().clone();

        let ra_zones = index.ra_zones();
        let step_rad = ZONE_STEP_DEG.to_radians();
        let bbox = cone_bounding_box(ra0, dec0, radius_rad);

        let zd_min = (bbox.spd_min / step_rad).floor().max(0.0) as usize;
        let zd_max = ((bbox.spd_max / step_rad).ceil() as usize).min(index.dec_zones() - 1);
        let zr_min = (bbox.ra_min / step_rad).floor() as i64;
        let zr_max = (bbox.ra_max / step_rad).ceil() as i64;

        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => return Err(Error::io(&self.path, e)),
        };

        let mut out = Vec::new();
        'zd: for zd in zd_min..=zd_max {
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
                let seek_pos = self.data_offset + offset * RECORD_SIZE as u64;
                if file.seek(SeekFrom::Start(seek_pos)).is_err() {
                    break 'zd; // I/O failure reading the single data file: abort the query
                }
                if file.read_exact(&mut self.scratch[..byte_len]).is_err() {
                    break 'zd;
                }
                for chunk in self.scratch[..byte_len].chunks_exact(RECORD_SIZE) {
                    out.push(ReferenceStar::from(decode_record(chunk)));
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

    #[test]
    fn decode_roundtrips_fields() {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&42i32.to_le_bytes());
        buf[4..8].copy_from_slice(&99i32.to_le_bytes());
        let rec = decode_record(&buf);
        assert_eq!(rec.ra_mas, 42);
        assert_eq!(rec.spd_mas, 99);
    }

    #[test]
    fn cone_search_reads_single_file() {
        let (ra_zones, dec_zones) = zone_counts();
        let ra0 = 180.0;
        let dec0 = 0.0;
        let ra_mas = (ra0 * 3_600_000.0) as i32;
        let spd_mas = ((dec0 + 90.0) * 3_600_000.0) as i32;

        let zr = ((ra0 / ZONE_STEP_DEG) as usize) % ra_zones;
        let zd = (spd_mas as f64 / 3_600_000.0 / ZONE_STEP_DEG) as usize;

        let mut entries = vec![(0u32, 0u32); ra_zones * dec_zones];
        entries[zd * ra_zones + zr] = (0, 1);

        let mut file_bytes = Vec::new();
        for (offset, count) in &entries {
            file_bytes.extend_from_slice(&offset.to_le_bytes());
            file_bytes.extend_from_slice(&count.to_le_bytes());
        }
        let mut rec = [0u8; RECORD_SIZE];
        rec[0..4].copy_from_slice(&ra_mas.to_le_bytes());
        rec[4..8].copy_from_slice(&spd_mas.to_le_bytes());
        file_bytes.extend_from_slice(&rec);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tycho2.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&file_bytes).unwrap();
        drop(f);

        let mut cat = Tycho2Catalog::new(&path);
        let result = cat.cone_search(ra0, dec0, 5.0).unwrap();
        assert_eq!(result.len(), 1);
        assert!((result[0].ra_deg - ra0).abs() < 1e-6);
    }
}
