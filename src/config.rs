//! Runtime configuration: a single TOML file validated before the pipeline starts.

use std::path::{Path, PathBuf};

use crate::error::Error;

//tp SiteConfig
/// Observing-site geometry, used for bookkeeping only (no atmospheric model lives here).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SiteConfig {
    pub lon: f64,
    pub lat: f64,
    pub alt: f64,
    pub tz: i32,
}

//tp ReductionConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReductionConfig {
    pub path_exe: PathBuf,
    pub path_config: PathBuf,
}

//tp AstrometryConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AstrometryConfig {
    pub enable: bool,
    pub path_exe: PathBuf,
    pub scale_low: f64,
    pub scale_high: f64,
}

//tp PhotometryConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PhotometryConfig {
    pub enable: bool,
    pub catalog_path: PathBuf,
}

//tp OutputConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OutputConfig {
    pub path: PathBuf,
}

//tp WorkConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WorkConfig {
    pub path: PathBuf,
}

//tp DbConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DbConfig {
    pub enable: bool,
    #[serde(default)]
    pub url: String,
}

//tp GcConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GcConfig {
    pub enable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

//tp FsConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FsConfig {
    pub enable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

//tp BadMarkConfig
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BadMarkConfig {
    pub path: PathBuf,
}

//tp Config
/// The top-level configuration document; field names match §6 of the pipeline
/// specification one-for-one (`site.*`, `reduction.*`, `astrometry.*`, ...).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub site: SiteConfig,
    pub reduction: ReductionConfig,
    pub astrometry: AstrometryConfig,
    pub photometry: PhotometryConfig,
    pub output: OutputConfig,
    pub work: WorkConfig,
    pub db: DbConfig,
    pub gc: GcConfig,
    pub fs: FsConfig,
    pub bad_mark: BadMarkConfig,
}

//ip Config
impl Config {
    //fp from_path
    /// Read and validate a configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    //mp validate
    /// Check cross-field constraints a plain deserialize cannot express
    pub fn validate(&self) -> Result<(), Error> {
        if self.astrometry.enable && self.astrometry.scale_low >= self.astrometry.scale_high {
            return Err(Error::InvalidInput(format!(
                "astrometry.scale_low ({}) must be less than astrometry.scale_high ({})",
                self.astrometry.scale_low, self.astrometry.scale_high
            )));
        }
        if self.photometry.enable && self.photometry.catalog_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput(
                "photometry.catalog_path must be set when photometry.enable is true".into(),
            ));
        }
        if self.db.enable && self.db.url.is_empty() {
            return Err(Error::InvalidInput(
                "db.url must be set when db.enable is true".into(),
            ));
        }
        if self.gc.enable && self.gc.host.is_empty() {
            return Err(Error::InvalidInput(
                "gc.host must be set when gc.enable is true".into(),
            ));
        }
        if self.fs.enable && self.fs.host.is_empty() {
            return Err(Error::InvalidInput(
                "fs.host must be set when fs.enable is true".into(),
            ));
        }
        Ok(())
    }
}

//a Tests
#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
[site]
lon = 117.57
lat = 40.39
alt = 960.0
tz = 8

[reduction]
path_exe = "/usr/bin/sex"
path_config = "/etc/sex.cfg"

[astrometry]
enable = true
path_exe = "/usr/bin/solve-field"
scale_low = 1.0
scale_high = 2.0

[photometry]
enable = true
catalog_path = "/data/ucac4"

[output]
path = "/data/output"

[work]
path = "/dev/shm"

[db]
enable = false

[gc]
enable = false

[fs]
enable = false

[bad_mark]
path = "/etc/badmark.txt"
"#
    }

    #[test]
    fn parses_well_formed_config() {
        let cfg: Config = toml::from_str(sample()).unwrap();
        assert!(cfg.astrometry.enable);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_scale_bounds() {
        let mut cfg: Config = toml::from_str(sample()).unwrap();
        cfg.astrometry.scale_low = 5.0;
        cfg.astrometry.scale_high = 1.0;
        assert!(cfg.validate().is_err());
    }
}
