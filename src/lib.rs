/*!
A wide-field survey image-reduction pipeline: frame ingestion, source
extraction, astrometric plate solving against a reference star catalog, and
multi-hypothesis association of moving detections into tracks.
 */

pub mod associator;
pub mod config;
pub mod error;
pub mod frame;
pub mod processor;
pub mod refcat;
pub mod support;
pub mod tnx;

pub use associator::{Associator, RollingShutter, Track};
pub use config::Config;
pub use error::Error;
pub use frame::{DetectedSource, Frame, FrameState};
pub use processor::{NotificationSink, Processor};
pub use refcat::{ReferenceCatalog, ReferenceStar};
pub use tnx::TnxModel;
