//! RTSP media through GStreamer.
//!
//! Each session is an `rtspsrc ! appsink` pipeline. The library does the
//! control handshake, RTP delivery and depacketizing; this module only counts
//! what reaches the sink and relays what the bus reports.

mod source;
#[cfg(test)]
pub(crate) mod testing;
mod url;

pub use source::*;
pub use url::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Default RTSP port when the URL does not name one.
pub const DEFAULT_PORT: u16 = 554;

/// RTSP source error types.
#[derive(Error, Debug)]
pub enum RtspError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    Url(String),
    #[error("address resolution failed for {host}: {reason}")]
    Resolve { host: String, reason: String },
    /// GStreamer or one of the required elements is missing.
    #[error("media library unavailable: {0}")]
    Library(String),
    #[error("pipeline error: {0}")]
    Pipeline(String),
    /// An error posted on the pipeline bus.
    #[error("{message}")]
    Source { fault: SourceFault, message: String },
    #[error("end of stream")]
    Eos,
    #[error("source stopped")]
    Closed,
}

/// Coarse category of a bus error, taken from the GStreamer error domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFault {
    NotAuthorized,
    NotFound,
    OpenFailed,
    ReadFailed,
    NoResources,
    Other,
}

impl SourceFault {
    pub fn from_error(error: &gst::glib::Error) -> Self {
        use gst::ResourceError;

        match error.kind::<ResourceError>() {
            Some(ResourceError::NotAuthorized) => SourceFault::NotAuthorized,
            Some(ResourceError::NotFound) => SourceFault::NotFound,
            Some(ResourceError::OpenRead | ResourceError::OpenWrite | ResourceError::OpenReadWrite) => {
                SourceFault::OpenFailed
            }
            Some(ResourceError::Read | ResourceError::Write | ResourceError::Sync) => {
                SourceFault::ReadFailed
            }
            Some(ResourceError::NoSpaceLeft) => SourceFault::NoResources,
            _ => SourceFault::Other,
        }
    }
}

/// How RTP is delivered once the session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// RTP interleaved on the RTSP control connection.
    #[default]
    Tcp,
    /// RTP on a separate best-effort UDP socket pair.
    Udp,
}

impl Transport {
    /// The `rtspsrc` lower transport allowed for this mode.
    pub fn lower_trans(self) -> gst_rtsp::RTSPLowerTrans {
        match self {
            Transport::Tcp => gst_rtsp::RTSPLowerTrans::TCP,
            Transport::Udp => gst_rtsp::RTSPLowerTrans::UDP,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// Initialize GStreamer once per process.
pub fn init() -> Result<(), RtspError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| {
        gst::init().map_err(|e| e.to_string())?;
        tracing::info!("GStreamer: {}", gst::version_string());
        Ok(())
    })
    .clone()
    .map_err(RtspError::Library)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_parse() {
        assert_eq!("TCP".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("udp".parse::<Transport>().unwrap(), Transport::Udp);
        assert!("quic".parse::<Transport>().is_err());
        assert_eq!(Transport::Udp.to_string(), "udp");
    }

    #[test]
    fn test_transport_restricts_lower_transport() {
        assert_eq!(Transport::Tcp.lower_trans(), gst_rtsp::RTSPLowerTrans::TCP);
        assert!(!Transport::Udp
            .lower_trans()
            .contains(gst_rtsp::RTSPLowerTrans::TCP));
    }

    #[test]
    fn test_fault_from_error_domain() {
        let denied = gst::glib::Error::new(gst::ResourceError::NotAuthorized, "Unauthorized");
        assert_eq!(SourceFault::from_error(&denied), SourceFault::NotAuthorized);

        let missing = gst::glib::Error::new(gst::ResourceError::NotFound, "Not Found");
        assert_eq!(SourceFault::from_error(&missing), SourceFault::NotFound);

        let open = gst::glib::Error::new(gst::ResourceError::OpenReadWrite, "Could not open");
        assert_eq!(SourceFault::from_error(&open), SourceFault::OpenFailed);

        let stream = gst::glib::Error::new(gst::StreamError::Failed, "Internal data stream error");
        assert_eq!(SourceFault::from_error(&stream), SourceFault::Other);
    }
}
