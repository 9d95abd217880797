//! Connector backed by GStreamer's RTSP source.

use async_trait::async_trait;

use super::{classify_rtsp_error, Connector, MediaSession, ProbeError};
use crate::config::Settings;
use crate::monitor::StreamTarget;
use crate::rtsp::{Frame, RtspSource, RtspUrl, SourceOptions};

/// Opens real RTSP sessions.
#[derive(Debug, Clone)]
pub struct RtspConnector {
    options: SourceOptions,
}

impl RtspConnector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            options: SourceOptions {
                timeout: settings.connect_timeout,
                latency: settings.jitter_latency,
                udp_recv_buffer: settings.udp_recv_buffer,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl Connector for RtspConnector {
    async fn connect(&self, target: &StreamTarget) -> Result<Box<dyn MediaSession>, ProbeError> {
        let url = RtspUrl::parse(&target.address).map_err(classify_rtsp_error)?;
        url.check_reachable().await.map_err(classify_rtsp_error)?;

        let options = SourceOptions {
            transport: target.transport,
            ..self.options.clone()
        };
        let source = RtspSource::open(&url, &options).map_err(classify_rtsp_error)?;
        Ok(Box::new(source))
    }
}

#[async_trait]
impl MediaSession for RtspSource {
    fn declared_fps(&self) -> Option<f64> {
        RtspSource::declared_fps(self)
    }

    async fn next_frame(&mut self) -> Result<Frame, ProbeError> {
        RtspSource::next_frame(self).await.map_err(classify_rtsp_error)
    }

    async fn close(&mut self) {
        self.shutdown().await;
    }
}
