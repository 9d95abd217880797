//! streamstress - RTSP stream stress testing.
//!
//! Opens many concurrent RTSP sessions against one or more cameras, keeps
//! them alive through failures, and reports per-stream frame rate, loss,
//! reconnects and connect latency alongside host resource usage.

pub mod config;
pub mod db;
pub mod logging;
pub mod monitor;
pub mod probe;
pub mod report;
pub mod rtsp;
