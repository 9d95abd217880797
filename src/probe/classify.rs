//! Maps source errors onto the failure taxonomy.

use regex::Regex;
use std::io;
use std::sync::OnceLock;

use super::ProbeError;
use crate::monitor::FailureKind;
use crate::rtsp::{RtspError, SourceFault};

/// `EMFILE` and `ENFILE`.
const FD_EXHAUSTED: [i32; 2] = [24, 23];

/// Classify an RTSP source error, by category first and by message text
/// when the category says nothing useful.
pub fn classify_rtsp_error(err: RtspError) -> ProbeError {
    match err {
        RtspError::Io(e) => classify_io(&e),
        RtspError::Url(msg) => ProbeError::InvalidAddress(msg),
        RtspError::Resolve { .. } => ProbeError::InvalidAddress(err.to_string()),
        RtspError::Library(msg) => ProbeError::Resource(msg),
        RtspError::Pipeline(msg) => classify_text(&msg),
        RtspError::Source { fault, message } => classify_fault(fault, message),
        RtspError::Eos | RtspError::Closed => ProbeError::Interrupted(err.to_string()),
    }
}

fn classify_fault(fault: SourceFault, message: String) -> ProbeError {
    match fault {
        SourceFault::NotAuthorized => ProbeError::Unauthorized(message),
        SourceFault::NoResources => ProbeError::Resource(message),
        SourceFault::NotFound => match kind_from_text(&message) {
            FailureKind::Unknown => ProbeError::Protocol(message),
            _ => classify_text(&message),
        },
        SourceFault::ReadFailed => match kind_from_text(&message) {
            FailureKind::Unknown => ProbeError::Interrupted(message),
            _ => classify_text(&message),
        },
        SourceFault::OpenFailed | SourceFault::Other => classify_text(&message),
    }
}

fn classify_io(e: &io::Error) -> ProbeError {
    let msg = e.to_string();
    if e.raw_os_error().is_some_and(|code| FD_EXHAUSTED.contains(&code)) {
        return ProbeError::Resource(msg);
    }
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ProbeError::Refused(msg),
        io::ErrorKind::TimedOut => ProbeError::Timeout(msg),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
            ProbeError::InvalidAddress(msg)
        }
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ProbeError::Interrupted(msg),
        _ => classify_text(&msg),
    }
}

/// Best-effort classification from an error message.
pub fn classify_text(message: &str) -> ProbeError {
    let msg = message.to_string();
    match kind_from_text(message) {
        FailureKind::Timeout => ProbeError::Timeout(msg),
        FailureKind::Refused => ProbeError::Refused(msg),
        FailureKind::Unauthorized => ProbeError::Unauthorized(msg),
        FailureKind::InvalidAddress => ProbeError::InvalidAddress(msg),
        FailureKind::ProtocolError => ProbeError::Protocol(msg),
        FailureKind::Unknown => ProbeError::Network(msg),
    }
}

/// Match well-known error phrases. Order matters: the first hit wins.
pub fn kind_from_text(message: &str) -> FailureKind {
    static PATTERNS: OnceLock<Vec<(Regex, FailureKind)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (
                r"(?i)timed?\s*out|timeout|could not receive any",
                FailureKind::Timeout,
            ),
            (r"(?i)refused", FailureKind::Refused),
            (
                r"(?i)\b40[13]\b|unauthori[sz]ed|forbidden|authentication",
                FailureKind::Unauthorized,
            ),
            (
                r"(?i)invalid (url|address|argument)|name or service not known|no such host|failed to lookup|nodename nor servname",
                FailureKind::InvalidAddress,
            ),
            (
                r"(?i)protocol not found|\b404\b|not found|unsupported|malformed",
                FailureKind::ProtocolError,
            ),
        ]
        .into_iter()
        .map(|(re, kind)| (Regex::new(re).unwrap(), kind))
        .collect()
    });

    patterns
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, kind)| *kind)
        .unwrap_or(FailureKind::Unknown)
}
