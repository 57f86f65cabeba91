//! Textual session description handling.
//!
//! The negotiated session description is an opaque, newline-delimited
//! document owned by the negotiation capability. This module only applies
//! the two best-effort rewrites the diagnostics need: removing video
//! forward error correction and capping the video bitrate. Both are
//! no-ops when the expected pattern is absent.

use std::fmt;

const FEC_RED_RTPMAP: &str = "a=rtpmap:116 red/90000";
const FEC_ULPFEC_RTPMAP: &str = "a=rtpmap:117 ulpfec/90000";
const VIDEO_MLINE: &str = "m=video";
const VIDEO_MID: &str = "a=mid:video";

/// A negotiated session description document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    sdp: String,
}

impl SessionDescription {
    /// Wraps a session description document.
    pub fn new(sdp: impl Into<String>) -> SessionDescription {
        SessionDescription { sdp: sdp.into() }
    }

    /// The document text.
    pub fn as_str(&self) -> &str {
        &self.sdp
    }

    /// Removes the video FEC payloads (RED and ULPFEC) from the document.
    ///
    /// FEC disturbs bandwidth estimation measurements, so the bandwidth
    /// probe strips it from the offer. No-op if the payloads are absent.
    pub fn remove_video_fec(&mut self) {
        if !self.sdp.contains(FEC_RED_RTPMAP) && !self.sdp.contains(FEC_ULPFEC_RTPMAP) {
            return;
        }

        let lines: Vec<String> = self
            .lines()
            .filter(|l| *l != FEC_RED_RTPMAP && *l != FEC_ULPFEC_RTPMAP)
            .map(|l| {
                if l.starts_with(VIDEO_MLINE) {
                    strip_payloads(l, &["116", "117"])
                } else {
                    l.to_string()
                }
            })
            .collect();

        self.sdp = lines.join("\r\n");
    }

    /// Caps the video bitrate by inserting a `b=AS:` bandwidth line after
    /// the video media identification. No-op if the document has no
    /// `a=mid:video` line.
    pub fn constrain_video_bitrate(&mut self, max_kbps: u32) {
        if !self.lines().any(|l| l == VIDEO_MID) {
            return;
        }

        let mut lines: Vec<String> = Vec::new();
        for line in self.lines() {
            let is_mid = line == VIDEO_MID;
            lines.push(line.to_string());
            if is_mid {
                lines.push(format!("b=AS:{max_kbps}"));
            }
        }

        self.sdp = lines.join("\r\n");
    }

    fn lines(&self) -> impl Iterator<Item = &str> {
        self.sdp.split("\r\n")
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sdp)
    }
}

/// Remove the given payload ids from the format list of an m= line.
/// The first three fields (media, port, proto) are never payload ids.
fn strip_payloads(mline: &str, payloads: &[&str]) -> String {
    let kept: Vec<&str> = mline
        .split(' ')
        .enumerate()
        .filter(|(i, f)| *i < 3 || !payloads.contains(f))
        .map(|(_, f)| f)
        .collect();
    kept.join(" ")
}
