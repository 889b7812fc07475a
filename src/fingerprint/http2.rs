//! HTTP/2 fingerprint parameters.
//!
//! The Akamai HTTP/2 fingerprint is built from the SETTINGS frame (ids,
//! values and their order), the connection-level WINDOW_UPDATE sent right
//! after it, and the order of the request pseudo-headers.

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;
pub const SETTINGS_NO_RFC7540_PRIORITIES: u16 = 0x9;

/// Initial window size per RFC 9113.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// One request pseudo-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    Method,
    Authority,
    Scheme,
    Path,
}

impl PseudoHeader {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Method => ":method",
            Self::Authority => ":authority",
            Self::Scheme => ":scheme",
            Self::Path => ":path",
        }
    }

    fn letter(&self) -> char {
        match self {
            Self::Method => 'm',
            Self::Authority => 'a',
            Self::Scheme => 's',
            Self::Path => 'p',
        }
    }
}

use PseudoHeader::{Authority as A, Method as M, Path as P, Scheme as S};

/// Chromium order: m,a,s,p
pub const CHROMIUM_PSEUDO_ORDER: [PseudoHeader; 4] = [M, A, S, P];
/// Gecko order: m,p,a,s
pub const GECKO_PSEUDO_ORDER: [PseudoHeader; 4] = [M, P, A, S];
/// WebKit order: m,s,a,p
pub const WEBKIT_PSEUDO_ORDER: [PseudoHeader; 4] = [M, S, A, P];

/// HTTP/2 connection fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Profile {
    /// SETTINGS sent in the preface, in wire order.
    pub settings: &'static [(u16, u32)],
    /// Connection-level WINDOW_UPDATE increment sent after SETTINGS.
    pub window_update: u32,
    /// Order of the four request pseudo-headers.
    pub pseudo_order: [PseudoHeader; 4],
}

impl Http2Profile {
    pub fn setting(&self, id: u16) -> Option<u32> {
        self.settings.iter().find(|(k, _)| *k == id).map(|(_, v)| *v)
    }

    /// Our per-stream receive window.
    pub fn initial_window_size(&self) -> u32 {
        self.setting(SETTINGS_INITIAL_WINDOW_SIZE)
            .unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Dynamic table size we allow the peer's encoder to use.
    pub fn header_table_size(&self) -> u32 {
        self.setting(SETTINGS_HEADER_TABLE_SIZE)
            .unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    /// Largest frame payload we accept.
    pub fn max_frame_size(&self) -> u32 {
        self.setting(SETTINGS_MAX_FRAME_SIZE)
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Our connection receive window after the preface WINDOW_UPDATE.
    pub fn connection_window(&self) -> u32 {
        DEFAULT_INITIAL_WINDOW_SIZE.saturating_add(self.window_update)
    }

    /// Akamai fingerprint: `settings|window_update|priority|pseudo_order`.
    pub fn akamai_string(&self) -> String {
        let settings: Vec<String> = self
            .settings
            .iter()
            .map(|(id, v)| format!("{}:{}", id, v))
            .collect();
        let order: Vec<String> = self.pseudo_order.iter().map(|p| p.letter().to_string()).collect();
        format!(
            "{}|{}|0|{}",
            settings.join(";"),
            self.window_update,
            order.join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: Http2Profile = Http2Profile {
        settings: &[
            (SETTINGS_HEADER_TABLE_SIZE, 65536),
            (SETTINGS_ENABLE_PUSH, 0),
            (SETTINGS_INITIAL_WINDOW_SIZE, 6291456),
            (SETTINGS_MAX_HEADER_LIST_SIZE, 262144),
        ],
        window_update: 15663105,
        pseudo_order: CHROMIUM_PSEUDO_ORDER,
    };

    #[test]
    fn test_akamai_string() {
        assert_eq!(
            SAMPLE.akamai_string(),
            "1:65536;2:0;4:6291456;6:262144|15663105|0|m,a,s,p"
        );
    }

    #[test]
    fn test_defaults_when_setting_absent() {
        assert_eq!(SAMPLE.initial_window_size(), 6291456);
        assert_eq!(SAMPLE.max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(SAMPLE.connection_window(), 65535 + 15663105);
    }
}
