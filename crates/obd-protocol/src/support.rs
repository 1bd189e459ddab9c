//! Mode 01 PID-support bitmaps (`0100`, `0120`, ... `0180`)

use crate::response;
use serde::{Deserialize, Serialize};

/// Block origins the adapter can be asked about
pub const SUPPORT_BLOCKS: [u8; 5] = [0x00, 0x20, 0x40, 0x60, 0x80];

/// One 32-PID support block.
///
/// Bit `31 - i` of `mask` answers "is PID `origin + i + 1` supported".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidSupportBitmap {
    origin: u8,
    mask: u32,
}

impl PidSupportBitmap {
    /// Create a bitmap for the block starting at `origin`
    pub fn new(origin: u8, mask: u32) -> Self {
        Self { origin, mask }
    }

    /// Parse the reply to `01<origin>`.
    ///
    /// Looks for `41<origin>` followed by exactly 8 hex digits on any line.
    /// With headers on, one trailing byte is allowed when it is the K-line
    /// checksum of the frame. Longer, shorter or non-hex runs are no data.
    pub fn parse(raw: &str, origin: u8) -> Option<Self> {
        let signature = format!("41{origin:02X}");
        response::lines(raw).iter().find_map(|line| {
            let start = line.find(&signature)?;
            let end = start + signature.len();
            let data = &line[end..];
            if !data.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            let bytes = response::hex_bytes(data);
            match data.len() {
                8 => {}
                10 if start > 0 && frame_checksum(&line[..end + 8]) == Some(bytes[4]) => {}
                _ => return None,
            }
            let mask = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            Some(Self::new(origin, mask))
        })
    }

    /// Block origin (0x00, 0x20, ...)
    pub fn origin(&self) -> u8 {
        self.origin
    }

    /// Raw 32-bit mask
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Whether absolute PID `pid` is supported according to this block.
    /// PIDs outside the block are reported unsupported.
    pub fn supports(&self, pid: u8) -> bool {
        let origin = self.origin as u16;
        let pid = pid as u16;
        if pid <= origin || pid > origin + 32 {
            return false;
        }
        let bit = 31 - (pid - origin - 1);
        self.mask & (1 << bit) != 0
    }

    /// Whether the next block (`origin + 0x20`) is advertised
    pub fn next_block_supported(&self) -> bool {
        self.mask & 1 != 0
    }

    /// All supported absolute PIDs in this block
    pub fn supported_pids(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=32u16)
            .map(move |offset| self.origin as u16 + offset)
            .filter(|pid| *pid <= 0xFF)
            .map(|pid| pid as u8)
            .filter(move |pid| self.supports(*pid))
    }

    /// Supported PIDs as Mode 01 request codes (`"010C"`)
    pub fn pid_codes(&self) -> Vec<String> {
        self.supported_pids().map(|pid| format!("01{pid:02X}")).collect()
    }
}

/// Byte sum of a whole hex frame, `None` for odd-length text
fn frame_checksum(hex: &str) -> Option<u8> {
    (hex.len() % 2 == 0)
        .then(|| response::hex_bytes(hex).iter().fold(0u8, |acc, b| acc.wrapping_add(*b)))
}

/// Normalise a Mode 01 PID code: `"010c"`, `"0C"` and `"0x0C"` all map to
/// `Some(0x0C)`. Other modes return `None`.
pub fn mode01_pid(code: &str) -> Option<u8> {
    let code = code.trim().trim_start_matches("0x").to_ascii_uppercase();
    match code.len() {
        2 => u8::from_str_radix(&code, 16).ok(),
        4 if code.starts_with("01") => u8::from_str_radix(&code[2..], 16).ok(),
        _ => None,
    }
}
