//! ELM327 Response Parsing
//!
//! Helpers that turn raw adapter text into bytes. Adapter output is treated as
//! untrusted: every function here returns `None`/empty on garbage instead of
//! failing.

use crate::mode;
use crate::protocol::BusClass;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Uppercase and strip whitespace and the `>` prompt.
pub fn clean(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '>')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Split a response into cleaned, non-empty lines.
pub fn lines(raw: &str) -> Vec<String> {
    raw.split(['\r', '\n'])
        .map(clean)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Empty, `NO DATA` or `?`: the normal "nothing to report" replies.
pub fn is_no_data(raw: &str) -> bool {
    let cleaned = clean(raw);
    cleaned.is_empty() || cleaned == "?" || cleaned.contains("NODATA")
}

/// The adapter is still bringing the bus up (`BUS INIT: ...`, `STOPPED`, `SEARCHING...`).
pub fn is_busy(raw: &str) -> bool {
    let cleaned = clean(raw);
    if cleaned.contains("ERROR") {
        return false;
    }
    cleaned.contains("BUSINIT") || cleaned.contains("STOPPED") || cleaned.contains("SEARCHING")
}

/// The selected protocol could not reach any ECU.
pub fn is_bus_error(raw: &str) -> bool {
    let cleaned = clean(raw);
    cleaned.contains("UNABLETOCONNECT")
        || cleaned.contains("ERROR")
        || cleaned.contains("BUSBUSY")
        || cleaned.contains("LVRESET")
}

/// Anything that is not a data-bearing reply.
pub fn is_error_reply(raw: &str) -> bool {
    is_no_data(raw) || is_bus_error(raw) || clean(raw).contains("STOPPED")
}

/// Decode consecutive hex digit pairs. Trailing odd digits and non-hex
/// characters end the run.
pub fn hex_bytes(hex: &str) -> Vec<u8> {
    let digits: Vec<u8> = hex
        .bytes()
        .take_while(|b| b.is_ascii_hexdigit())
        .collect();
    digits
        .chunks_exact(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok())
        .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
        .collect()
}

/// Locate `signature` in any line of the response and return the `count`
/// data bytes that follow it. Header bytes in front of the signature are
/// ignored; trailing bytes (K-line checksums) are ignored too.
pub fn data_after(raw: &str, signature: &str, count: usize) -> Option<Vec<u8>> {
    let signature = signature.to_ascii_uppercase();
    lines(raw).into_iter().find_map(|line| {
        let start = line.find(&signature)? + signature.len();
        let bytes = hex_bytes(&line[start..]);
        (bytes.len() >= count).then(|| bytes[..count].to_vec())
    })
}

/// Strip the ISO-TP frame index prefix (`0:`, `1:`, ...) that the ELM327
/// prints for multi-frame CAN replies with headers off.
fn strip_frame_index(line: &str) -> &str {
    match line.find(':') {
        Some(idx) if idx <= 2 && line[..idx].bytes().all(|b| b.is_ascii_hexdigit()) => {
            &line[idx + 1..]
        }
        _ => line,
    }
}

/// Data bytes of a Mode 09 reply, with service echo, item counters, frame
/// indices and CAN headers removed as far as they can be recognised.
pub fn mode09_payload(raw: &str, pid: u8) -> Vec<u8> {
    let echo = format!("49{pid:02X}");
    let mut payload = Vec::new();

    for line in lines(raw) {
        let body = strip_frame_index(&line);
        let hex: String = body.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        // ISO-TP length lines ("014") carry no data
        if hex.len() < 6 {
            continue;
        }
        let data = if let Some(idx) = hex.find(&echo) {
            // skip the echo and the item counter byte
            hex.get(idx + echo.len() + 2..).unwrap_or("")
        } else if hex.len() % 2 == 1 {
            // 11-bit header plus PCI byte on a consecutive frame
            hex.get(5..).unwrap_or("")
        } else {
            hex.as_str()
        };
        payload.extend(hex_bytes(data));
    }

    payload
}

/// Printable ASCII characters of a byte payload, everything else dropped.
fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|b| *b as char)
        .collect()
}

/// Extract a VIN from a Mode 09 PID 02 reply: the first run of 17
/// alphanumeric characters among the printable payload bytes.
pub fn parse_vin(raw: &str) -> Option<String> {
    let text = printable(&mode09_payload(raw, 0x02));
    let mut run = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            run.push(c);
            if run.len() == 17 {
                return Some(run.to_ascii_uppercase());
            }
        } else {
            run.clear();
        }
    }
    None
}

/// Calibration IDs from a Mode 09 PID 04 reply. Each CALID is up to 16
/// characters, padded with NUL bytes.
pub fn parse_calibration_ids(raw: &str) -> Vec<String> {
    let payload = mode09_payload(raw, 0x04);
    payload
        .chunks(16)
        .map(|chunk| {
            printable(chunk)
                .trim()
                .chars()
                .filter(|c| c.is_ascii_graphic())
                .collect::<String>()
        })
        .filter(|calid| calid.len() >= 4)
        .collect()
}

/// Which trouble-code list to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcKind {
    /// Mode 03: confirmed codes
    Stored,
    /// Mode 07: pending codes
    Pending,
    /// Mode 0A: permanent codes
    Permanent,
}

impl DtcKind {
    /// Request mode byte
    pub fn mode(&self) -> u8 {
        match self {
            DtcKind::Stored => mode::READ_DTC,
            DtcKind::Pending => mode::PENDING_DTC,
            DtcKind::Permanent => mode::PERMANENT_DTC,
        }
    }

    /// Request string sent to the adapter
    pub fn command(&self) -> String {
        format!("{:02X}", self.mode())
    }

    /// Positive response service byte
    pub fn response_sid(&self) -> u8 {
        self.mode() + 0x40
    }
}

/// A diagnostic trouble code such as `P0420`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dtc {
    /// Five character code
    pub code: String,
}

impl Dtc {
    /// Decode a 16-bit DTC word. Zero and `0xFFFF` are padding.
    pub fn from_word(word: u16) -> Option<Self> {
        if word == 0x0000 || word == 0xFFFF {
            return None;
        }
        let system = match word >> 14 {
            0 => 'P',
            1 => 'C',
            2 => 'B',
            _ => 'U',
        };
        Some(Self {
            code: format!("{system}{:04X}", word & 0x3FFF),
        })
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// Parse a Mode 03/07/0A reply.
///
/// CAN replies carry a code count after the service byte; K-line replies
/// repeat the service byte on every frame with three codes each.
pub fn parse_dtcs(raw: &str, kind: DtcKind, bus: BusClass) -> Vec<Dtc> {
    let sid = format!("{:02X}", kind.response_sid());
    let mut data = Vec::new();

    if bus.is_can() {
        let mut joined = String::new();
        for line in lines(raw) {
            let body = strip_frame_index(&line);
            if body.len() < 4 && !body.starts_with(&sid) {
                continue;
            }
            joined.extend(body.chars().filter(|c| c.is_ascii_hexdigit()));
        }
        if let Some(idx) = joined.find(&sid) {
            // service byte, then count byte
            data = hex_bytes(joined.get(idx + 4..).unwrap_or(""));
        }
    } else {
        for line in lines(raw) {
            if let Some(idx) = line.find(&sid) {
                let mut bytes = hex_bytes(&line[idx + 2..]);
                bytes.truncate(6);
                data.extend(bytes);
            }
        }
    }

    data.chunks_exact(2)
        .filter_map(|pair| Dtc::from_word(u16::from_be_bytes([pair[0], pair[1]])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clean_and_no_data() {
        assert_eq!(clean(" 41 0c 1a f8 \r\r>"), "410C1AF8");
        assert!(is_no_data("NO DATA\r\r>"));
        assert!(is_no_data("?"));
        assert!(is_no_data(""));
        assert!(!is_no_data("410C1AF8"));
    }

    #[test]
    fn test_busy_and_bus_errors() {
        assert!(is_busy("BUS INIT: ..."));
        assert!(is_busy("STOPPED"));
        assert!(!is_busy("BUS INIT: ...ERROR"));
        assert!(is_bus_error("BUS INIT: ...ERROR"));
        assert!(is_bus_error("SEARCHING...\rUNABLE TO CONNECT"));
        assert!(is_bus_error("CAN ERROR"));
        assert!(!is_bus_error("NO DATA"));
    }

    #[test]
    fn test_data_after_ignores_headers() {
        assert_eq!(data_after("7E8 04 41 0C 1A F8", "410C", 2), Some(vec![0x1A, 0xF8]));
        assert_eq!(data_after("410C1A", "410C", 2), None);
        assert_eq!(data_after("NO DATA", "410C", 2), None);
    }

    #[test]
    fn test_vin_can_multiframe_headers_off() {
        let raw = "014\r0:490201314641\r1:44503346323045\r2:4C313233343536\r\r>";
        assert_eq!(parse_vin(raw).as_deref(), Some("1FADP3F20EL123456"));
    }

    #[test]
    fn test_vin_can_multiframe_headers_on() {
        let raw = "7E8101449020131464\r7E82144503346323045\r7E8224C313233343536";
        // first frame is truncated by one digit, so the VIN cannot be completed
        assert_eq!(parse_vin(raw), None);

        let raw = "7E81014490201314641\r7E82144503346323045\r7E8224C313233343536";
        assert_eq!(parse_vin(raw).as_deref(), Some("1FADP3F20EL123456"));
    }

    #[test]
    fn test_vin_kline_frames() {
        let raw = "490201000000 31\r49020246414450\r49020333463230\r490204454C3132\r49020533343536";
        assert_eq!(parse_vin(raw).as_deref(), Some("1FADP3F20EL123456"));
    }

    #[test]
    fn test_vin_absent() {
        assert_eq!(parse_vin("NO DATA"), None);
        assert_eq!(parse_vin("4902013132"), None);
    }

    #[test]
    fn test_calibration_ids() {
        let raw = "013\r0:490401314132\r1:42433030303030\r2:30303000000000";
        assert_eq!(parse_calibration_ids(raw), vec!["1A2BC00000000".to_string()]);
    }

    #[test]
    fn test_dtc_word_decoding() {
        assert_eq!(Dtc::from_word(0x0133).unwrap().code, "P0133");
        assert_eq!(Dtc::from_word(0x4123).unwrap().code, "C0123");
        assert_eq!(Dtc::from_word(0x9234).unwrap().code, "B1234");
        assert_eq!(Dtc::from_word(0xC156).unwrap().code, "U0156");
        assert_eq!(Dtc::from_word(0x0000), None);
        assert_eq!(Dtc::from_word(0xFFFF), None);
    }

    #[test]
    fn test_parse_dtcs_can() {
        let codes = parse_dtcs("43020133042000\r\r>", DtcKind::Stored, BusClass::Can);
        let codes: Vec<_> = codes.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["P0133", "P0420"]);

        assert!(parse_dtcs("4300", DtcKind::Stored, BusClass::Can).is_empty());
    }

    #[test]
    fn test_parse_dtcs_can_multiframe() {
        let raw = "00A\r0:430401330420\r1:0102FFFF000000";
        let codes: Vec<_> = parse_dtcs(raw, DtcKind::Stored, BusClass::Can)
            .into_iter()
            .map(|d| d.code)
            .collect();
        assert_eq!(codes, vec!["P0133", "P0420", "P0102"]);
    }

    #[test]
    fn test_parse_dtcs_kline() {
        let raw = "43 01 33 04 20 00 00\r43 C1 56 00 00 00 00";
        let codes: Vec<_> = parse_dtcs(raw, DtcKind::Stored, BusClass::IsoKwp)
            .into_iter()
            .map(|d| d.code)
            .collect();
        assert_eq!(codes, vec!["P0133", "P0420", "U0156"]);
    }

    #[test]
    fn test_pending_dtc_signature() {
        let codes = parse_dtcs("47010300", DtcKind::Pending, BusClass::Can);
        assert_eq!(codes, vec![Dtc { code: "P0300".into() }]);
        assert_eq!(DtcKind::Permanent.command(), "0A");
    }

    proptest! {
        #[test]
        fn parsers_never_panic(raw in "[ -~\r\n]{0,80}") {
            let _ = parse_vin(&raw);
            let _ = parse_calibration_ids(&raw);
            let _ = parse_dtcs(&raw, DtcKind::Stored, BusClass::Can);
            let _ = parse_dtcs(&raw, DtcKind::Stored, BusClass::IsoKwp);
            let _ = data_after(&raw, "410C", 2);
        }
    }
}
