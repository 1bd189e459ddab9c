//! OBD-II PID Definitions and Response Parsing
//!
//! Defines the Mode 01 Parameter IDs this crate understands and their SAE
//! J1979 decoding formulas. Each PID is one row in [`STANDARD_PIDS`]; a
//! [`StandardDecoder`] turns a raw adapter reply into a value and writes it
//! onto a [`CarData`] snapshot.

use crate::response;
use crate::snapshot::{c_to_f, kph_to_mph, kpa_to_psi, CarData};
use crate::support::PidSupportBitmap;

/// Decoder for one PID.
///
/// `parse` never fails: malformed input leaves the decoder without a value
/// and `apply_to` then does nothing.
pub trait PidDecoder: Send {
    /// Four-character request code (`"010C"`)
    fn pid(&self) -> &str;

    /// Decode a raw adapter reply, replacing any previous value
    fn parse(&mut self, raw: &str);

    /// Whether the last `parse` produced a value
    fn has_value(&self) -> bool;

    /// Write the decoded value(s) onto the snapshot
    fn apply_to(&self, data: &mut CarData);
}

/// Static description of a Mode 01 PID
pub struct PidSpec {
    /// Request code, uppercase
    pub code: &'static str,
    /// Human readable name
    pub name: &'static str,
    /// Native unit of the decoded value
    pub unit: &'static str,
    /// Number of data bytes in the reply
    pub bytes: usize,
    decode: fn(&[u8]) -> f64,
    apply: fn(&mut CarData, f64),
}

impl PidSpec {
    /// Apply the formula to exactly `self.bytes` data bytes
    pub fn decode(&self, bytes: &[u8]) -> Option<f64> {
        (bytes.len() >= self.bytes).then(|| (self.decode)(&bytes[..self.bytes]))
    }

    /// Reply signature: `"41"` followed by the PID byte
    pub fn signature(&self) -> String {
        format!("41{}", &self.code[2..])
    }
}

impl std::fmt::Debug for PidSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidSpec")
            .field("code", &self.code)
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("bytes", &self.bytes)
            .finish()
    }
}

fn word(b: &[u8]) -> f64 {
    (b[0] as f64) * 256.0 + b[1] as f64
}

fn percent(b: &[u8]) -> f64 {
    b[0] as f64 * 100.0 / 255.0
}

fn temperature(b: &[u8]) -> f64 {
    b[0] as f64 - 40.0
}

/// Every PID with a telemetry decoder
pub static STANDARD_PIDS: &[PidSpec] = &[
    PidSpec {
        code: "0104",
        name: "Calculated engine load",
        unit: "%",
        bytes: 1,
        decode: percent,
        apply: |d, v| d.engine_load_pct = Some(v),
    },
    PidSpec {
        code: "0105",
        name: "Engine coolant temperature",
        unit: "°C",
        bytes: 1,
        decode: temperature,
        apply: |d, v| {
            d.coolant_temp_c = Some(v);
            d.coolant_temp_f = Some(c_to_f(v));
        },
    },
    PidSpec {
        code: "010A",
        name: "Fuel pressure",
        unit: "kPa",
        bytes: 1,
        decode: |b| b[0] as f64 * 3.0,
        apply: |d, v| {
            d.fuel_pressure_kpa = Some(v);
            d.fuel_pressure_psi = Some(kpa_to_psi(v));
        },
    },
    PidSpec {
        code: "010B",
        name: "Intake manifold absolute pressure",
        unit: "kPa",
        bytes: 1,
        decode: |b| b[0] as f64,
        apply: |d, v| {
            d.map_kpa = Some(v);
            d.map_psi = Some(kpa_to_psi(v));
        },
    },
    PidSpec {
        code: "010C",
        name: "Engine speed",
        unit: "rpm",
        bytes: 2,
        decode: |b| word(b) / 4.0,
        apply: |d, v| d.rpm = Some(v),
    },
    PidSpec {
        code: "010D",
        name: "Vehicle speed",
        unit: "km/h",
        bytes: 1,
        decode: |b| b[0] as f64,
        apply: |d, v| {
            d.speed_kph = Some(v);
            d.speed_mph = Some(kph_to_mph(v));
        },
    },
    PidSpec {
        code: "010E",
        name: "Timing advance",
        unit: "°",
        bytes: 1,
        decode: |b| b[0] as f64 / 2.0 - 64.0,
        apply: |d, v| d.timing_advance_deg = Some(v),
    },
    PidSpec {
        code: "010F",
        name: "Intake air temperature",
        unit: "°C",
        bytes: 1,
        decode: temperature,
        apply: |d, v| {
            d.intake_air_temp_c = Some(v);
            d.intake_air_temp_f = Some(c_to_f(v));
        },
    },
    PidSpec {
        code: "0110",
        name: "Mass air flow",
        unit: "g/s",
        bytes: 2,
        decode: |b| word(b) / 100.0,
        apply: |d, v| d.maf_gps = Some(v),
    },
    PidSpec {
        code: "0111",
        name: "Throttle position",
        unit: "%",
        bytes: 1,
        decode: percent,
        apply: |d, v| d.throttle_pct = Some(v),
    },
    PidSpec {
        code: "011F",
        name: "Run time since engine start",
        unit: "s",
        bytes: 2,
        decode: word,
        apply: |d, v| d.run_time_s = Some(v),
    },
    PidSpec {
        code: "0121",
        name: "Distance traveled with MIL on",
        unit: "km",
        bytes: 2,
        decode: word,
        apply: |d, v| d.distance_with_mil_km = Some(v),
    },
    PidSpec {
        code: "0122",
        name: "Fuel rail pressure (relative to vacuum)",
        unit: "kPa",
        bytes: 2,
        decode: |b| word(b) * 0.079,
        apply: |d, v| d.fuel_rail_pressure_kpa = Some(v),
    },
    PidSpec {
        code: "0123",
        name: "Fuel rail gauge pressure",
        unit: "kPa",
        bytes: 2,
        decode: |b| word(b) * 10.0,
        apply: |d, v| {
            d.fuel_rail_gauge_kpa = Some(v);
            d.fuel_rail_gauge_psi = Some(kpa_to_psi(v));
        },
    },
    PidSpec {
        code: "012C",
        name: "Commanded EGR",
        unit: "%",
        bytes: 1,
        decode: percent,
        apply: |d, v| d.commanded_egr_pct = Some(v),
    },
    PidSpec {
        code: "012D",
        name: "EGR error",
        unit: "%",
        bytes: 1,
        decode: |b| b[0] as f64 * 100.0 / 128.0 - 100.0,
        apply: |d, v| d.egr_error_pct = Some(v),
    },
    PidSpec {
        code: "012E",
        name: "Commanded evaporative purge",
        unit: "%",
        bytes: 1,
        decode: percent,
        apply: |d, v| d.evap_purge_pct = Some(v),
    },
    PidSpec {
        code: "012F",
        name: "Fuel tank level",
        unit: "%",
        bytes: 1,
        decode: percent,
        apply: |d, v| d.fuel_level_pct = Some(v),
    },
    PidSpec {
        code: "0130",
        name: "Warm-ups since codes cleared",
        unit: "count",
        bytes: 1,
        decode: |b| b[0] as f64,
        apply: |d, v| d.warmups_since_clear = Some(v),
    },
    PidSpec {
        code: "0131",
        name: "Distance traveled since codes cleared",
        unit: "km",
        bytes: 2,
        decode: word,
        apply: |d, v| d.distance_since_clear_km = Some(v),
    },
    PidSpec {
        code: "0132",
        name: "Evap system vapor pressure",
        unit: "Pa",
        bytes: 2,
        decode: |b| i16::from_be_bytes([b[0], b[1]]) as f64 / 4.0,
        apply: |d, v| d.evap_vapor_pressure_pa = Some(v),
    },
    PidSpec {
        code: "0133",
        name: "Barometric pressure",
        unit: "kPa",
        bytes: 1,
        decode: |b| b[0] as f64,
        apply: |d, v| d.baro_kpa = Some(v),
    },
    PidSpec {
        code: "0142",
        name: "Control module voltage",
        unit: "V",
        bytes: 2,
        decode: |b| word(b) / 1000.0,
        apply: |d, v| d.control_module_voltage = Some(v),
    },
    PidSpec {
        code: "0146",
        name: "Ambient air temperature",
        unit: "°C",
        bytes: 1,
        decode: temperature,
        apply: |d, v| d.ambient_air_temp_c = Some(v),
    },
    PidSpec {
        code: "015C",
        name: "Engine oil temperature",
        unit: "°C",
        bytes: 1,
        decode: temperature,
        apply: |d, v| {
            d.oil_temp_c = Some(v);
            d.oil_temp_f = Some(c_to_f(v));
        },
    },
];

/// Look up a telemetry PID by request code (case-insensitive)
pub fn spec_for(code: &str) -> Option<&'static PidSpec> {
    STANDARD_PIDS
        .iter()
        .find(|spec| spec.code.eq_ignore_ascii_case(code.trim()))
}

/// Decoder driven by a [`PidSpec`] row
#[derive(Debug)]
pub struct StandardDecoder {
    spec: &'static PidSpec,
    value: Option<f64>,
}

impl StandardDecoder {
    /// Create a decoder for `spec`
    pub fn new(spec: &'static PidSpec) -> Self {
        Self { spec, value: None }
    }

    /// Last decoded value in the PID's native unit
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl PidDecoder for StandardDecoder {
    fn pid(&self) -> &str {
        self.spec.code
    }

    fn parse(&mut self, raw: &str) {
        self.value = response::data_after(raw, &self.spec.signature(), self.spec.bytes)
            .and_then(|bytes| self.spec.decode(&bytes));
    }

    fn has_value(&self) -> bool {
        self.value.is_some()
    }

    fn apply_to(&self, data: &mut CarData) {
        if let Some(value) = self.value {
            (self.spec.apply)(data, value);
            data.touch();
        }
    }
}

/// Decoder for the support-bitmap PIDs (`0100`, `0120`, ...). It informs
/// capability discovery and never writes telemetry.
#[derive(Debug)]
pub struct SupportBitmapDecoder {
    code: String,
    origin: u8,
    bitmap: Option<PidSupportBitmap>,
}

impl SupportBitmapDecoder {
    /// Decoder for the block starting at `origin`
    pub fn new(origin: u8) -> Self {
        Self {
            code: format!("01{origin:02X}"),
            origin,
            bitmap: None,
        }
    }

    /// The parsed bitmap, if the last reply was well formed
    pub fn bitmap(&self) -> Option<PidSupportBitmap> {
        self.bitmap
    }
}

impl PidDecoder for SupportBitmapDecoder {
    fn pid(&self) -> &str {
        &self.code
    }

    fn parse(&mut self, raw: &str) {
        self.bitmap = PidSupportBitmap::parse(raw, self.origin);
    }

    fn has_value(&self) -> bool {
        self.bitmap.is_some()
    }

    fn apply_to(&self, _data: &mut CarData) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(code: &str, raw: &str) -> CarData {
        let mut decoder = StandardDecoder::new(spec_for(code).unwrap());
        decoder.parse(raw);
        let mut data = CarData::new();
        decoder.apply_to(&mut data);
        data
    }

    #[test]
    fn test_rpm_decode() {
        // (0x1A * 256 + 0xF8) / 4
        let data = decode("010C", "410C1AF8");
        assert_eq!(data.rpm, Some(1726.0));
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x64 = 100, 100 - 40 = 60 °C = 140 °F
        let data = decode("0105", "41 05 64\r\r>");
        assert_eq!(data.coolant_temp_c, Some(60.0));
        assert!((data.coolant_temp_f.unwrap() - 140.0).abs() < 1e-9);
    }

    #[test]
    fn test_pressure_writes_both_units() {
        let data = decode("010B", "410B64");
        assert_eq!(data.map_kpa, Some(100.0));
        assert!((data.map_psi.unwrap() - 14.5038).abs() < 1e-3);

        let data = decode("0123", "7E8 04 41 23 00 64");
        assert_eq!(data.fuel_rail_gauge_kpa, Some(1000.0));
        assert!(data.fuel_rail_gauge_psi.is_some());
    }

    #[test]
    fn test_signed_and_offset_formulas() {
        assert_eq!(decode("010E", "410E80").timing_advance_deg, Some(0.0));
        assert_eq!(decode("012D", "412D80").egr_error_pct, Some(0.0));
        assert_eq!(decode("0132", "4132FFFC").evap_vapor_pressure_pa, Some(-1.0));
        assert_eq!(decode("0142", "41423A98").control_module_voltage, Some(15.0));
    }

    #[test]
    fn test_malformed_input_leaves_snapshot_untouched() {
        let mut decoder = StandardDecoder::new(spec_for("010C").unwrap());
        decoder.parse("410C1A");
        assert!(!decoder.has_value());

        decoder.parse("410C1AF8");
        assert!(decoder.has_value());
        decoder.parse("NO DATA");
        assert!(!decoder.has_value());

        let mut data = CarData::new();
        decoder.apply_to(&mut data);
        assert_eq!(data.rpm, None);
    }

    #[test]
    fn test_bitmap_decoder_is_capability_only() {
        let mut decoder = SupportBitmapDecoder::new(0x00);
        assert_eq!(decoder.pid(), "0100");
        decoder.parse("4100BE3FA813");
        assert!(decoder.has_value());
        assert!(decoder.bitmap().unwrap().supports(0x0C));

        let before = CarData::new();
        let mut after = before.clone();
        decoder.apply_to(&mut after);
        assert_eq!(before, after);
    }

    #[test]
    fn test_spec_lookup_is_case_insensitive() {
        assert_eq!(spec_for("010c").map(|s| s.code), Some("010C"));
        assert!(spec_for("01FF").is_none());
        assert!(STANDARD_PIDS.iter().all(|s| s.code.len() == 4 && s.code.starts_with("01")));
    }
}
