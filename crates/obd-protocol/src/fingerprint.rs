//! ECU identity captured after a successful wake

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What the connected vehicle told us about itself.
///
/// Built once per successful wake; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcuFingerprint {
    /// 17-character VIN, if the ECU reported one
    pub vin: Option<String>,
    /// World Manufacturer Identifier (first 3 VIN characters)
    pub wmi: Option<String>,
    /// Model year decoded from the VIN
    pub model_year: Option<u16>,
    /// Active bus protocol as described by `ATDP`
    pub protocol: String,
    /// Supported Mode 01 PID codes, uppercase (`"010C"`)
    pub supported_pids: BTreeSet<String>,
    /// Calibration IDs (Mode 09 PID 04)
    pub calibration_ids: Vec<String>,
}

impl EcuFingerprint {
    /// Build a fingerprint, deriving WMI and model year from the VIN
    pub fn new(
        vin: Option<String>,
        protocol: impl Into<String>,
        supported_pids: impl IntoIterator<Item = String>,
        calibration_ids: Vec<String>,
    ) -> Self {
        let vin = vin
            .map(|v| v.trim().to_ascii_uppercase())
            .filter(|v| v.len() == 17 && v.chars().all(|c| c.is_ascii_alphanumeric()));
        let wmi = vin.as_ref().map(|v| v[..3].to_string());
        let model_year = vin.as_deref().and_then(model_year_from_vin);
        Self {
            vin,
            wmi,
            model_year,
            protocol: protocol.into(),
            supported_pids: supported_pids
                .into_iter()
                .map(|pid| pid.to_ascii_uppercase())
                .collect(),
            calibration_ids,
        }
    }

    /// Case-insensitive support check
    pub fn supports(&self, pid: &str) -> bool {
        self.supported_pids.contains(&pid.trim().to_ascii_uppercase())
    }
}

/// Decode the model year from VIN position 10.
///
/// The year code repeats every 30 years; position 7 disambiguates for
/// passenger vehicles (digit: 1980-2009, letter: 2010-2039).
pub fn model_year_from_vin(vin: &str) -> Option<u16> {
    const CODES: &str = "ABCDEFGHJKLMNPRSTVWXY123456789";
    let chars: Vec<char> = vin.chars().collect();
    if chars.len() != 17 {
        return None;
    }
    let offset = CODES.find(chars[9].to_ascii_uppercase())? as u16;
    let base = if chars[6].is_ascii_digit() { 1980 } else { 2010 };
    Some(base + offset)
}
