//! Vehicle profile matching and learned-data merge

use obd_protocol::{model_year_from_vin, EcuFingerprint};
use serde::Serialize;
use std::fmt;
use storage::{LearnedData, VehicleProfile};

/// How well a fingerprint fits a stored profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProfileMatch {
    /// Same vehicle, or nothing to compare
    Match,
    /// Only one side knows a VIN
    SoftUnknown,
    /// Model years differ by more than two
    SoftMismatch,
    /// Different VIN or manufacturer
    HardMismatch,
}

impl fmt::Display for ProfileMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProfileMatch::Match => "match",
            ProfileMatch::SoftUnknown => "soft-unknown",
            ProfileMatch::SoftMismatch => "soft-mismatch",
            ProfileMatch::HardMismatch => "hard-mismatch",
        };
        f.write_str(name)
    }
}

/// Compare what the ECU reported with what the profile remembers.
///
/// Equal VINs are a match regardless of any other field.
pub fn match_profile(profile: &VehicleProfile, fingerprint: &EcuFingerprint) -> ProfileMatch {
    let stored_vin = profile.learned.vin.as_deref().map(str::trim).filter(|v| !v.is_empty());
    let found_vin = fingerprint.vin.as_deref();

    if let (Some(stored), Some(found)) = (stored_vin, found_vin) {
        return if stored.eq_ignore_ascii_case(found) {
            ProfileMatch::Match
        } else {
            ProfileMatch::HardMismatch
        };
    }

    let stored_wmi = profile
        .learned
        .wmi
        .clone()
        .or_else(|| stored_vin.and_then(|v| v.get(..3)).map(str::to_string));
    if let (Some(stored), Some(found)) = (stored_wmi.as_deref(), fingerprint.wmi.as_deref()) {
        if !stored.eq_ignore_ascii_case(found) {
            return ProfileMatch::HardMismatch;
        }
    }

    let stored_year = profile
        .learned
        .model_year
        .or(profile.identity.year)
        .or_else(|| stored_vin.and_then(model_year_from_vin));
    if let (Some(stored), Some(found)) = (stored_year, fingerprint.model_year) {
        if stored.abs_diff(found) > 2 {
            return ProfileMatch::SoftMismatch;
        }
    }

    if stored_vin.is_some() != found_vin.is_some() {
        return ProfileMatch::SoftUnknown;
    }
    ProfileMatch::Match
}

/// Fold a fingerprint into learned data.
///
/// Identity fields (VIN, WMI, model year) only fill gaps. Protocol,
/// supported PIDs and calibration IDs are replaced when they differ.
/// Returns whether anything changed; `last_connected` is not touched.
pub fn merge_learned(learned: &mut LearnedData, fingerprint: &EcuFingerprint) -> bool {
    let mut changed = false;

    if learned.vin.is_none() && fingerprint.vin.is_some() {
        learned.vin = fingerprint.vin.clone();
        changed = true;
    }
    if learned.wmi.is_none() && fingerprint.wmi.is_some() {
        learned.wmi = fingerprint.wmi.clone();
        changed = true;
    }
    if learned.model_year.is_none() && fingerprint.model_year.is_some() {
        learned.model_year = fingerprint.model_year;
        changed = true;
    }

    if !fingerprint.protocol.is_empty()
        && learned.protocol.as_deref() != Some(fingerprint.protocol.as_str())
    {
        learned.protocol = Some(fingerprint.protocol.clone());
        changed = true;
    }

    let pids: Vec<String> = fingerprint.supported_pids.iter().cloned().collect();
    if !pids.is_empty() && learned.supported_pids != pids {
        learned.supported_pids = pids;
        changed = true;
    }

    if !fingerprint.calibration_ids.is_empty()
        && learned.calibration_ids != fingerprint.calibration_ids
    {
        learned.calibration_ids = fingerprint.calibration_ids.clone();
        changed = true;
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::VehicleIdentity;

    fn fingerprint(vin: Option<&str>) -> EcuFingerprint {
        EcuFingerprint::new(
            vin.map(str::to_string),
            "ISO 15765-4 (CAN 11/500)",
            ["010C".to_string(), "010D".to_string()],
            Vec::new(),
        )
    }

    fn profile(vin: Option<&str>) -> VehicleProfile {
        let mut profile = VehicleProfile::new(
            "fiesta",
            VehicleIdentity {
                year: Some(2014),
                make: "Ford".into(),
                model: "Fiesta".into(),
                engine: None,
            },
        );
        profile.learned.vin = vin.map(str::to_string);
        profile
    }

    #[test]
    fn test_vin_mismatch_is_hard() {
        assert_eq!(
            match_profile(
                &profile(Some("1FADP3F20EL123456")),
                &fingerprint(Some("1FADP3F20EL999999"))
            ),
            ProfileMatch::HardMismatch
        );
    }

    #[test]
    fn test_identical_vin_matches_regardless_of_other_fields() {
        let mut stored = profile(Some("1FADP3F20EL123456"));
        stored.identity.year = Some(1995);
        stored.learned.wmi = Some("JHM".into());
        stored.learned.protocol = Some("ISO 9141-2".into());
        assert_eq!(
            match_profile(&stored, &fingerprint(Some("1fadp3f20el123456"))),
            ProfileMatch::Match
        );
    }

    #[test]
    fn test_no_vin_anywhere_matches() {
        let mut stored = profile(None);
        stored.identity.year = None;
        assert_eq!(match_profile(&stored, &fingerprint(None)), ProfileMatch::Match);
    }

    #[test]
    fn test_one_sided_vin_is_soft_unknown() {
        assert_eq!(
            match_profile(&profile(None), &fingerprint(Some("1FADP3F20EL123456"))),
            ProfileMatch::SoftUnknown
        );
        assert_eq!(
            match_profile(&profile(Some("1FADP3F20EL123456")), &fingerprint(None)),
            ProfileMatch::SoftUnknown
        );
    }

    #[test]
    fn test_wmi_mismatch_is_hard() {
        let mut stored = profile(None);
        stored.learned.wmi = Some("JHM".into());
        assert_eq!(
            match_profile(&stored, &fingerprint(Some("1FADP3F20EL123456"))),
            ProfileMatch::HardMismatch
        );
    }

    #[test]
    fn test_year_gap_is_soft_mismatch() {
        let mut stored = profile(None);
        stored.identity.year = Some(2008);
        assert_eq!(
            match_profile(&stored, &fingerprint(Some("1FADP3F20EL123456"))),
            ProfileMatch::SoftMismatch
        );
        stored.identity.year = Some(2012);
        assert_eq!(
            match_profile(&stored, &fingerprint(Some("1FADP3F20EL123456"))),
            ProfileMatch::SoftUnknown
        );
    }

    #[test]
    fn test_merge_fills_gaps_once() {
        let mut learned = LearnedData::default();
        let fp = fingerprint(Some("1FADP3F20EL123456"));
        assert!(merge_learned(&mut learned, &fp));
        assert_eq!(learned.vin.as_deref(), Some("1FADP3F20EL123456"));
        assert_eq!(learned.wmi.as_deref(), Some("1FA"));
        assert_eq!(learned.model_year, Some(2014));
        assert_eq!(learned.supported_pids, vec!["010C", "010D"]);

        assert!(!merge_learned(&mut learned, &fp));
    }

    #[test]
    fn test_merge_never_overwrites_identity() {
        let mut learned = LearnedData {
            vin: Some("WVWZZZ1JZXW000001".into()),
            wmi: Some("WVW".into()),
            model_year: Some(1999),
            ..LearnedData::default()
        };
        merge_learned(&mut learned, &fingerprint(Some("1FADP3F20EL123456")));
        assert_eq!(learned.vin.as_deref(), Some("WVWZZZ1JZXW000001"));
        assert_eq!(learned.wmi.as_deref(), Some("WVW"));
        assert_eq!(learned.model_year, Some(1999));
    }

    #[test]
    fn test_merge_overwrites_capabilities_on_change() {
        let mut learned = LearnedData {
            protocol: Some("ISO 9141-2".into()),
            supported_pids: vec!["0105".into()],
            ..LearnedData::default()
        };
        assert!(merge_learned(&mut learned, &fingerprint(None)));
        assert_eq!(learned.protocol.as_deref(), Some("ISO 15765-4 (CAN 11/500)"));
        assert_eq!(learned.supported_pids, vec!["010C", "010D"]);
    }
}
