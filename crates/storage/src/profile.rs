//! Persisted vehicle profile

use crate::repository::{load, save, Storage};
use crate::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage key of a profile
pub fn profile_key(id: &str) -> String {
    format!("profile:{id}")
}

/// Who the user says the vehicle is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VehicleIdentity {
    pub year: Option<u16>,
    pub make: String,
    pub model: String,
    pub engine: Option<String>,
}

/// What the connection has learned about the vehicle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LearnedData {
    pub vin: Option<String>,
    pub wmi: Option<String>,
    pub model_year: Option<u16>,
    pub protocol: Option<String>,
    /// Sorted, upper-case 4-hex codes
    pub supported_pids: Vec<String>,
    pub calibration_ids: Vec<String>,
    pub last_connected: Option<DateTime<Utc>>,
}

/// User-supplied hints for reaching the vehicle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionHints {
    pub preferred_transport: Option<String>,
    pub adapter_name: Option<String>,
    /// `ATSP` digit or protocol name, e.g. "6" or "ISO 9141-2"
    pub protocol_hint: Option<String>,
    /// Extra AT commands run after base init
    pub init_script: Vec<String>,
    pub can_header: Option<String>,
    pub can_receive_filter: Option<String>,
}

/// Gauge scaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GaugeHints {
    pub redline_rpm: f64,
    pub max_speed_kph: f64,
    pub max_boost_psi: Option<f64>,
    pub coolant_warn_c: f64,
}

impl Default for GaugeHints {
    fn default() -> Self {
        Self {
            redline_rpm: 7000.0,
            max_speed_kph: 240.0,
            max_boost_psi: None,
            coolant_warn_c: 110.0,
        }
    }
}

fn default_strict_lock() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleProfile {
    pub id: String,
    #[serde(default)]
    pub identity: VehicleIdentity,
    #[serde(default)]
    pub learned: LearnedData,
    #[serde(default)]
    pub hints: ConnectionHints,
    #[serde(default)]
    pub gauges: GaugeHints,
    /// PIDs to poll; empty means the built-in default set
    #[serde(default)]
    pub preferred_pids: Vec<String>,
    /// Abort on a hard identity mismatch instead of only warning
    #[serde(default = "default_strict_lock")]
    pub strict_lock: bool,
    pub created_at: DateTime<Utc>,
}

impl VehicleProfile {
    pub fn new(id: impl Into<String>, identity: VehicleIdentity) -> Self {
        Self {
            id: id.into(),
            identity,
            learned: LearnedData::default(),
            hints: ConnectionHints::default(),
            gauges: GaugeHints::default(),
            preferred_pids: Vec::new(),
            strict_lock: true,
            created_at: Utc::now(),
        }
    }

    /// "2014 Ford Fiesta" style label
    pub fn display_name(&self) -> String {
        let mut parts = Vec::new();
        if let Some(year) = self.identity.year {
            parts.push(year.to_string());
        }
        for part in [&self.identity.make, &self.identity.model] {
            if !part.is_empty() {
                parts.push(part.clone());
            }
        }
        if parts.is_empty() {
            self.id.clone()
        } else {
            parts.join(" ")
        }
    }
}

pub async fn load_profile(
    storage: &dyn Storage,
    id: &str,
) -> Result<Option<VehicleProfile>, StorageError> {
    load(storage, &profile_key(id)).await
}

pub async fn save_profile(
    storage: &dyn Storage,
    profile: &VehicleProfile,
) -> Result<(), StorageError> {
    save(storage, &profile_key(&profile.id), profile).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use serde_json::json;

    fn fiesta() -> VehicleProfile {
        VehicleProfile::new(
            "fiesta",
            VehicleIdentity {
                year: Some(2014),
                make: "Ford".into(),
                model: "Fiesta".into(),
                engine: Some("1.6".into()),
            },
        )
    }

    #[tokio::test]
    async fn test_profile_roundtrip() {
        let storage = MemoryStorage::new();
        let mut profile = fiesta();
        profile.learned.vin = Some("1FADP3F20EL123456".into());
        profile.learned.supported_pids = vec!["010C".into(), "010D".into()];
        save_profile(&storage, &profile).await.unwrap();

        assert!(storage.has("profile:fiesta").await.unwrap());
        let loaded = load_profile(&storage, "fiesta").await.unwrap().unwrap();
        assert_eq!(loaded, profile);
        assert!(load_profile(&storage, "other").await.unwrap().is_none());
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let profile: VehicleProfile = serde_json::from_value(json!({
            "id": "old",
            "createdAt": "2024-01-01T00:00:00Z",
            "learned": {"vin": "1FADP3F20EL123456"}
        }))
        .unwrap();
        assert!(profile.strict_lock);
        assert_eq!(profile.learned.vin.as_deref(), Some("1FADP3F20EL123456"));
        assert!(profile.learned.supported_pids.is_empty());
        assert_eq!(profile.gauges, GaugeHints::default());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(fiesta().display_name(), "2014 Ford Fiesta");
        let bare = VehicleProfile::new("bare", VehicleIdentity::default());
        assert_eq!(bare.display_name(), "bare");
    }

    #[test]
    fn test_camel_case_keys() {
        let value = serde_json::to_value(fiesta()).unwrap();
        assert!(value.get("strictLock").is_some());
        assert!(value["learned"].get("supportedPids").is_some());
        assert!(value["hints"].get("canReceiveFilter").is_some());
    }
}
