//! Live telemetry snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sample of every decoded sensor value.
///
/// Fields the vehicle has not reported are `None` and serialise as `null`.
/// Writers call [`CarData::touch`] so the timestamp always reflects the most
/// recent write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarData {
    /// Time of the last field write
    pub timestamp: DateTime<Utc>,

    /// Engine speed (rpm)
    pub rpm: Option<f64>,
    /// Vehicle speed (km/h)
    pub speed_kph: Option<f64>,
    /// Vehicle speed (mph)
    pub speed_mph: Option<f64>,
    /// Absolute throttle position (%)
    pub throttle_pct: Option<f64>,
    /// Calculated engine load (%)
    pub engine_load_pct: Option<f64>,

    /// Engine coolant temperature (°C)
    pub coolant_temp_c: Option<f64>,
    /// Engine coolant temperature (°F)
    pub coolant_temp_f: Option<f64>,
    /// Intake air temperature (°C)
    pub intake_air_temp_c: Option<f64>,
    /// Intake air temperature (°F)
    pub intake_air_temp_f: Option<f64>,
    /// Ambient air temperature (°C)
    pub ambient_air_temp_c: Option<f64>,
    /// Engine oil temperature (°C)
    pub oil_temp_c: Option<f64>,
    /// Engine oil temperature (°F)
    pub oil_temp_f: Option<f64>,

    /// Intake manifold absolute pressure (kPa)
    pub map_kpa: Option<f64>,
    /// Intake manifold absolute pressure (psi)
    pub map_psi: Option<f64>,
    /// Barometric pressure (kPa)
    pub baro_kpa: Option<f64>,
    /// Fuel pressure, gauge (kPa)
    pub fuel_pressure_kpa: Option<f64>,
    /// Fuel pressure, gauge (psi)
    pub fuel_pressure_psi: Option<f64>,
    /// Fuel rail pressure relative to manifold vacuum (kPa)
    pub fuel_rail_pressure_kpa: Option<f64>,
    /// Fuel rail gauge pressure, diesel / direct injection (kPa)
    pub fuel_rail_gauge_kpa: Option<f64>,
    /// Fuel rail gauge pressure (psi)
    pub fuel_rail_gauge_psi: Option<f64>,

    /// Mass air flow (g/s)
    pub maf_gps: Option<f64>,
    /// Timing advance before TDC (degrees)
    pub timing_advance_deg: Option<f64>,
    /// Fuel tank level (%)
    pub fuel_level_pct: Option<f64>,
    /// Commanded EGR (%)
    pub commanded_egr_pct: Option<f64>,
    /// EGR error (%)
    pub egr_error_pct: Option<f64>,
    /// Commanded evaporative purge (%)
    pub evap_purge_pct: Option<f64>,
    /// Evap system vapor pressure (Pa)
    pub evap_vapor_pressure_pa: Option<f64>,
    /// Control module voltage (V)
    pub control_module_voltage: Option<f64>,

    /// Run time since engine start (s)
    pub run_time_s: Option<f64>,
    /// Distance traveled with MIL on (km)
    pub distance_with_mil_km: Option<f64>,
    /// Distance since codes cleared (km)
    pub distance_since_clear_km: Option<f64>,
    /// Warm-ups since codes cleared
    pub warmups_since_clear: Option<f64>,
}

impl CarData {
    /// Empty snapshot stamped with the current time
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Empty snapshot with an explicit timestamp
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            rpm: None,
            speed_kph: None,
            speed_mph: None,
            throttle_pct: None,
            engine_load_pct: None,
            coolant_temp_c: None,
            coolant_temp_f: None,
            intake_air_temp_c: None,
            intake_air_temp_f: None,
            ambient_air_temp_c: None,
            oil_temp_c: None,
            oil_temp_f: None,
            map_kpa: None,
            map_psi: None,
            baro_kpa: None,
            fuel_pressure_kpa: None,
            fuel_pressure_psi: None,
            fuel_rail_pressure_kpa: None,
            fuel_rail_gauge_kpa: None,
            fuel_rail_gauge_psi: None,
            maf_gps: None,
            timing_advance_deg: None,
            fuel_level_pct: None,
            commanded_egr_pct: None,
            egr_error_pct: None,
            evap_purge_pct: None,
            evap_vapor_pressure_pa: None,
            control_module_voltage: None,
            run_time_s: None,
            distance_with_mil_km: None,
            distance_since_clear_km: None,
            warmups_since_clear: None,
        }
    }

    /// Refresh the timestamp after a write
    pub fn touch(&mut self) {
        self.timestamp = Utc::now();
    }
}

impl Default for CarData {
    fn default() -> Self {
        Self::new()
    }
}

/// Celsius to Fahrenheit
pub(crate) fn c_to_f(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Kilopascal to psi
pub(crate) fn kpa_to_psi(kpa: f64) -> f64 {
    kpa * 0.145_037_738
}

/// Kilometres per hour to miles per hour
pub(crate) fn kph_to_mph(kph: f64) -> f64 {
    kph * 0.621_371_192
}
