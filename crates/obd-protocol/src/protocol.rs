//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};

/// Vehicle bus protocols selectable with `ATSP`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::J1850Pwm => "ATSP1",
            ObdProtocol::J1850Vpw => "ATSP2",
            ObdProtocol::Iso9141_2 => "ATSP3",
            ObdProtocol::Iso14230_4Kwp => "ATSP4",
            ObdProtocol::Iso14230_4KwpFast => "ATSP5",
            ObdProtocol::Iso15765_4Can11bit500 => "ATSP6",
            ObdProtocol::Iso15765_4Can29bit500 => "ATSP7",
            ObdProtocol::Iso15765_4Can11bit250 => "ATSP8",
            ObdProtocol::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// Protocol name as printed by `ATDP`
    pub fn description(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "AUTO",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW",
            ObdProtocol::Iso9141_2 => "ISO 9141-2",
            ObdProtocol::Iso14230_4Kwp => "ISO 14230-4 (KWP 5BAUD)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 (KWP FAST)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 (CAN 11/500)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 (CAN 29/500)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 (CAN 11/250)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 (CAN 29/250)",
        }
    }

    /// Single-character ELM327 protocol number
    pub fn code(&self) -> char {
        self.to_elm_command().chars().last().unwrap_or('0')
    }

    /// Parse an ELM327 protocol number (`'0'..='9'`)
    pub fn from_code(code: char) -> Option<Self> {
        let protocol = match code.to_ascii_uppercase() {
            '0' => ObdProtocol::Auto,
            '1' => ObdProtocol::J1850Pwm,
            '2' => ObdProtocol::J1850Vpw,
            '3' => ObdProtocol::Iso9141_2,
            '4' => ObdProtocol::Iso14230_4Kwp,
            '5' => ObdProtocol::Iso14230_4KwpFast,
            '6' => ObdProtocol::Iso15765_4Can11bit500,
            '7' => ObdProtocol::Iso15765_4Can29bit500,
            '8' => ObdProtocol::Iso15765_4Can11bit250,
            '9' => ObdProtocol::Iso15765_4Can29bit250,
            _ => return None,
        };
        Some(protocol)
    }

    /// Parse a user supplied hint: either a protocol number or a name fragment
    pub fn from_hint(hint: &str) -> Option<Self> {
        let hint = hint.trim();
        let mut chars = hint.chars();
        if let (Some(code), None) = (chars.next(), chars.next()) {
            return Self::from_code(code);
        }
        let upper = hint.to_ascii_uppercase();
        if upper.contains("9141") {
            Some(ObdProtocol::Iso9141_2)
        } else if upper.contains("KWP") || upper.contains("14230") {
            Some(ObdProtocol::Iso14230_4Kwp)
        } else if upper.contains("29") && upper.contains("CAN") {
            Some(ObdProtocol::Iso15765_4Can29bit500)
        } else if upper.contains("CAN") || upper.contains("15765") {
            Some(ObdProtocol::Iso15765_4Can11bit500)
        } else if upper == "AUTO" {
            Some(ObdProtocol::Auto)
        } else {
            None
        }
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }

    /// K-line protocols need the extended slow-init sequence
    pub fn is_kline(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso9141_2 | ObdProtocol::Iso14230_4Kwp | ObdProtocol::Iso14230_4KwpFast
        )
    }

    /// Bus class implied by an explicitly selected protocol
    pub fn bus_class(&self) -> BusClass {
        if self.is_can() {
            BusClass::Can
        } else if *self == ObdProtocol::Auto {
            BusClass::Unknown
        } else {
            BusClass::IsoKwp
        }
    }

    /// Get the default baud rate for serial communication
    pub fn default_baud_rate(&self) -> u32 {
        // ELM327 adapters typically use 38400 or higher
        if self.is_can() {
            115200
        } else {
            38400
        }
    }
}

impl Default for ObdProtocol {
    fn default() -> Self {
        ObdProtocol::Auto
    }
}

/// Coarse bus family used for timeout and cadence tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BusClass {
    /// ISO 15765-4 CAN
    Can,
    /// ISO 9141-2 / ISO 14230-4 K-line (and J1850, which is equally slow)
    IsoKwp,
    /// Not yet determined
    #[default]
    Unknown,
}

impl BusClass {
    /// Classify an `ATDP` description.
    ///
    /// CAN descriptions also contain "ISO" ("ISO 15765-4 (CAN 11/500)"),
    /// so CAN is matched first.
    pub fn from_description(description: &str) -> Self {
        let upper = description.to_ascii_uppercase();
        if upper.contains("CAN") || upper.contains("15765") {
            BusClass::Can
        } else if upper.contains("ISO") || upper.contains("KWP") || upper.contains("SAE") {
            BusClass::IsoKwp
        } else {
            BusClass::Unknown
        }
    }

    /// Whether this is a CAN bus
    pub fn is_can(&self) -> bool {
        *self == BusClass::Can
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_descriptions() {
        assert_eq!(
            BusClass::from_description("AUTO, ISO 15765-4 (CAN 11/500)"),
            BusClass::Can
        );
        assert_eq!(BusClass::from_description("ISO 9141-2"), BusClass::IsoKwp);
        assert_eq!(
            BusClass::from_description("ISO 14230-4 (KWP FAST)"),
            BusClass::IsoKwp
        );
        assert_eq!(BusClass::from_description("AUTO"), BusClass::Unknown);
        assert_eq!(BusClass::from_description("?"), BusClass::Unknown);
    }

    #[test]
    fn test_protocol_codes() {
        assert_eq!(ObdProtocol::Iso9141_2.code(), '3');
        assert_eq!(ObdProtocol::from_code('7'), Some(ObdProtocol::Iso15765_4Can29bit500));
        assert_eq!(ObdProtocol::from_code('Z'), None);
        assert!(ObdProtocol::Iso14230_4KwpFast.is_kline());
        assert!(!ObdProtocol::Iso15765_4Can11bit500.is_kline());
    }

    #[test]
    fn test_protocol_hints() {
        assert_eq!(ObdProtocol::from_hint("6"), Some(ObdProtocol::Iso15765_4Can11bit500));
        assert_eq!(ObdProtocol::from_hint("iso9141"), Some(ObdProtocol::Iso9141_2));
        assert_eq!(ObdProtocol::from_hint("KWP2000"), Some(ObdProtocol::Iso14230_4Kwp));
        assert_eq!(ObdProtocol::from_hint("CAN 29/500"), Some(ObdProtocol::Iso15765_4Can29bit500));
        assert_eq!(ObdProtocol::from_hint("bogus"), None);
    }
}
