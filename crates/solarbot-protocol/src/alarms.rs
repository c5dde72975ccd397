//! Typed alarm bitmasks
//!
//! The platform models robot alarms as four flat bit-sets (FA/FB/FC/FD).
//! Each simulated robot holds one value per set, seeded from its roster row.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// FA: fault alarms (32-bit)
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FaultAlarms: u32 {
        const WALK_MOTOR_STALL       = 1 << 0;
        const BRUSH_MOTOR_STALL      = 1 << 1;
        const WINDPROOF_MOTOR_STALL  = 1 << 2;
        const WALK_OVERCURRENT       = 1 << 3;
        const BRUSH_OVERCURRENT      = 1 << 4;
        const WINDPROOF_OVERCURRENT  = 1 << 5;
        const EDGE_SENSOR_FAULT      = 1 << 6;
        const TILT_SENSOR_FAULT      = 1 << 7;
        const LORA_COMM_TIMEOUT      = 1 << 8;
        const CONTROLLER_FAULT       = 1 << 9;
        const PARKING_FAULT          = 1 << 10;
        const REVERSE_TIMEOUT        = 1 << 11;
    }

    /// FB: battery alarms (16-bit)
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BatteryAlarms: u16 {
        const LOW_VOLTAGE        = 1 << 0;
        const OVER_VOLTAGE       = 1 << 1;
        const LOW_LEVEL          = 1 << 2;
        const OVER_TEMPERATURE   = 1 << 3;
        const UNDER_TEMPERATURE  = 1 << 4;
        const CHARGE_FAULT       = 1 << 5;
        const DISCHARGE_FAULT    = 1 << 6;
        const CELL_IMBALANCE     = 1 << 7;
    }

    /// FC: protection events (32-bit)
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MotorAlarms: u32 {
        const WALK_WARNING_CURRENT       = 1 << 0;
        const BRUSH_WARNING_CURRENT      = 1 << 1;
        const WINDPROOF_WARNING_CURRENT  = 1 << 2;
        const WALK_TIMEOUT               = 1 << 3;
        const BRUSH_TIMEOUT              = 1 << 4;
        const WINDPROOF_TIMEOUT          = 1 << 5;
        const PROTECTION_ANGLE_EXCEEDED  = 1 << 6;
        const BOARD_OVER_TEMPERATURE     = 1 << 7;
        const MILEAGE_LIMIT              = 1 << 8;
    }

    /// FD: environment alarms (16-bit)
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct EnvironmentAlarms: u16 {
        const HIGH_WIND           = 1 << 0;
        const HIGH_HUMIDITY       = 1 << 1;
        const BRACKET_PROTECTION  = 1 << 2;
        const LOW_AMBIENT_TEMP    = 1 << 3;
        const SENSOR_FAULT        = 1 << 4;
        const DAYTIME_LOCKOUT     = 1 << 5;
    }
}

// Masks cross the admin boundary as plain integers; unknown bits survive
// a round-trip.
macro_rules! alarm_serde {
    ($ty:ident, $bits:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.bits().serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                Ok(Self::from_bits_retain(<$bits>::deserialize(deserializer)?))
            }
        }
    };
}

alarm_serde!(FaultAlarms, u32);
alarm_serde!(BatteryAlarms, u16);
alarm_serde!(MotorAlarms, u32);
alarm_serde!(EnvironmentAlarms, u16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_integer() {
        let fa = FaultAlarms::WALK_MOTOR_STALL | FaultAlarms::LORA_COMM_TIMEOUT;
        assert_eq!(serde_json::to_string(&fa).unwrap(), "257");
        let back: FaultAlarms = serde_json::from_str("257").unwrap();
        assert_eq!(back, fa);
    }

    #[test]
    fn test_unknown_bits_are_retained() {
        // Roster rows may carry bits newer firmware defines; keep them.
        let fa = FaultAlarms::from_bits_retain(0x8000_0001);
        assert!(fa.contains(FaultAlarms::WALK_MOTOR_STALL));
        assert_eq!(fa.bits(), 0x8000_0001);
    }

    #[test]
    fn test_default_is_empty() {
        assert!(BatteryAlarms::default().is_empty());
        assert_eq!(EnvironmentAlarms::default().bits(), 0);
    }
}
