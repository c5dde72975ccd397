//! Held telemetry state of one simulated robot
//!
//! Field values change only through downlink commands or static
//! initializers; there is no physical model behind them. All keys are the
//! canonical English set consumed by the admin surface.

use serde::{Deserialize, Serialize};
use solarbot_protocol::{
    BatteryAlarms, CleanRecord, EnvironmentAlarms, FaultAlarms, LoraParamSet, MotorAlarms,
    ProtectionFlags,
};

/// A scheduled cleaning task registered on the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub task_id: u8,
    /// 0 = Sunday
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub run_count: u8,
}

/// Motor speed, current-limit and timeout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorParams {
    pub walk_motor_speed: u16,
    pub brush_motor_speed: u16,
    pub windproof_motor_speed: u16,
    pub walk_motor_max_current_ma: u16,
    pub brush_motor_max_current_ma: u16,
    pub windproof_motor_max_current_ma: u16,
    pub walk_motor_warning_current_ma: u16,
    pub brush_motor_warning_current_ma: u16,
    pub windproof_motor_warning_current_ma: u16,
    pub walk_motor_mileage_m: u32,
    pub brush_motor_timeout_s: u16,
    pub windproof_motor_timeout_s: u16,
    pub reverse_time_s: u16,
    pub protection_angle: u8,
}

impl Default for MotorParams {
    fn default() -> Self {
        Self {
            walk_motor_speed: 50,
            brush_motor_speed: 60,
            windproof_motor_speed: 40,
            walk_motor_max_current_ma: 3000,
            brush_motor_max_current_ma: 2500,
            windproof_motor_max_current_ma: 2000,
            walk_motor_warning_current_ma: 2400,
            brush_motor_warning_current_ma: 2000,
            windproof_motor_warning_current_ma: 1600,
            walk_motor_mileage_m: 0,
            brush_motor_timeout_s: 120,
            windproof_motor_timeout_s: 60,
            reverse_time_s: 5,
            protection_angle: 15,
        }
    }
}

/// Temperature / voltage / battery protection thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempVoltageProtection {
    pub protection_current_ma: u16,
    pub high_temp_threshold: i16,
    pub low_temp_threshold: i16,
    pub protection_temp: i16,
    pub recovery_temp: i16,
    pub protection_voltage: u16,
    pub recovery_voltage: u16,
    pub protection_battery_level: u8,
    pub limit_run_battery_level: u8,
    pub recovery_battery_level: u8,
    pub board_protection_temp: i16,
    pub board_recovery_temp: i16,
}

impl Default for TempVoltageProtection {
    fn default() -> Self {
        Self {
            protection_current_ma: 3500,
            high_temp_threshold: 60,
            low_temp_threshold: -10,
            protection_temp: 65,
            recovery_temp: 55,
            protection_voltage: 200,
            recovery_voltage: 220,
            protection_battery_level: 10,
            limit_run_battery_level: 20,
            recovery_battery_level: 30,
            board_protection_temp: 75,
            board_recovery_temp: 60,
        }
    }
}

/// The robot's local wall clock, updated by time-sync replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 0 = Sunday
    pub weekday: u8,
}

impl LocalTime {
    /// Host wall clock; seeds the simulated RTC until the first time-sync
    #[must_use]
    pub fn now() -> Self {
        use chrono::{Datelike, Local, Timelike};
        let now = Local::now();
        Self {
            year: now.year().clamp(0, i32::from(u16::MAX)) as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            weekday: now.weekday().num_days_from_sunday() as u8,
        }
    }
}

/// On-board environment sensing and site protection status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub sensor_temperature: f32,
    pub sensor_humidity: f32,
    pub ambient_temperature: f32,
    /// 0 = day, 1 = night
    pub day_night_status: u8,
    /// Reported wind speed, 0.1 m/s units
    pub wind_speed: u16,
    pub protection: ProtectionFlags,
}

/// Complete held state of one robot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotState {
    // Battery
    /// 100 mV units
    pub battery_voltage: u16,
    /// 100 mA units
    pub battery_current: u16,
    pub battery_status: u8,
    /// Percent
    pub battery_level: u8,
    /// Degrees C
    pub battery_temperature: i8,

    // Motors and solar input
    pub main_motor_current: u16,
    pub slave_motor_current: u16,
    pub solar_voltage: u16,
    pub solar_current: u16,
    pub board_temperature: i8,

    // Position and run bookkeeping
    pub position_info: String,
    pub position: i32,
    pub direction: i8,
    pub total_run_count: u16,
    pub current_lap_count: u8,
    pub parking_position: u8,

    // Stored cleaning runs, newest last, at most five
    pub clean_records: Vec<CleanRecord>,

    // Alarm bit-sets
    pub alarm_fa: FaultAlarms,
    pub alarm_fb: BatteryAlarms,
    pub alarm_fc: MotorAlarms,
    pub alarm_fd: EnvironmentAlarms,

    // Configuration
    pub schedule_tasks: Vec<ScheduleTask>,
    pub lora_params: LoraParamSet,
    pub motor_params: MotorParams,
    pub temp_voltage_protection: TempVoltageProtection,
    pub daytime_scan_protect: bool,

    // Clock and environment
    pub local_time: LocalTime,
    pub environment: EnvironmentInfo,
    /// Boxes on the site, from start/schedule replies
    pub site_box_count: u16,
    /// Robots on the site, from start/schedule replies
    pub site_robot_count: u8,

    // Identity
    pub software_version: String,
    pub module_eui: String,
    pub domestic_foreign_flag: u8,
    pub country_code: String,
    pub region_code: String,
    pub project_code: String,

    // Per-motor current arrays
    pub master_currents: Vec<u16>,
    pub slave_currents: Vec<u16>,
}

impl Default for RobotState {
    fn default() -> Self {
        Self {
            battery_voltage: 252, // 25.2 V
            battery_current: 0,
            battery_status: 0,
            battery_level: 100,
            battery_temperature: 25,
            main_motor_current: 0,
            slave_motor_current: 0,
            solar_voltage: 0,
            solar_current: 0,
            board_temperature: 25,
            position_info: String::new(),
            position: 0,
            direction: 0,
            total_run_count: 0,
            current_lap_count: 0,
            parking_position: 0,
            clean_records: Vec::new(),
            alarm_fa: FaultAlarms::default(),
            alarm_fb: BatteryAlarms::default(),
            alarm_fc: MotorAlarms::default(),
            alarm_fd: EnvironmentAlarms::default(),
            schedule_tasks: Vec::new(),
            lora_params: LoraParamSet::default(),
            motor_params: MotorParams::default(),
            temp_voltage_protection: TempVoltageProtection::default(),
            daytime_scan_protect: false,
            local_time: LocalTime::default(),
            environment: EnvironmentInfo::default(),
            site_box_count: 0,
            site_robot_count: 0,
            software_version: "1.0.0".to_string(),
            module_eui: String::new(),
            domestic_foreign_flag: 0,
            country_code: String::new(),
            region_code: String::new(),
            project_code: String::new(),
            master_currents: Vec::new(),
            slave_currents: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_keys_are_english() {
        let state = RobotState::default();
        let value = serde_json::to_value(&state).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("battery_level"));
        assert!(obj.contains_key("lora_params"));
        assert!(obj.contains_key("temp_voltage_protection"));
        // Bitmasks serialize as integers
        assert!(value["alarm_fa"].is_u64());
    }
}
