//! Application-layer command identifiers and parameter blocks
//!
//! The first payload byte of every frame is an identifier selecting the
//! command or report type; the remaining bytes are identifier-specific
//! parameters, parsed here.

use crate::types::CodecError;
use serde::{Deserialize, Serialize};

/// Length of the time/status block shared by `0xF0`/`0xF1`/`0xF2`
pub const TIME_STATUS_BLOCK_LEN: usize = 13;

/// Length of one cleaning record on the wire
pub const CLEAN_RECORD_LEN: usize = 8;

/// A robot keeps at most this many cleaning records
pub const MAX_CLEAN_RECORDS: usize = 5;

/// Known command/report identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Identifier {
    /// Periodic telemetry report (uplink)
    Report = 0xA1,
    /// Set LoRa parameters (downlink), confirmed by an uplink echo
    SetLoraParams = 0xA4,
    /// Request upload of stored cleaning records
    CleanRecordUpload = 0xE9,
    /// Reply to a scheduled-start request
    ScheduleStartReply = 0xF0,
    /// Reply to a start request
    StartReply = 0xF1,
    /// Time-sync reply
    TimeSync = 0xF2,
}

impl Identifier {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xA1 => Some(Identifier::Report),
            0xA4 => Some(Identifier::SetLoraParams),
            0xE9 => Some(Identifier::CleanRecordUpload),
            0xF0 => Some(Identifier::ScheduleStartReply),
            0xF1 => Some(Identifier::StartReply),
            0xF2 => Some(Identifier::TimeSync),
            _ => None,
        }
    }
}

/// LoRa radio parameters (identifier `0xA4`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraParamSet {
    pub power: u8,
    pub frequency: u8,
    pub rate: u8,
}

impl LoraParamSet {
    /// Parse from the parameter bytes following the identifier
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(params: &[u8]) -> Result<Self, CodecError> {
        if params.len() < 3 {
            return Err(CodecError::TooShort(params.len()));
        }
        Ok(Self {
            power: params[0],
            frequency: params[1],
            rate: params[2],
        })
    }

    /// Confirmation report payload: the identifier echoing the applied values
    #[must_use]
    pub fn confirmation_payload(&self) -> Vec<u8> {
        vec![
            Identifier::SetLoraParams as u8,
            self.power,
            self.frequency,
            self.rate,
        ]
    }
}

impl Default for LoraParamSet {
    fn default() -> Self {
        Self {
            power: 20,
            frequency: 70,
            rate: 1,
        }
    }
}

/// Protection flags carried in the low nibble of `protection_info`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionFlags {
    pub wind: bool,
    pub humidity: bool,
    pub bracket: bool,
    pub ambient_temperature: bool,
}

impl ProtectionFlags {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self {
            wind: byte & 0x01 != 0,
            humidity: byte & 0x02 != 0,
            bracket: byte & 0x04 != 0,
            ambient_temperature: byte & 0x08 != 0,
        }
    }

    #[must_use]
    pub fn to_byte(self) -> u8 {
        u8::from(self.wind)
            | u8::from(self.humidity) << 1
            | u8::from(self.bracket) << 2
            | u8::from(self.ambient_temperature) << 3
    }
}

/// Time/status block shared by the request replies
///
/// Layout (13 bytes, multi-byte fields big-endian):
/// ```text
/// year(+2000) month day hour minute second weekday
/// wind_speed(u16, 0.1 m/s) box_count(u16) robot_count protection_info
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeStatusBlock {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub weekday: u8,
    pub wind_speed: u16,
    pub box_count: u16,
    pub robot_count: u8,
    pub protection: ProtectionFlags,
}

impl TimeStatusBlock {
    /// Parse a 13-byte block. Extra trailing bytes are the caller's concern.
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(params: &[u8]) -> Result<Self, CodecError> {
        if params.len() < TIME_STATUS_BLOCK_LEN {
            return Err(CodecError::TooShort(params.len()));
        }
        Ok(Self {
            year: 2000 + u16::from(params[0]),
            month: params[1],
            day: params[2],
            hour: params[3],
            minute: params[4],
            second: params[5],
            weekday: params[6],
            wind_speed: u16::from_be_bytes([params[7], params[8]]),
            box_count: u16::from_be_bytes([params[9], params[10]]),
            robot_count: params[11],
            protection: ProtectionFlags::from_byte(params[12]),
        })
    }
}

/// Reply to a start / scheduled-start request (identifiers `0xF0`/`0xF1`):
/// a 1-byte start flag followed by the time/status block, 14 bytes total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReply {
    pub start_flag: u8,
    pub block: TimeStatusBlock,
}

impl StartReply {
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(params: &[u8]) -> Result<Self, CodecError> {
        if params.len() < 1 + TIME_STATUS_BLOCK_LEN {
            return Err(CodecError::TooShort(params.len()));
        }
        Ok(Self {
            start_flag: params[0],
            block: TimeStatusBlock::parse(&params[1..])?,
        })
    }
}

/// One stored cleaning run (identifier `0xE9` upload)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub duration_minutes: u16,
    pub lap_count: u8,
}

impl CleanRecord {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push((self.year.saturating_sub(2000)) as u8);
        out.push(self.month);
        out.push(self.day);
        out.push(self.hour);
        out.push(self.minute);
        out.extend_from_slice(&self.duration_minutes.to_be_bytes());
        out.push(self.lap_count);
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < CLEAN_RECORD_LEN {
            return Err(CodecError::TooShort(bytes.len()));
        }
        Ok(Self {
            year: 2000 + u16::from(bytes[0]),
            month: bytes[1],
            day: bytes[2],
            hour: bytes[3],
            minute: bytes[4],
            duration_minutes: u16::from_be_bytes([bytes[5], bytes[6]]),
            lap_count: bytes[7],
        })
    }
}

/// Build the cleaning-record upload payload: `[E9, count, record*count]`.
/// At most [`MAX_CLEAN_RECORDS`] records are carried.
#[must_use]
pub fn clean_record_upload(records: &[CleanRecord]) -> Vec<u8> {
    let records = &records[..records.len().min(MAX_CLEAN_RECORDS)];
    let mut out = Vec::with_capacity(2 + records.len() * CLEAN_RECORD_LEN);
    out.push(Identifier::CleanRecordUpload as u8);
    out.push(records.len() as u8);
    for record in records {
        record.encode_into(&mut out);
    }
    out
}

/// Build a scheduled-start request payload (robot-initiated)
#[must_use]
pub fn schedule_start_request(
    task_id: u8,
    weekday: u8,
    hour: u8,
    minute: u8,
    run_count: u8,
) -> Vec<u8> {
    vec![
        Identifier::ScheduleStartReply as u8,
        task_id,
        weekday,
        hour,
        minute,
        run_count,
    ]
}

/// Build a start request payload (robot-initiated)
#[must_use]
pub fn start_request() -> Vec<u8> {
    vec![Identifier::StartReply as u8]
}

/// Build a time-sync request payload (robot-initiated)
#[must_use]
pub fn time_sync_request() -> Vec<u8> {
    vec![Identifier::TimeSync as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block_bytes() -> Vec<u8> {
        vec![
            26, 8, 2, 14, 30, 45, 0, // 2026-08-02 14:30:45 Sunday
            0x00, 0x2A, // wind 4.2 m/s
            0x01, 0x00, // 256 boxes
            12,   // robots
            0x05, // wind + bracket protection
        ]
    }

    #[test]
    fn test_time_status_block_parse() {
        let block = TimeStatusBlock::parse(&sample_block_bytes()).unwrap();
        assert_eq!(block.year, 2026);
        assert_eq!(block.month, 8);
        assert_eq!(block.day, 2);
        assert_eq!(block.hour, 14);
        assert_eq!(block.minute, 30);
        assert_eq!(block.second, 45);
        assert_eq!(block.weekday, 0);
        assert_eq!(block.wind_speed, 42);
        assert_eq!(block.box_count, 256);
        assert_eq!(block.robot_count, 12);
        assert!(block.protection.wind);
        assert!(!block.protection.humidity);
        assert!(block.protection.bracket);
        assert!(!block.protection.ambient_temperature);
    }

    #[test]
    fn test_time_status_block_too_short() {
        assert_eq!(
            TimeStatusBlock::parse(&[26, 8, 2]),
            Err(CodecError::TooShort(3))
        );
    }

    #[test]
    fn test_start_reply_parse() {
        let mut bytes = vec![0x01];
        bytes.extend(sample_block_bytes());
        let reply = StartReply::parse(&bytes).unwrap();
        assert_eq!(reply.start_flag, 1);
        assert_eq!(reply.block.year, 2026);
    }

    #[test]
    fn test_lora_param_set() {
        let set = LoraParamSet::parse(&[0x14, 0x50, 0x01]).unwrap();
        assert_eq!(
            set,
            LoraParamSet {
                power: 0x14,
                frequency: 0x50,
                rate: 0x01
            }
        );
        assert_eq!(set.confirmation_payload(), vec![0xA4, 0x14, 0x50, 0x01]);
    }

    #[test]
    fn test_protection_flags_roundtrip() {
        for bits in 0u8..16 {
            assert_eq!(ProtectionFlags::from_byte(bits).to_byte(), bits);
        }
        // High nibble is ignored
        assert_eq!(ProtectionFlags::from_byte(0xF0).to_byte(), 0);
    }

    #[test]
    fn test_clean_record_upload_caps_at_five() {
        let record = CleanRecord {
            year: 2026,
            month: 7,
            day: 31,
            hour: 6,
            minute: 15,
            duration_minutes: 90,
            lap_count: 3,
        };
        let payload = clean_record_upload(&[record; 7]);
        assert_eq!(payload[0], 0xE9);
        assert_eq!(payload[1], 5);
        assert_eq!(payload.len(), 2 + 5 * CLEAN_RECORD_LEN);

        let parsed = CleanRecord::parse(&payload[2..]).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_request_payloads() {
        assert_eq!(
            schedule_start_request(1, 3, 9, 30, 2),
            vec![0xF0, 1, 3, 9, 30, 2]
        );
        assert_eq!(start_request(), vec![0xF1]);
        assert_eq!(time_sync_request(), vec![0xF2]);
    }
}
