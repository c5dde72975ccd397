//! JSON envelope carrying frames over the broker
//!
//! Uplink: `{"devEui": "...", "devAddr": "...", "data": "<base64 frame>"}`,
//! rendered from a template loaded once at startup. Downlink: the same
//! shape; only `devEui` (routing) and `data` (frame) are read, any other
//! fields are ignored.

use crate::encoding::{from_base64, to_base64};
use crate::types::EnvelopeError;
use std::path::Path;

/// Template placeholders
const PLACEHOLDER_DEV_EUI: &str = "{{DEV_EUI}}";
const PLACEHOLDER_DEV_ADDR: &str = "{{DEV_ADDR}}";
const PLACEHOLDER_DATA: &str = "{{DATA}}";

/// Built-in template used when no template file is present
pub const DEFAULT_UPLINK_TEMPLATE: &str =
    r#"{"devEui":"{{DEV_EUI}}","devAddr":"{{DEV_ADDR}}","data":"{{DATA}}"}"#;

/// The devAddr is the final 8 hex characters of the devEui
#[must_use]
pub fn dev_addr(dev_eui: &str) -> &str {
    if dev_eui.len() >= 8 {
        &dev_eui[dev_eui.len() - 8..]
    } else {
        dev_eui
    }
}

/// Uplink envelope template, loaded once and shared across all robots
#[derive(Debug, Clone)]
pub struct UplinkTemplate {
    template: String,
}

impl Default for UplinkTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_UPLINK_TEMPLATE.to_string(),
        }
    }
}

impl UplinkTemplate {
    /// Load the template from a file, falling back to the built-in default
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!("loaded uplink template from {:?}", path);
                Self { template: contents }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no uplink template at {:?}, using built-in", path);
                Self::default()
            }
            Err(e) => {
                tracing::warn!("failed to read uplink template {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Render the envelope for one encoded frame
    #[must_use]
    pub fn render(&self, dev_eui: &str, frame_bytes: &[u8]) -> String {
        self.template
            .replace(PLACEHOLDER_DEV_EUI, dev_eui)
            .replace(PLACEHOLDER_DEV_ADDR, dev_addr(dev_eui))
            .replace(PLACEHOLDER_DATA, &to_base64(frame_bytes))
    }
}

/// A parsed downlink envelope: routing key plus the raw frame bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkEnvelope {
    pub dev_eui: String,
    pub data: Vec<u8>,
}

impl DownlinkEnvelope {
    /// Parse a broker message into a routable envelope
    ///
    /// Requires `devEui` and `data`; verifies the topic contains the
    /// `devEui` substring as defense-in-depth against broker mis-routing.
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;

        let dev_eui = value
            .get("devEui")
            .and_then(|v| v.as_str())
            .ok_or(EnvelopeError::MissingField("devEui"))?
            .to_string();
        let data_b64 = value
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or(EnvelopeError::MissingField("data"))?;

        if !topic.contains(&dev_eui) {
            return Err(EnvelopeError::TopicMismatch {
                topic: topic.to_string(),
                dev_eui,
            });
        }

        let data = from_base64(data_b64)?;
        Ok(Self { dev_eui, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_addr_is_last_eight() {
        assert_eq!(dev_addr("303930306350729d"), "6350729d");
        assert_eq!(dev_addr("729d"), "729d");
    }

    #[test]
    fn test_render_default_template() {
        let template = UplinkTemplate::default();
        let rendered = template.render("303930306350729d", &[0x68, 0x16]);
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["devEui"], "303930306350729d");
        assert_eq!(value["devAddr"], "6350729d");
        assert_eq!(value["data"], "aBY=");
    }

    #[test]
    fn test_parse_roundtrip() {
        let template = UplinkTemplate::default();
        let frame = vec![0x68, 0x82, 0x00, 0x01, 0x00, 0x01, 0xF2, 0x76, 0x16];
        let rendered = template.render("303930306350729d", &frame);

        let topic = "application/app/device/303930306350729d/command/down";
        let envelope = DownlinkEnvelope::parse(topic, rendered.as_bytes()).unwrap();
        assert_eq!(envelope.dev_eui, "303930306350729d");
        assert_eq!(envelope.data, frame);
    }

    #[test]
    fn test_parse_ignores_extra_fields() {
        let payload = br#"{"devEui":"abcd1234","data":"aBY=","fPort":10,"rssi":-80}"#;
        let envelope = DownlinkEnvelope::parse("x/abcd1234/y", payload).unwrap();
        assert_eq!(envelope.data, vec![0x68, 0x16]);
    }

    #[test]
    fn test_parse_missing_field() {
        let payload = br#"{"devEui":"abcd1234"}"#;
        let err = DownlinkEnvelope::parse("x/abcd1234/y", payload).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingField("data")));
    }

    #[test]
    fn test_parse_topic_mismatch() {
        let payload = br#"{"devEui":"abcd1234","data":"aBY="}"#;
        let err = DownlinkEnvelope::parse("x/ffff0000/y", payload).unwrap_err();
        assert!(matches!(err, EnvelopeError::TopicMismatch { .. }));
    }

    #[test]
    fn test_parse_bad_base64() {
        let payload = br#"{"devEui":"abcd1234","data":"a!Y="}"#;
        let err = DownlinkEnvelope::parse("x/abcd1234/y", payload).unwrap_err();
        assert!(matches!(err, EnvelopeError::Base64(_)));
    }

    #[test]
    fn test_parse_bad_json() {
        let err = DownlinkEnvelope::parse("t", b"not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Json(_)));
    }
}
