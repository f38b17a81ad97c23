//! Configuration loading (§4, ambient stack; grounded on `config.py` and
//! `gouthamsk98-VAD-Sensor-Bridge/src/config.rs`'s `clap::Parser` shape).
//!
//! The on-disk JSON mirrors the original's
//! `shadow.state.desired.software_configuration[0]` navigation exactly,
//! including that `tone_detect`/`tone_detect_configuration` live *per
//! channel* rather than at the device level (`config.py`'s
//! `ChannelConfig.tone_detect`), and that several numeric fields
//! (`threshold`, `gain`, `tone_a`/`tone_b`, tone lengths, filter
//! frequencies) may arrive as either a JSON string or a JSON number —
//! `config.py` reads them with `float(x.get(key, "0.5"))`, which coerces
//! either representation, so [`LenientF64`] does the same here.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};

use crate::constants::KEY_LEN;
use crate::crypto::decode_base64;
use crate::error::ConfigError;
use crate::tone::{FilterKind, FrequencyFilter, ToneDefinition, ToneDetectConfig};

#[derive(Parser, Debug)]
#[command(name = "echostream", about = "PTT radio-to-cloud voice relay bridge")]
pub struct Args {
    /// Path to the device configuration JSON document.
    #[arg(long, default_value = "/etc/echostream/config.json")]
    pub config: PathBuf,

    /// Validate configuration and exit without starting any workers.
    #[arg(long)]
    pub dry_run: bool,
}

/// A JSON value that deserializes from either a string or a number into
/// an `f64`, matching `config.py`'s lenient numeric parsing.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct LenientF64(pub f64);

impl<'de> Deserialize<'de> for LenientF64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LenientVisitor;

        impl<'de> Visitor<'de> for LenientVisitor {
            type Value = LenientF64;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a number or a numeric string")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(LenientF64(v))
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(LenientF64(v as f64))
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(LenientF64(v as f64))
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.trim().parse::<f64>().map(LenientF64).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(LenientVisitor)
    }
}

#[derive(Debug, Deserialize)]
struct RawAlertDetails {
    #[serde(default)]
    threshold: Option<LenientF64>,
    #[serde(default)]
    gain: Option<LenientF64>,
    #[serde(default)]
    db: Option<LenientF64>,
    #[serde(default)]
    detect_new_tones: bool,
    #[serde(default)]
    new_tone_length: Option<LenientF64>,
    #[serde(default)]
    new_tone_range: Option<LenientF64>,
}

#[derive(Debug, Deserialize)]
struct RawToneDefinition {
    #[serde(default)]
    tone_id: Option<String>,
    tone_a: LenientF64,
    tone_b: LenientF64,
    /// Seconds in the original JSON; converted to milliseconds on load.
    #[serde(default)]
    tone_a_length: Option<LenientF64>,
    #[serde(default)]
    tone_b_length: Option<LenientF64>,
    #[serde(default)]
    tone_a_range: Option<LenientF64>,
    #[serde(default)]
    tone_b_range: Option<LenientF64>,
    /// Seconds in the original JSON; converted to milliseconds on load.
    #[serde(default)]
    record_length: Option<LenientF64>,
    #[serde(default)]
    detection_tone_alert: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFilterFrequency {
    #[serde(default)]
    filter_id: Option<String>,
    frequency: LenientF64,
    #[serde(default)]
    filter_range: Option<LenientF64>,
    #[serde(rename = "type", default)]
    filter_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawToneDetectConfiguration {
    #[serde(default)]
    tone_passthrough: bool,
    /// `"channel_one"`..`"channel_four"`, resolved against the device's
    /// four positional channel slots at load time (§9 OQ1 keeps PTT lines
    /// and this passthrough target both positional, not name-matched).
    #[serde(default)]
    passthrough_channel: Option<String>,
    #[serde(default)]
    alert_details: Option<RawAlertDetails>,
    #[serde(default)]
    alert_tones: Vec<RawToneDefinition>,
    #[serde(default)]
    filter_frequencies: Vec<RawFilterFrequency>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    #[serde(default)]
    channel_id: String,
    /// Parsed but unused — see §9 OQ1 / `DESIGN.md`: PTT lines map to
    /// channels positionally, not via these flags.
    #[serde(default)]
    input_low_one: Option<bool>,
    #[serde(default)]
    input_low_two: Option<bool>,
    #[serde(default)]
    input_high_one: Option<bool>,
    #[serde(default)]
    input_high_two: Option<bool>,
    #[serde(default)]
    tone_detect: bool,
    #[serde(default)]
    tone_detect_configuration: Option<RawToneDetectConfiguration>,
}

#[derive(Debug, Deserialize)]
struct RawSoftwareConfiguration {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    agency_name: Option<String>,
    #[serde(default)]
    websocket_url: Option<String>,
    /// The pre-shared AES-256 key, base64-encoded (§6 Configuration
    /// input). Installed into every active channel once the signalling
    /// channel activates the UDP transport (§4.9) — not carried by the
    /// signalling channel itself, which only hands back `udp_host`/
    /// `udp_port`/`websocket_id` (§6 Signalling channel).
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    channel_one: Option<RawChannel>,
    #[serde(default)]
    channel_two: Option<RawChannel>,
    #[serde(default)]
    channel_three: Option<RawChannel>,
    #[serde(default)]
    channel_four: Option<RawChannel>,
}

#[derive(Debug, Deserialize)]
struct RawDesired {
    software_configuration: Vec<RawSoftwareConfiguration>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    desired: RawDesired,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    state: RawState,
    #[serde(default)]
    shadow: Option<RawShadowWrapper>,
}

#[derive(Debug, Deserialize)]
struct RawShadowWrapper {
    state: RawState,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub channel_id: String,
}

#[derive(Debug, Clone)]
pub struct EchoStreamConfig {
    pub device_id: String,
    pub agency_name: String,
    pub websocket_url: String,
    pub channels: Vec<ChannelConfig>,
    /// The channel that owns tone detection (`ChannelConfig.tone_detect ==
    /// true` in the original), identified by `channel_id` rather than
    /// array position so compacted slot lists (a missing `channel_two`,
    /// say) can't desync the source/passthrough lookups in `main`.
    pub tone_detect_source_channel_id: Option<String>,
    pub tone_detect: Option<ToneDetectConfig>,
    /// Pre-shared AES-256 key (§6 Configuration input), decoded once here
    /// rather than re-validated at every channel install site. `None`
    /// when the document carries no `session_key` field; channels then
    /// stay keyless and the transport's existing zero-key warn-once path
    /// (§4.7) covers the rest.
    pub session_key: Option<[u8; KEY_LEN]>,
}

fn filter_kind(raw: Option<&str>) -> FilterKind {
    match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("above") => FilterKind::Above,
        Some("below") => FilterKind::Below,
        _ => FilterKind::Center,
    }
}

/// Maps a `"channel_one"`..`"channel_four"` name to its positional slot
/// (0-3), mirroring `audio.py`'s `is_configured_passthrough_channel_id`.
fn named_slot_index(name: &str) -> Option<usize> {
    match name {
        "channel_one" => Some(0),
        "channel_two" => Some(1),
        "channel_three" => Some(2),
        "channel_four" => Some(3),
        _ => None,
    }
}

fn named_slots(raw: &RawSoftwareConfiguration) -> [Option<&RawChannel>; 4] {
    [raw.channel_one.as_ref(), raw.channel_two.as_ref(), raw.channel_three.as_ref(), raw.channel_four.as_ref()]
}

fn build_channels(raw: &RawSoftwareConfiguration) -> Vec<ChannelConfig> {
    let mut channels: Vec<ChannelConfig> = named_slots(raw)
        .into_iter()
        .flatten()
        .filter(|c| !c.channel_id.is_empty())
        .map(|c| ChannelConfig { channel_id: c.channel_id.clone() })
        .collect();

    // `main.py` falls back to a single generic channel id when none are
    // configured, rather than refusing to start.
    if channels.is_empty() {
        channels.push(ChannelConfig { channel_id: "channel_1".to_string() });
    }
    channels
}

fn build_tone_definition(i: usize, t: &RawToneDefinition) -> ToneDefinition {
    let a_length_s = t.tone_a_length.map(|v| v.0).unwrap_or(0.5);
    let b_length_s = t.tone_b_length.map(|v| v.0).unwrap_or(0.5);
    let record_length_s = t.record_length.map(|v| v.0).unwrap_or(30.0);

    ToneDefinition {
        id: t.tone_id.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| format!("tone_{i}")),
        tone_a_hz: t.tone_a.0,
        tone_b_hz: t.tone_b.0,
        a_length_ms: (a_length_s * 1000.0) as u64,
        b_length_ms: (b_length_s * 1000.0) as u64,
        a_range_hz: t.tone_a_range.map(|r| r.0).unwrap_or(10.0),
        b_range_hz: t.tone_b_range.map(|r| r.0).unwrap_or(10.0),
        record_length_ms: (record_length_s * 1000.0) as u64,
        alert_id: t.detection_tone_alert.clone().filter(|s| !s.is_empty()),
    }
}

fn build_frequency_filter(i: usize, f: &RawFilterFrequency) -> FrequencyFilter {
    FrequencyFilter {
        id: f.filter_id.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| format!("filter_{i}")),
        kind: filter_kind(f.filter_type.as_deref()),
        frequency_hz: f.frequency.0,
        range_hz: f.filter_range.map(|r| r.0).unwrap_or(100.0),
    }
}

/// Builds the tone-detect configuration for whichever channel slot has
/// `tone_detect == true`, plus that channel's `channel_id` so `main` can
/// identify the broadcast-source channel without relying on array
/// position. Only the first such slot is honored (the schema allows more
/// than one, but the core pipeline wires exactly one source channel).
fn build_tone_detect(raw: &RawSoftwareConfiguration) -> Option<(String, ToneDetectConfig)> {
    let slots = named_slots(raw);
    let (_, channel) = slots
        .iter()
        .enumerate()
        .find_map(|(i, c)| c.filter(|c| c.tone_detect).map(|c| (i, c)))?;

    if channel.channel_id.is_empty() {
        return None;
    }
    let cfg = channel.tone_detect_configuration.as_ref()?;

    let tone_defs: Vec<ToneDefinition> =
        cfg.alert_tones.iter().enumerate().map(|(i, t)| build_tone_definition(i, t)).collect();
    let filters: Vec<FrequencyFilter> =
        cfg.filter_frequencies.iter().enumerate().map(|(i, f)| build_frequency_filter(i, f)).collect();

    let passthrough_channel_id = cfg
        .passthrough_channel
        .as_deref()
        .and_then(named_slot_index)
        .and_then(|idx| slots[idx])
        .map(|c| c.channel_id.clone())
        .filter(|id| !id.is_empty());

    let alert = cfg.alert_details.as_ref();

    let tone_detect = ToneDetectConfig {
        enabled: true,
        tone_defs,
        filters,
        tone_passthrough: cfg.tone_passthrough,
        passthrough_channel_id,
        threshold: alert.and_then(|a| a.threshold).map(|v| v.0).unwrap_or(0.5),
        gain: alert.and_then(|a| a.gain).map(|v| v.0).unwrap_or(1.0),
        db_threshold: alert.and_then(|a| a.db).map(|v| v.0).unwrap_or(30.0),
        new_tone_detect: alert.map(|a| a.detect_new_tones).unwrap_or(false),
        new_tone_length_ms: alert.and_then(|a| a.new_tone_length).map(|v| (v.0 * 1000.0) as u64).unwrap_or(500),
        new_tone_range_hz: alert.and_then(|a| a.new_tone_range).map(|v| v.0).unwrap_or(50.0),
    };

    Some((channel.channel_id.clone(), tone_detect))
}

pub fn load(path: impl AsRef<Path>) -> Result<EchoStreamConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    let doc: RawDocument = serde_json::from_str(&text)?;

    let desired = match doc.shadow {
        Some(wrapper) => wrapper.state.desired,
        None => doc.state.desired,
    };

    let raw = desired
        .software_configuration
        .into_iter()
        .next()
        .ok_or(ConfigError::MissingSoftwareConfiguration)?;

    let channels = build_channels(&raw);
    let (tone_detect_source_channel_id, tone_detect) = match build_tone_detect(&raw) {
        Some((channel_id, cfg)) => (Some(channel_id), Some(cfg)),
        None => (None, None),
    };
    let session_key = build_session_key(raw.session_key.as_deref())?;

    Ok(EchoStreamConfig {
        device_id: raw.device_id.unwrap_or_else(|| "unknown-device".to_string()),
        agency_name: raw.agency_name.unwrap_or_else(|| "TestAgency".to_string()),
        websocket_url: raw.websocket_url.unwrap_or_else(|| "wss://audio.redenes.org/ws/".to_string()),
        channels,
        tone_detect_source_channel_id,
        tone_detect,
        session_key,
    })
}

/// Decodes the base64 `session_key` field into a fixed-size key, failing
/// loudly rather than silently running keyless if the document carries a
/// malformed or wrong-length value. Absent field stays `None`.
fn build_session_key(raw: Option<&str>) -> Result<Option<[u8; KEY_LEN]>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let bytes = decode_base64(raw);
    let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| ConfigError::InvalidSessionKey)?;
    Ok(Some(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_channels_and_lenient_numbers() {
        let file = write_config(
            r#"{
                "state": {
                    "desired": {
                        "software_configuration": [{
                            "device_id": "dev-1",
                            "channel_one": {"channel_id": "alpha"},
                            "channel_two": {
                                "channel_id": "bravo",
                                "tone_detect": true,
                                "tone_detect_configuration": {
                                    "tone_passthrough": true,
                                    "passthrough_channel": "channel_one",
                                    "alert_details": {
                                        "threshold": "0.5",
                                        "gain": 2.0,
                                        "db": 25,
                                        "detect_new_tones": true,
                                        "new_tone_length": "2.0",
                                        "new_tone_range": 15
                                    },
                                    "alert_tones": [{
                                        "tone_id": "page1",
                                        "tone_a": "800.0",
                                        "tone_b": 1000.0,
                                        "tone_a_length": "1.0",
                                        "tone_b_length": 3.0,
                                        "tone_a_range": 20,
                                        "tone_b_range": 12,
                                        "record_length": 10
                                    }],
                                    "filter_frequencies": [{
                                        "filter_id": "f1",
                                        "type": "above",
                                        "frequency": "3000"
                                    }]
                                }
                            }
                        }]
                    }
                }
            }"#,
        );

        let config = load(file.path()).unwrap();
        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].channel_id, "alpha");
        assert_eq!(config.tone_detect_source_channel_id.as_deref(), Some("bravo"));

        let tone = config.tone_detect.unwrap();
        assert_eq!(tone.tone_defs.len(), 1);
        assert_eq!(tone.tone_defs[0].a_length_ms, 1000);
        assert_eq!(tone.tone_defs[0].b_length_ms, 3000);
        assert_eq!(tone.tone_defs[0].a_range_hz, 20.0);
        assert_eq!(tone.tone_defs[0].b_range_hz, 12.0);
        assert_eq!(tone.tone_defs[0].record_length_ms, 10_000);
        assert!((tone.threshold - 0.5).abs() < 1e-9);
        assert_eq!(tone.new_tone_length_ms, 2000);
        assert_eq!(tone.filters.len(), 1);
        assert_eq!(tone.passthrough_channel_id.as_deref(), Some("alpha"));
    }

    #[test]
    fn missing_channels_falls_back_to_generic_default() {
        let file = write_config(r#"{"state": {"desired": {"software_configuration": [{"device_id": "dev-2"}]}}}"#);
        let config = load(file.path()).unwrap();
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].channel_id, "channel_1");
        assert!(config.tone_detect.is_none());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = load("/nonexistent/path/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn empty_software_configuration_is_an_error() {
        let file = write_config(r#"{"state": {"desired": {"software_configuration": []}}}"#);
        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSoftwareConfiguration));
    }

    #[test]
    fn loads_a_valid_session_key() {
        let file = write_config(
            r#"{
                "state": {
                    "desired": {
                        "software_configuration": [{
                            "session_key": "46dR4QR5KH7JhPyyjh/ZS4ki/3QBVwwOTkkQTdZQkC0="
                        }]
                    }
                }
            }"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.session_key.unwrap().len(), KEY_LEN);
    }

    #[test]
    fn missing_session_key_is_none() {
        let file = write_config(r#"{"state": {"desired": {"software_configuration": [{}]}}}"#);
        let config = load(file.path()).unwrap();
        assert!(config.session_key.is_none());
    }

    #[test]
    fn malformed_session_key_is_a_config_error() {
        let file = write_config(
            r#"{"state": {"desired": {"software_configuration": [{"session_key": "dG9vc2hvcnQ="}]}}}"#,
        );
        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSessionKey));
    }

    #[test]
    fn tone_detect_defaults_fill_in_unspecified_fields() {
        let file = write_config(
            r#"{
                "state": {
                    "desired": {
                        "software_configuration": [{
                            "channel_one": {
                                "channel_id": "solo",
                                "tone_detect": true,
                                "tone_detect_configuration": {
                                    "alert_tones": [{"tone_a": 700, "tone_b": 1200}]
                                }
                            }
                        }]
                    }
                }
            }"#,
        );
        let config = load(file.path()).unwrap();
        let tone = config.tone_detect.unwrap();
        let def = &tone.tone_defs[0];
        assert_eq!(def.a_length_ms, 500);
        assert_eq!(def.b_length_ms, 500);
        assert_eq!(def.a_range_hz, 10.0);
        assert_eq!(def.record_length_ms, 30_000);
        assert!(def.id.starts_with("tone_"));
    }
}
