//! Call setup parameters.
//!
//! Loaded from `MESH_*` environment variables by the driver binary, or
//! deserialized from JSON by an embedding call controller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::media::CaptureFormat;
use crate::pairing::MAX_SLOTS;

pub const DEFAULT_TOTAL_SLOTS: u32 = 9;
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("Base room id must not be empty")]
    EmptyRoomId,

    #[error("Total slots must be within 2..={max}, got {total}")]
    InvalidTotalSlots { total: u32, max: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Base call identifier shared by every participant.
    pub room_id: String,
    /// This participant's position in the group, `1..=total_slots`.
    pub slot: u32,
    pub total_slots: u32,
    pub loopback: bool,
    /// Screen capture keeps running while the call is backgrounded.
    pub screencast: bool,
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub video_max_bitrate_kbps: Option<u32>,
    pub capture: CaptureFormat,
    pub audio_enabled: bool,
    /// Disconnect peers that have not reached ICE connected in time.
    /// Unset means no local timeout.
    pub negotiation_timeout_secs: Option<u64>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            room_id: String::new(),
            slot: 1,
            total_slots: DEFAULT_TOTAL_SLOTS,
            loopback: false,
            screencast: false,
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            video_max_bitrate_kbps: None,
            capture: CaptureFormat::default(),
            audio_enabled: true,
            negotiation_timeout_secs: None,
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let room_id = vars
            .get("MESH_ROOM_ID")
            .ok_or_else(|| ConfigError::MissingEnvVar("MESH_ROOM_ID".to_string()))?
            .clone();
        let slot = required(vars, "MESH_SLOT")?;

        let ice_servers = match vars.get("MESH_ICE_SERVERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.ice_servers,
        };

        let capture = CaptureFormat {
            width: parsed(vars, "MESH_CAPTURE_WIDTH")?.unwrap_or(defaults.capture.width),
            height: parsed(vars, "MESH_CAPTURE_HEIGHT")?.unwrap_or(defaults.capture.height),
            framerate: parsed(vars, "MESH_CAPTURE_FPS")?.unwrap_or(defaults.capture.framerate),
        };

        let config = Self {
            room_id,
            slot,
            total_slots: parsed(vars, "MESH_TOTAL_SLOTS")?.unwrap_or(defaults.total_slots),
            loopback: parsed(vars, "MESH_LOOPBACK")?.unwrap_or(defaults.loopback),
            screencast: parsed(vars, "MESH_SCREENCAST")?.unwrap_or(defaults.screencast),
            signaling_url: vars
                .get("MESH_SIGNALING_URL")
                .cloned()
                .unwrap_or(defaults.signaling_url),
            ice_servers,
            video_max_bitrate_kbps: parsed(vars, "MESH_VIDEO_MAX_BITRATE")?,
            capture,
            audio_enabled: parsed(vars, "MESH_AUDIO_ENABLED")?.unwrap_or(defaults.audio_enabled),
            negotiation_timeout_secs: parsed(vars, "MESH_NEGOTIATION_TIMEOUT_SECS")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks the group shape. The own slot is checked by the pairing
    /// scheme so that an out-of-range slot surfaces as a setup error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_id.is_empty() {
            return Err(ConfigError::EmptyRoomId);
        }
        if self.total_slots < 2 || self.total_slots > MAX_SLOTS {
            return Err(ConfigError::InvalidTotalSlots {
                total: self.total_slots,
                max: MAX_SLOTS,
            });
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_secs.map(Duration::from_secs)
    }
}

fn parsed<T: FromStr>(vars: &HashMap<String, String>, var: &str) -> Result<Option<T>, ConfigError> {
    vars.get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value: value.clone(),
            })
        })
        .transpose()
}

fn required<T: FromStr>(vars: &HashMap<String, String>, var: &str) -> Result<T, ConfigError> {
    parsed(vars, var)?.ok_or_else(|| ConfigError::MissingEnvVar(var.to_string()))
}
