use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ── CapOverflow ───────────────────────────────────────────────────────────────

/// What `play()` does when the voice cap is reached and every active pair is
/// protected, so nothing can be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapOverflow {
    /// Allow exactly one pair above the cap; reject triggers beyond that.
    #[default]
    OverrunByOne,
    /// Reject the new trigger with `EngineError::CapExhausted`.
    Reject,
}

// ── EngineConfig ──────────────────────────────────────────────────────────────

/// Engine tuning knobs. Every field has a default, so a partial JSON document
/// (or an empty one) is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of simultaneously non-stopped voice pairs.
    pub max_voices: usize,
    /// Fade-in applied to every new voice (click suppression).
    pub fade_in_ms: u32,
    /// Fade-out used by stop requests.
    pub fade_out_ms: u32,
    /// Period of the background cleanup sweep.
    pub cleanup_interval_ms: u64,
    /// Upper bound on paths decoded by a preload pass.
    pub preload_limit: usize,
    /// Requested device buffer latency for both buses.
    pub bus_latency_ms: u32,
    pub cap_overflow: CapOverflow,
    /// Initial master gain of the monitor bus (0.0..=1.0).
    pub monitor_volume: f32,
    /// Initial master gain of the inject bus (0.0..=1.0).
    pub inject_volume: f32,
    /// Case-insensitive name fragments used to auto-discover a virtual cable
    /// when no inject device is configured. Checked in order.
    pub virtual_cable_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_voices: 4,
            fade_in_ms: 3,
            fade_out_ms: 15,
            cleanup_interval_ms: 100,
            preload_limit: 50,
            bus_latency_ms: 50,
            cap_overflow: CapOverflow::OverrunByOne,
            monitor_volume: 1.0,
            inject_volume: 1.0,
            virtual_cable_patterns: vec![
                "VoiceMeeter Aux".to_string(),
                "Voicemeeter AUX".to_string(),
                "CABLE Input".to_string(),
            ],
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_voices == 0 {
            return Err(EngineError::Config("max_voices must be at least 1".into()));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(EngineError::Config("cleanup_interval_ms must be non-zero".into()));
        }
        for (name, v) in [
            ("monitor_volume", self.monitor_volume),
            ("inject_volume", self.inject_volume),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::Config(format!("{name} must be within 0.0..=1.0, got {v}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_voices, 4);
        assert_eq!(cfg.fade_in_ms, 3);
        assert_eq!(cfg.fade_out_ms, 15);
        assert_eq!(cfg.cleanup_interval_ms, 100);
        assert_eq!(cfg.preload_limit, 50);
        assert_eq!(cfg.bus_latency_ms, 50);
        assert_eq!(cfg.cap_overflow, CapOverflow::OverrunByOne);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{ "max_voices": 8, "cap_overflow": "reject" }"#)
            .expect("valid config");
        assert_eq!(cfg.max_voices, 8);
        assert_eq!(cfg.cap_overflow, CapOverflow::Reject);
        assert_eq!(cfg.fade_out_ms, 15);
        assert_eq!(cfg.virtual_cable_patterns.len(), 3);
    }

    #[test]
    fn zero_cap_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "max_voices": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn out_of_range_volume_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "inject_volume": 1.5 }"#).unwrap_err();
        assert!(err.to_string().contains("inject_volume"));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(EngineError::Config(_))
        ));
    }
}
