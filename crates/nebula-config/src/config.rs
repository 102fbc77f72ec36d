//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for a prediction host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Prediction / rollback settings consumed at instance registration.
    pub prediction: PredictionConfig,
    /// Lag-compensation rewind limits.
    pub lag_compensation: LagCompensationConfig,
    /// Transport settings used by hosts that wire the engine to a socket.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// How an instance advances its simulation frames.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TickingPolicy {
    /// Each instance advances on its own accumulated-time schedule.
    Independent,
    /// All instances share one global, fixed-duration step.
    #[default]
    Fixed,
}

/// How a non-owning client presents a remote instance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NetworkLod {
    /// Buffered interpolation between received frames; no local simulation.
    #[default]
    Interpolated,
    /// Reserved extrapolation mode; treated like `Interpolated` by the service mapping.
    SimExtrapolate,
    /// Simulated locally in lockstep with the owning client's prediction.
    ForwardPredict,
}

/// Prediction and rollback settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PredictionConfig {
    /// Ticking policy used when a simulation supports both.
    pub preferred_ticking_policy: TickingPolicy,
    /// Fixed-step simulation rate in Hz.
    pub fixed_tick_rate_hz: f32,
    /// Default LOD for simulated proxies.
    pub simulated_proxy_lod: NetworkLod,
    /// Enable the fixed-tick smoothing service for locally simulated instances.
    pub enable_fixed_smoothing: bool,
    /// Fraction of the remaining correction applied per fixed step (0.1 - 1.0).
    pub smoothing_speed: f32,
    /// Frames retained in each instance's ring buffer.
    pub frame_buffer_capacity: usize,
    /// Buffered time kept for fixed-tick interpolated instances (client only).
    pub fixed_interpolation_buffered_ms: i32,
    /// Buffered time kept for independent-tick interpolated instances (client only).
    pub independent_interpolation_buffered_ms: i32,
    /// Upper bound on buffered independent interpolation time before snapping.
    pub independent_interpolation_max_buffered_ms: i32,
    /// Most recent input commands sent together per fixed-tick update.
    pub fixed_input_send_count: i32,
    /// Most recent input commands sent together per independent-tick update.
    pub independent_input_send_count: i32,
    /// Input commands the authority tries to keep buffered per connection.
    pub desired_buffered_inputs: i32,
    /// Buffered inputs beyond which the authority skips ahead.
    pub max_buffered_inputs: i32,
    /// Time dilation tuning used by the authority.
    pub time_dilation: TimeDilationConfig,
}

/// Tuning for the authority's input-buffer driven time dilation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeDilationConfig {
    /// Disable dilation entirely (always 1.0).
    pub disabled: bool,
    /// Dilation added per frame of buffer error.
    pub amount: f32,
    /// Decay applied per frame of buffer error.
    pub escalation_decay: f32,
    /// Lower bound of the decay factor.
    pub escalation_decay_max: f32,
    /// Minimum dilation.
    pub min: f32,
    /// Maximum dilation.
    pub max: f32,
}

/// Lag-compensation rewind limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LagCompensationConfig {
    /// Base rewind limit in milliseconds (interpolation and input slack are added).
    pub max_rewind_ms: i32,
    /// Minimum history kept per actor, in milliseconds.
    pub max_buffered_history_ms: i32,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Simulated one-way latency in milliseconds.
    pub latency_ms: u32,
    /// Simulated packet loss (0.0 - 1.0).
    pub packet_loss: f32,
    /// Number of client connections.
    pub clients: u32,
    /// Send rate for authority updates (Hz).
    pub net_send_rate_hz: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Log every reconcile decision at info level.
    pub print_reconciles: bool,
}

// --- Default implementations ---

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            preferred_ticking_policy: TickingPolicy::Fixed,
            fixed_tick_rate_hz: 62.5,
            simulated_proxy_lod: NetworkLod::Interpolated,
            enable_fixed_smoothing: true,
            smoothing_speed: 0.1,
            frame_buffer_capacity: 64,
            fixed_interpolation_buffered_ms: 100,
            independent_interpolation_buffered_ms: 100,
            independent_interpolation_max_buffered_ms: 250,
            fixed_input_send_count: 6,
            independent_input_send_count: 6,
            desired_buffered_inputs: 4,
            max_buffered_inputs: 32,
            time_dilation: TimeDilationConfig::default(),
        }
    }
}

impl Default for TimeDilationConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            amount: 0.01,
            escalation_decay: 0.05,
            escalation_decay_max: 0.5,
            min: 0.9,
            max: 1.1,
        }
    }
}

impl Default for LagCompensationConfig {
    fn default() -> Self {
        Self {
            max_rewind_ms: 200,
            max_buffered_history_ms: 1000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            packet_loss: 0.0,
            clients: 2,
            net_send_rate_hz: 62,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            print_reconciles: false,
        }
    }
}

// --- Validation ---

impl PredictionConfig {
    /// Fixed step duration in whole milliseconds, as seen by simulations.
    pub fn fixed_step_ms(&self) -> i32 {
        (1000.0 / self.fixed_tick_rate_hz) as i32
    }

    /// Fixed step duration in real (fractional) milliseconds.
    pub fn fixed_step_real_time_ms(&self) -> f32 {
        1000.0 / self.fixed_tick_rate_hz
    }

    /// Check the settings the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fixed_tick_rate_hz > 0.0 && self.fixed_tick_rate_hz <= 1000.0) {
            return Err(ConfigError::Invalid {
                field: "fixed_tick_rate_hz",
                reason: format!("{} is outside (0, 1000]", self.fixed_tick_rate_hz),
            });
        }
        if self.frame_buffer_capacity < 2 {
            return Err(ConfigError::Invalid {
                field: "frame_buffer_capacity",
                reason: "at least two frames are required".to_string(),
            });
        }
        if !(0.1..=1.0).contains(&self.smoothing_speed) {
            return Err(ConfigError::Invalid {
                field: "smoothing_speed",
                reason: format!("{} is outside [0.1, 1.0]", self.smoothing_speed),
            });
        }
        if self.fixed_input_send_count < 1 || self.independent_input_send_count < 1 {
            return Err(ConfigError::Invalid {
                field: "input_send_count",
                reason: "at least one input must be sent per update".to_string(),
            });
        }
        if self.independent_interpolation_max_buffered_ms
            < self.independent_interpolation_buffered_ms
        {
            return Err(ConfigError::Invalid {
                field: "independent_interpolation_max_buffered_ms",
                reason: "must not be below independent_interpolation_buffered_ms".to_string(),
            });
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("fixed_tick_rate_hz: 62.5"));
        assert!(ron_str.contains("max_rewind_ms: 200"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(prediction: (fixed_tick_rate_hz: 30.0))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.prediction.fixed_tick_rate_hz, 30.0);
        assert_eq!(config.prediction.fixed_input_send_count, 6);
        assert_eq!(config.lag_compensation, LagCompensationConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.prediction.fixed_tick_rate_hz = 30.0;
        config.prediction.simulated_proxy_lod = NetworkLod::ForwardPredict;
        config.network.latency_ms = 120;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.prediction.desired_buffered_inputs = 8;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().prediction.desired_buffered_inputs, 8);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_fixed_step_derivation() {
        let config = PredictionConfig::default();
        assert_eq!(config.fixed_step_ms(), 16);
        assert!((config.fixed_step_real_time_ms() - 16.0).abs() < 1e-4);

        let thirty = PredictionConfig {
            fixed_tick_rate_hz: 30.0,
            ..PredictionConfig::default()
        };
        assert_eq!(thirty.fixed_step_ms(), 33);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PredictionConfig::default().validate().is_ok());

        let zero_rate = PredictionConfig {
            fixed_tick_rate_hz: 0.0,
            ..PredictionConfig::default()
        };
        assert!(matches!(
            zero_rate.validate(),
            Err(ConfigError::Invalid { field: "fixed_tick_rate_hz", .. })
        ));

        let tiny_buffer = PredictionConfig {
            frame_buffer_capacity: 1,
            ..PredictionConfig::default()
        };
        assert!(tiny_buffer.validate().is_err());

        let no_smoothing = PredictionConfig {
            smoothing_speed: 0.0,
            ..PredictionConfig::default()
        };
        assert!(no_smoothing.validate().is_err());
    }
}
