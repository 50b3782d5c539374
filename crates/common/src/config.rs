use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "GAZER";
pub const CONFIG_PATH_ENV: &str = "GAZER_CONFIG";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Simulated,
    Stdin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub source: SourceKind,
    pub simulated_rate_hz: f64,
    // Maximum sample age still reported as healthy.
    pub freshness_window_ms: u64,
    pub source_timeout_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub stream_buffer: usize,
    pub stream_stall_limit: u32,
    // Reported to consumers only; samples below it are still published.
    pub min_confidence: f64,
    pub calibration_offset_x: Option<f64>,
    pub calibration_offset_y: Option<f64>,
    pub calibration_scale_x: Option<f64>,
    pub calibration_scale_y: Option<f64>,
    pub log_dir: Option<PathBuf>,
}

/// Offset/scale coefficients supplied through configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOverride {
    pub offset_x: f64,
    pub offset_y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5055,
            source: SourceKind::Simulated,
            simulated_rate_hz: 60.0,
            freshness_window_ms: 500,
            source_timeout_ms: 100,
            rate_limit_max: 120,
            rate_limit_window_ms: 1000,
            stream_buffer: 64,
            stream_stall_limit: 256,
            min_confidence: 0.0,
            calibration_offset_x: None,
            calibration_offset_y: None,
            calibration_scale_x: None,
            calibration_scale_y: None,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional TOML file, then `GAZER_*` environment variables.
    /// Without an explicit path, `$GAZER_CONFIG` names the file if set.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let config_path = config_path.or(env_path.as_deref());
        let mut builder = Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("port", 5055)?
            .set_default("source", "simulated")?
            .set_default("simulated_rate_hz", 60.0)?
            .set_default("freshness_window_ms", 500)?
            .set_default("source_timeout_ms", 100)?
            .set_default("rate_limit_max", 120)?
            .set_default("rate_limit_window_ms", 1000)?
            .set_default("stream_buffer", 64)?
            .set_default("stream_stall_limit", 256)?
            .set_default("min_confidence", 0.0)?;

        if let Some(path) = config_path {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            builder = builder.add_source(File::from(path.to_path_buf()));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX));

        let app_config: AppConfig = builder.build()?.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.freshness_window_ms == 0 {
            bail!("freshness_window_ms must be positive");
        }
        if self.source_timeout_ms == 0 {
            bail!("source_timeout_ms must be positive");
        }
        if self.rate_limit_max == 0 || self.rate_limit_window_ms == 0 {
            bail!("rate_limit_max and rate_limit_window_ms must be positive");
        }
        if self.stream_buffer == 0 || self.stream_stall_limit == 0 {
            bail!("stream_buffer and stream_stall_limit must be positive");
        }
        if !(self.simulated_rate_hz.is_finite() && self.simulated_rate_hz > 0.0) {
            bail!("simulated_rate_hz must be a positive number");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            bail!("min_confidence must lie within [0, 1]");
        }
        if let Some(o) = self.calibration_override() {
            if o.scale_x == 0.0 || o.scale_y == 0.0 {
                bail!("calibration scale overrides must be non-zero");
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// First address `host:port` resolves to.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = self.bind_addr();
        addr.to_socket_addrs()
            .with_context(|| format!("resolve {addr}"))?
            .next()
            .ok_or_else(|| anyhow!("{addr} did not resolve to any address"))
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    /// Present when any coefficient is configured; the rest default to identity.
    pub fn calibration_override(&self) -> Option<CalibrationOverride> {
        let any = self.calibration_offset_x.is_some()
            || self.calibration_offset_y.is_some()
            || self.calibration_scale_x.is_some()
            || self.calibration_scale_y.is_some();
        any.then(|| CalibrationOverride {
            offset_x: self.calibration_offset_x.unwrap_or(0.0),
            offset_y: self.calibration_offset_y.unwrap_or(0.0),
            scale_x: self.calibration_scale_x.unwrap_or(1.0),
            scale_y: self.calibration_scale_y.unwrap_or(1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        fs,
        sync::{Mutex, OnceLock},
    };

    fn set_env(key: &str, val: impl AsRef<std::ffi::OsStr>) {
        unsafe { std::env::set_var(key, val) };
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        let guard = LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let result = f();
        drop(guard);
        result
    }

    #[test]
    fn load_without_file_matches_defaults() {
        with_env_lock(|| {
            let cfg = AppConfig::load(None).expect("load defaults");
            let defaults = AppConfig::default();
            assert_eq!(cfg.host, defaults.host);
            assert_eq!(cfg.port, defaults.port);
            assert_eq!(cfg.source, SourceKind::Simulated);
            assert_eq!(cfg.freshness_window(), Duration::from_millis(500));
            assert_eq!(cfg.rate_limit_max, 120);
            assert_eq!(cfg.stream_buffer, 64);
            assert!(cfg.calibration_override().is_none());
            assert!(cfg.log_dir.is_none());
            assert_eq!(cfg.socket_addr().unwrap(), "127.0.0.1:5055".parse::<SocketAddr>().unwrap());
        });
    }

    #[test]
    fn file_values_are_overridden_by_environment() {
        with_env_lock(|| {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("gazer.toml");
            fs::write(
                &path,
                "port = 6000\n\
                 source = \"stdin\"\n\
                 freshness_window_ms = 250\n\
                 rate_limit_max = 10\n\
                 calibration_scale_x = 1920.0\n",
            )
            .expect("write config");

            set_env("GAZER_PORT", "7000");
            set_env("GAZER_CALIBRATION_OFFSET_Y", "-12.5");

            let cfg = AppConfig::load(Some(&path));

            remove_env("GAZER_PORT");
            remove_env("GAZER_CALIBRATION_OFFSET_Y");

            let cfg = cfg.expect("load config");
            assert_eq!(cfg.port, 7000, "env override should win");
            assert_eq!(cfg.source, SourceKind::Stdin);
            assert_eq!(cfg.freshness_window_ms, 250);
            assert_eq!(cfg.rate_limit_max, 10);
            assert_eq!(
                cfg.calibration_override(),
                Some(CalibrationOverride {
                    offset_x: 0.0,
                    offset_y: -12.5,
                    scale_x: 1920.0,
                    scale_y: 1.0,
                })
            );
        });
    }

    #[test]
    fn config_path_can_come_from_environment() {
        with_env_lock(|| {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("gazer.toml");
            fs::write(&path, "host = \"0.0.0.0\"\nstream_buffer = 8\n").expect("write config");

            set_env(CONFIG_PATH_ENV, &path);
            let cfg = AppConfig::load(None);
            remove_env(CONFIG_PATH_ENV);

            let cfg = cfg.expect("load config");
            assert_eq!(cfg.host, "0.0.0.0");
            assert_eq!(cfg.stream_buffer, 8);
        });
    }

    #[test]
    fn missing_file_is_an_error() {
        with_env_lock(|| {
            let dir = tempfile::tempdir().expect("tempdir");
            assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
        });
    }

    #[test]
    fn validate_rejects_zero_thresholds() {
        let mut cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.freshness_window_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.calibration_scale_y = Some(0.0);
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.min_confidence = 1.5;
        assert!(cfg.validate().is_err());
    }
}
