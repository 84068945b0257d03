use std::env;
use std::path::PathBuf;
use std::str::FromStr;

fn parse_env_or<T: FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_opt<T: FromStr>(var: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
                None
            }
        },
        Err(_) => None,
    }
}

/// How recognized text is scored against ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareMode {
    #[default]
    Off,
    /// Exact line text.
    Strict,
    /// Lowercased, with `. , : ;` stripped before scoring.
    Relaxed,
}

impl FromStr for CompareMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Ok(CompareMode::Off),
            "strict" | "on" => Ok(CompareMode::Strict),
            "relaxed" => Ok(CompareMode::Relaxed),
            other => Err(format!(
                "unknown comparison mode '{other}' (expected off, strict or relaxed)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Services to run, in order; empty means all known services.
    pub services: Vec<String>,
    /// Worker tasks per item; 1 runs adapters serially in declared order.
    pub workers: usize,
    pub output_dir: Option<PathBuf>,
    pub compare: CompareMode,
    /// Keep derived temp files, annotated images, raw dumps and text files.
    pub extended: bool,
    /// Upper bound on attempts when an adapter reports a rate limit.
    pub max_attempts: u32,
    /// Interval between polls for backends that deliver results after a delay.
    pub poll_interval_secs: u64,
    pub http_timeout_secs: u64,
    /// Font used for annotation text; boxes are drawn without labels if unset.
    pub font_path: Option<PathBuf>,
    /// Directory holding per-service credential JSON files.
    pub credentials_dir: Option<PathBuf>,
    /// Base name for files downloaded from URL targets.
    pub base_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            services: env::var("HTRBENCH_SERVICES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            workers: parse_env_or("HTRBENCH_THREADS", default_workers()),
            output_dir: parse_env_opt::<PathBuf>("HTRBENCH_OUTPUT_DIR"),
            compare: CompareMode::Off,
            extended: false,
            max_attempts: parse_env_or("HTRBENCH_MAX_ATTEMPTS", 5),
            poll_interval_secs: parse_env_or("HTRBENCH_POLL_INTERVAL", 2),
            http_timeout_secs: parse_env_or("HTRBENCH_HTTP_TIMEOUT", 60),
            font_path: parse_env_opt::<PathBuf>("HTRBENCH_FONT"),
            credentials_dir: parse_env_opt::<PathBuf>("HTRBENCH_CREDENTIALS_DIR"),
            base_name: env::var("HTRBENCH_BASE_NAME").unwrap_or_else(|_| "document".to_string()),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Image formats accepted as batch targets.
pub const ACCEPTED_FORMATS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"];

/// The canonical exchange format every selected backend accepts.
pub const OUTPUT_FORMAT: &str = "png";

/// Infix marking files this tool derived from an original, so later runs can
/// reuse them and target gathering can skip them.
pub const DERIVED_INFIX: &str = ".htrbench";

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_compare_mode_parsing() {
        assert_eq!("off".parse::<CompareMode>().unwrap(), CompareMode::Off);
        assert_eq!(
            "strict".parse::<CompareMode>().unwrap(),
            CompareMode::Strict
        );
        assert_eq!(
            "RELAXED".parse::<CompareMode>().unwrap(),
            CompareMode::Relaxed
        );
        assert!("fuzzy".parse::<CompareMode>().is_err());
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        env::remove_var("HTRBENCH_MAX_ATTEMPTS");
        env::remove_var("HTRBENCH_POLL_INTERVAL");
        let config = Config::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.compare, CompareMode::Off);
        assert!(!config.extended);
        assert!(config.workers >= 1);
    }

    #[test]
    #[serial]
    fn test_service_list_from_env() {
        env::set_var("HTRBENCH_SERVICES", "google, mistral");
        let config = Config::from_env();
        assert_eq!(config.services, vec!["google", "mistral"]);
        env::remove_var("HTRBENCH_SERVICES");

        let config = Config::from_env();
        assert!(config.services.is_empty());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        env::set_var("HTRBENCH_MAX_ATTEMPTS", "3");
        env::set_var("HTRBENCH_HTTP_TIMEOUT", "10");
        let config = Config::from_env();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.http_timeout_secs, 10);
        env::remove_var("HTRBENCH_MAX_ATTEMPTS");
        env::remove_var("HTRBENCH_HTTP_TIMEOUT");
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_falls_back_to_default() {
        env::set_var("HTRBENCH_MAX_ATTEMPTS", "many");
        let config = Config::from_env();
        assert_eq!(config.max_attempts, 5);
        env::remove_var("HTRBENCH_MAX_ATTEMPTS");
    }
}
