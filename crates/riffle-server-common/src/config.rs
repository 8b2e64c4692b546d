use anyhow::{anyhow, bail};
use arc_swap::ArcSwapOption;
use figment::providers::{Env, Format, Toml, Yaml};
use figment::Figment;
use regex::Regex;
use riffle_types::{Result as WatermarkResult, WatermarkError};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::OsStr;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

static CONFIG: ArcSwapOption<Config> = ArcSwapOption::const_empty();

/// Loads the configuration once per process. `path` must exist if given;
/// `*.toml` and `*.yaml` files in `dir` are layered underneath it.
pub fn initialize_config(path: Option<&Path>, dir: Option<&Path>) -> anyhow::Result<()> {
    let mut paths = vec![];

    // find config files in directory
    if let Some(dir) = dir {
        match std::fs::read_dir(dir) {
            Ok(rd) => {
                let mut found: Vec<_> = rd
                    .filter_map(|f| Some(f.ok()?.path()))
                    .filter(|p| {
                        matches!(
                            p.extension().and_then(OsStr::to_str),
                            Some("toml") | Some("yaml")
                        )
                    })
                    .collect();
                found.sort();
                paths.extend(found);
            }
            Err(e) => warn!("Invalid configuration directory '{}': {}", dir.display(), e),
        }
    }

    if let Some(path) = path {
        if !path.exists() {
            bail!(
                "Cannot load configuration from {}; file does not exist",
                path.display()
            );
        }
        paths.push(path.to_path_buf());
    }

    let config: Config = load_config(&paths)
        .extract()
        .map_err(|e| anyhow!("Configuration is invalid: {}", e))?;
    config.watermark.validate()?;

    let current = CONFIG.load();
    if current.is_none()
        && CONFIG
            .compare_and_swap(current, Some(Arc::new(config)))
            .is_none()
    {
        return Ok(());
    }

    bail!("Unable to initialize configuration; it's already initialized!")
}

/// The process configuration. Falls back to the built-in defaults (plus
/// environment overrides) if [`initialize_config`] was never called.
pub fn config() -> Arc<Config> {
    let cur = CONFIG.load();
    if cur.is_none() {
        let config: Config = load_config(&[]).extract().unwrap_or_else(|e| {
            warn!("Invalid configuration in environment, using defaults: {}", e);
            default_config()
        });
        CONFIG.compare_and_swap(cur, Some(Arc::new(config)));
    } else {
        drop(cur);
    }

    CONFIG
        .load_full()
        .unwrap_or_else(|| Arc::new(default_config()))
}

fn default_config() -> Config {
    Figment::from(Toml::string(DEFAULT_CONFIG))
        .extract()
        .expect("embedded default.toml is invalid")
}

pub fn load_config(paths: &[PathBuf]) -> Figment {
    // Priority (from highest--overriding--to lowest--overridden) is:
    //   1. RIFFLE__* environment variables
    //   2. The files in <paths>, later ones first
    //   3. riffle.{toml,yaml} in the current directory
    //   4. ../default.toml
    let mut figment = Figment::from(Toml::string(DEFAULT_CONFIG))
        .admerge(Yaml::file("riffle.yaml"))
        .admerge(Toml::file("riffle.toml"));

    for path in paths {
        match path.extension().and_then(OsStr::to_str) {
            Some("yaml") => {
                figment = figment.admerge(Yaml::file(path));
            }
            _ => {
                figment = figment.admerge(Toml::file(path));
            }
        }
    }

    figment.admerge(
        Env::prefixed("RIFFLE__").map(|p| p.as_str().replace("__", ".").replace('_', "-").into()),
    )
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Watermark generation and idleness
    pub watermark: WatermarkConfig,

    /// Logging config
    pub logging: LogConfig,
}

#[derive(Debug, Copy, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    BoundedOutOfOrderness,
    Monotonic,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WatermarkConfig {
    /// How watermarks are derived from observed event times
    pub strategy: StrategyKind,

    /// Bound on out-of-orderness; only used by `bounded-out-of-orderness`
    pub max_out_of_orderness: HumanReadableDuration,

    /// How long a partition may go without events before it stops holding
    /// back the watermark
    pub idle_timeout: HumanReadableDuration,

    /// How often sources check their partitions for idleness
    pub tick_interval: HumanReadableDuration,

    /// Consecutive events an idle partition must deliver before it counts
    /// towards the watermark again
    #[serde(default = "default_reactivation_threshold")]
    pub reactivation_threshold: u32,

    /// Grace period used when tagging late events
    #[serde(default)]
    pub allowed_lateness: HumanReadableDuration,
}

fn default_reactivation_threshold() -> u32 {
    1
}

impl WatermarkConfig {
    pub fn validate(&self) -> WatermarkResult<()> {
        if self.strategy == StrategyKind::BoundedOutOfOrderness
            && self.max_out_of_orderness.is_zero()
        {
            return Err(WatermarkError::config(
                "max-out-of-orderness",
                "delay must be positive",
            ));
        }

        if self.idle_timeout.is_zero() {
            return Err(WatermarkError::config(
                "idle-timeout",
                "idle timeout must be positive",
            ));
        }

        if self.tick_interval.is_zero() {
            return Err(WatermarkError::config(
                "tick-interval",
                "tick interval must be positive",
            ));
        }

        if self.reactivation_threshold == 0 {
            return Err(WatermarkError::config(
                "reactivation-threshold",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LogConfig {
    /// Set the log format
    #[serde(default)]
    pub format: LogFormat,

    /// Nonblocking logging may reduce tail latency at the cost of higher memory usage
    #[serde(default)]
    pub nonblocking: bool,

    /// Lines buffered before dropping logs; only used when nonblocking
    pub buffered_lines_limit: usize,

    #[serde(default)]
    pub enable_file_line: bool,

    #[serde(default)]
    pub enable_file_name: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
    Logfmt,
}

#[derive(Clone)]
pub struct HumanReadableDuration {
    duration: Duration,
    original: String,
}

impl Default for HumanReadableDuration {
    fn default() -> Self {
        Duration::ZERO.into()
    }
}

impl From<Duration> for HumanReadableDuration {
    fn from(value: Duration) -> Self {
        Self {
            duration: value,
            original: format!("{}ns", value.as_nanos()),
        }
    }
}

impl Deref for HumanReadableDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.duration
    }
}

impl Debug for HumanReadableDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.original.fmt(f)
    }
}

impl Serialize for HumanReadableDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\s*([a-zA-Zµ]+)$").expect("valid duration regex"))
}

impl<'de> Deserialize<'de> for HumanReadableDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(deserializer)?;

        let captures = duration_regex()
            .captures(str.trim())
            .ok_or_else(|| de::Error::custom(format!("invalid duration '{str}'")))?;

        let n: u64 = captures[1]
            .parse()
            .map_err(|e| de::Error::custom(format!("invalid duration '{str}': {e}")))?;

        let duration = match &captures[2] {
            "ns" | "nanos" => Duration::from_nanos(n),
            "µs" | "micros" => Duration::from_micros(n),
            "ms" | "millis" => Duration::from_millis(n),
            "s" | "secs" | "seconds" => Duration::from_secs(n),
            "m" | "mins" | "minutes" => Duration::from_secs(
                n.checked_mul(60)
                    .ok_or_else(|| de::Error::custom(format!("duration '{str}' is too large")))?,
            ),
            "h" | "hrs" | "hours" => Duration::from_secs(
                n.checked_mul(60 * 60)
                    .ok_or_else(|| de::Error::custom(format!("duration '{str}' is too large")))?,
            ),
            x => return Err(de::Error::custom(format!("unknown time unit '{x}'"))),
        };

        Ok(HumanReadableDuration {
            duration,
            original: str,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        figment::Jail::expect_with(|jail| {
            // test default loading
            let config: Config = load_config(&[]).extract().unwrap();
            assert_eq!(config.watermark.strategy, StrategyKind::BoundedOutOfOrderness);
            assert_eq!(*config.watermark.idle_timeout, Duration::from_secs(60));
            assert_eq!(config.watermark.reactivation_threshold, 1);
            assert_eq!(*config.watermark.allowed_lateness, Duration::ZERO);
            config.watermark.validate().unwrap();

            // override by config file
            jail.create_file(
                "riffle.toml",
                r#"
            [watermark]
            strategy = "monotonic"
            idle-timeout = "5 mins"
            "#,
            )?;

            let config: Config = load_config(&[]).extract().unwrap();
            assert_eq!(config.watermark.strategy, StrategyKind::Monotonic);
            assert_eq!(*config.watermark.idle_timeout, Duration::from_secs(300));

            // environment wins over files
            jail.set_env("RIFFLE__WATERMARK__IDLE_TIMEOUT", "90s");
            jail.set_env("RIFFLE__WATERMARK__REACTIVATION_THRESHOLD", 3);
            let config: Config = load_config(&[]).extract().unwrap();
            assert_eq!(*config.watermark.idle_timeout, Duration::from_secs(90));
            assert_eq!(config.watermark.reactivation_threshold, 3);

            Ok(())
        });
    }

    #[test]
    fn test_explicit_paths() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "a.toml",
                r#"
            [watermark]
            max-out-of-orderness = "250ms"
            "#,
            )?;
            jail.create_file(
                "b.yaml",
                "watermark:\n  max-out-of-orderness: 2s\n",
            )?;

            let config: Config = load_config(&["a.toml".into()]).extract().unwrap();
            assert_eq!(
                *config.watermark.max_out_of_orderness,
                Duration::from_millis(250)
            );

            let config: Config = load_config(&["a.toml".into(), "b.yaml".into()])
                .extract()
                .unwrap();
            assert_eq!(
                *config.watermark.max_out_of_orderness,
                Duration::from_secs(2)
            );

            Ok(())
        });
    }

    #[test]
    fn test_validation() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("RIFFLE__WATERMARK__IDLE_TIMEOUT", "0s");
            let config: Config = load_config(&[]).extract().unwrap();
            assert!(matches!(
                config.watermark.validate(),
                Err(WatermarkError::Configuration {
                    field: "idle-timeout",
                    ..
                })
            ));

            // zero delay is fine for monotonic streams
            jail.set_env("RIFFLE__WATERMARK__IDLE_TIMEOUT", "1s");
            jail.set_env("RIFFLE__WATERMARK__MAX_OUT_OF_ORDERNESS", "0ms");
            jail.set_env("RIFFLE__WATERMARK__STRATEGY", "monotonic");
            let config: Config = load_config(&[]).extract().unwrap();
            config.watermark.validate().unwrap();

            jail.set_env("RIFFLE__WATERMARK__STRATEGY", "bounded-out-of-orderness");
            let config: Config = load_config(&[]).extract().unwrap();
            assert!(config.watermark.validate().is_err());

            Ok(())
        });
    }

    // the only test that touches the process-wide config
    #[test]
    fn test_initialize_config() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "worker.toml",
                r#"
            [watermark]
            idle-timeout = "2 mins"
            "#,
            )?;
            jail.create_file("bad.toml", "[watermark]\nidle-timeout = \"0s\"\n")?;

            let missing = initialize_config(Some(Path::new("missing.toml")), None);
            assert!(missing.unwrap_err().to_string().contains("does not exist"));

            let invalid = initialize_config(Some(Path::new("bad.toml")), None);
            assert!(invalid.is_err());

            initialize_config(Some(Path::new("worker.toml")), None).unwrap();
            assert_eq!(*config().watermark.idle_timeout, Duration::from_secs(120));

            let again = initialize_config(Some(Path::new("worker.toml")), None);
            assert!(again.unwrap_err().to_string().contains("already initialized"));

            // default format is plaintext and blocking, so there is no guard
            assert!(crate::init_logging("config-test").is_none());

            Ok(())
        });
    }

    #[test]
    fn test_human_readable_duration() {
        let parse = |s: &str| -> Result<Duration, String> {
            serde_json::from_value::<HumanReadableDuration>(serde_json::Value::String(s.into()))
                .map(|d| *d)
                .map_err(|e| e.to_string())
        };

        assert_eq!(parse("60 secs"), Ok(Duration::from_secs(60)));
        assert_eq!(parse("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse("2h"), Ok(Duration::from_secs(7200)));
        assert!(parse("2 fortnights").is_err());
        assert!(parse("soon").is_err());
        assert!(parse(&format!("{} hours", u64::MAX / 60))
            .unwrap_err()
            .contains("too large"));
        assert!(parse(&format!("{} mins", u64::MAX)).is_err());

        let d: HumanReadableDuration =
            serde_json::from_value(serde_json::Value::String("10s".into())).unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"10s\"");
    }
}
