//! Declarative configuration: parses and validates the YAML file describing tasks.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("task `{task}`: {reason}")]
    Invalid { task: String, reason: String },
}

/// One of `always`, `never`, `on_failure`, governing whether an instance is relaunched
/// after its process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    Always,
    Never,
    OnFailure,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::OnFailure
    }
}

/// A POSIX signal, deserialized from its conventional name (e.g. `"SIGTERM"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalName(pub Signal);

impl Default for SignalName {
    fn default() -> Self {
        Self(Signal::SIGTERM)
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}

impl std::str::FromStr for SignalName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let signal = match upper.as_str() {
            "SIGHUP" => Signal::SIGHUP,
            "SIGINT" => Signal::SIGINT,
            "SIGQUIT" => Signal::SIGQUIT,
            "SIGILL" => Signal::SIGILL,
            "SIGABRT" => Signal::SIGABRT,
            "SIGFPE" => Signal::SIGFPE,
            "SIGKILL" => Signal::SIGKILL,
            "SIGSEGV" => Signal::SIGSEGV,
            "SIGPIPE" => Signal::SIGPIPE,
            "SIGALRM" => Signal::SIGALRM,
            "SIGTERM" => Signal::SIGTERM,
            "SIGUSR1" => Signal::SIGUSR1,
            "SIGUSR2" => Signal::SIGUSR2,
            "SIGCHLD" => Signal::SIGCHLD,
            "SIGCONT" => Signal::SIGCONT,
            "SIGSTOP" => Signal::SIGSTOP,
            "SIGTSTP" => Signal::SIGTSTP,
            other => return Err(format!("unknown signal name `{other}`")),
        };
        Ok(Self(signal))
    }
}

impl<'de> Deserialize<'de> for SignalName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

impl Serialize for SignalName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

fn default_replicas() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_success_exit_codes() -> Vec<i32> {
    vec![0]
}

fn default_start_timeout() -> u64 {
    3
}

fn default_start_attempts() -> u32 {
    3
}

fn default_shutdown_timeout() -> u64 {
    10
}

/// One task's declarative description, as parsed from YAML. Immutable once loaded;
/// a `reload` produces a brand new value which either replaces this one in place
/// (material-change test, see [`TaskDescription::requires_restart`]) or triggers a
/// full instance rebuild.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDescription {
    pub command: String,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    #[serde(default = "default_true")]
    pub start_on_launch: bool,

    #[serde(default)]
    pub restart: RestartPolicy,

    #[serde(default = "default_success_exit_codes")]
    pub success_exit_codes: Vec<i32>,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,

    #[serde(default)]
    pub shutdown_signal: SignalName,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    pub pwd: Option<PathBuf>,

    #[serde(default, deserialize_with = "deserialize_umask")]
    pub umask: Option<u32>,
}

fn deserialize_umask<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => u32::from_str_radix(s.trim(), 8)
            .map(Some)
            .map_err(|e| de::Error::custom(format!("invalid octal umask `{s}`: {e}"))),
    }
}

impl TaskDescription {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Whether replacing `self` with `other` requires tearing down every running
    /// instance, versus applying the new description to the instances already alive.
    pub fn requires_restart(&self, other: &TaskDescription) -> bool {
        self.command != other.command
            || self.stdout != other.stdout
            || self.stderr != other.stderr
            || self.environment != other.environment
            || self.pwd != other.pwd
            || self.umask != other.umask
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.replicas == 0 {
            return Err(ConfigError::Invalid {
                task: name.to_string(),
                reason: "replicas must be > 0".to_string(),
            });
        }
        if self.start_attempts == 0 {
            return Err(ConfigError::Invalid {
                task: name.to_string(),
                reason: "start_attempts must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// The full set of tasks, as loaded from a YAML file on disk.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ConfigurationFile {
    #[serde(default)]
    tasks: HashMap<String, TaskDescription>,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub tasks: HashMap<String, TaskDescription>,
}

impl Configuration {
    /// Loads and validates a configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: ConfigurationFile =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        for (name, desc) in &file.tasks {
            desc.validate(name)?;
        }
        Ok(Self { tasks: file.tasks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_defaults() {
        let yaml = r#"
tasks:
  sleeper:
    command: "sleep 60"
"#;
        let config = Configuration::parse(yaml, Path::new("test.yaml")).unwrap();
        let desc = &config.tasks["sleeper"];
        assert_eq!(desc.replicas, 1);
        assert!(desc.start_on_launch);
        assert_eq!(desc.restart, RestartPolicy::OnFailure);
        assert_eq!(desc.success_exit_codes, vec![0]);
        assert_eq!(desc.start_timeout_secs, 3);
        assert_eq!(desc.start_attempts, 3);
        assert_eq!(desc.shutdown_signal.0, Signal::SIGTERM);
        assert_eq!(desc.shutdown_timeout_secs, 10);
    }

    #[test]
    fn rejects_unknown_keys() {
        let yaml = r#"
tasks:
  sleeper:
    command: "sleep 60"
    bogus_field: true
"#;
        assert!(Configuration::parse(yaml, Path::new("test.yaml")).is_err());
    }

    #[test]
    fn rejects_zero_replicas() {
        let yaml = r#"
tasks:
  sleeper:
    command: "sleep 60"
    replicas: 0
"#;
        let err = Configuration::parse(yaml, Path::new("test.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn parses_octal_umask() {
        let yaml = r#"
tasks:
  sleeper:
    command: "sleep 60"
    umask: "022"
"#;
        let config = Configuration::parse(yaml, Path::new("test.yaml")).unwrap();
        assert_eq!(config.tasks["sleeper"].umask, Some(0o022));
    }

    #[test]
    fn rejects_bad_umask() {
        let yaml = r#"
tasks:
  sleeper:
    command: "sleep 60"
    umask: "abc"
"#;
        assert!(Configuration::parse(yaml, Path::new("test.yaml")).is_err());
    }

    #[test]
    fn parses_shutdown_signal_name() {
        let yaml = r#"
tasks:
  sleeper:
    command: "sleep 60"
    shutdown_signal: SIGUSR1
"#;
        let config = Configuration::parse(yaml, Path::new("test.yaml")).unwrap();
        assert_eq!(config.tasks["sleeper"].shutdown_signal.0, Signal::SIGUSR1);
    }

    #[test]
    fn material_change_detects_command_diff() {
        let a = TaskDescription {
            command: "sleep 60".into(),
            replicas: 1,
            start_on_launch: true,
            restart: RestartPolicy::OnFailure,
            success_exit_codes: vec![0],
            start_timeout_secs: 3,
            start_attempts: 3,
            shutdown_signal: SignalName::default(),
            shutdown_timeout_secs: 10,
            stdout: None,
            stderr: None,
            environment: BTreeMap::new(),
            pwd: None,
            umask: None,
        };
        let mut b = a.clone();
        b.start_attempts = 5;
        assert!(!a.requires_restart(&b));

        let mut c = a.clone();
        c.command = "sleep 30".into();
        assert!(a.requires_restart(&c));
    }
}
