//! Startup configuration: resolution, validation, and compiled-in defaults.
//!
//! Resolution order (lowest to highest precedence): compiled-in defaults,
//! an optional TOML file, then `AXIOM_*` environment variables. Validation
//! failures are surfaced once, synchronously, at process start — nothing
//! downstream ever has to handle a malformed `Config`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::ConfigError;
use crate::core::pattern_scanner::RuleAction;

/// Template for launching the supervised child.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildConfig {
    /// Path to the interactive CLI to supervise. Default: `claude`.
    #[serde(default = "default_child_command")]
    pub command: String,
    /// Argv template. The prompt is appended as a final positional argument.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_child_command() -> String {
    "claude".to_string()
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            command: default_child_command(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }
}

/// One row of the process-wide rule table.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    /// Regular expression applied to assembled lines. Ignored for the
    /// timer-driven `stall` action, which carries no line pattern.
    #[serde(default)]
    pub r#match: Option<String>,
    pub action: RuleActionConfig,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub cooldown_ms: u64,
}

/// TOML-facing mirror of [`RuleAction`]; kept separate so the wire format
/// (tagged by an `action` discriminant plus an adjacent `payload`) doesn't
/// leak into the in-memory type used by the scanner and controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleActionConfig {
    Inject { payload: String },
    Interrupt,
    RecordOnly,
    /// Timer-driven: fires when a task has produced no output for
    /// `stall_threshold_ms`, bypassing the line scanner entirely.
    Stall,
}

impl RuleActionConfig {
    fn into_action(self) -> RuleAction {
        match self {
            RuleActionConfig::Inject { payload } => RuleAction::Inject(payload),
            RuleActionConfig::Interrupt => RuleAction::Interrupt,
            RuleActionConfig::RecordOnly => RuleAction::RecordOnly,
            RuleActionConfig::Stall => RuleAction::Stall,
        }
    }
}

/// Fully-resolved, validated, immutable-for-process-lifetime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub child: ChildConfig,
    pub ring_buffer_bytes: usize,
    pub max_line_bytes: usize,
    pub max_interventions_per_task: u32,
    pub min_delivery_spacing: Duration,
    pub backpressure_timeout: Duration,
    pub shutdown_grace: Duration,
    pub stall_threshold: Duration,
    pub rules: Vec<crate::core::pattern_scanner::Rule>,
    pub log_level: String,
}

/// Raw TOML document shape, deserialized before resolution into [`Config`].
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    child: ChildConfig,
    ring_buffer_bytes: Option<usize>,
    max_line_bytes: Option<usize>,
    max_interventions_per_task: Option<u32>,
    min_delivery_spacing_ms: Option<u64>,
    backpressure_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    stall_threshold_ms: Option<u64>,
    log_level: Option<String>,
    #[serde(default)]
    rules: Vec<RuleConfig>,
}

const DEFAULT_RING_BUFFER_BYTES: usize = 65_536;
const DEFAULT_MAX_LINE_BYTES: usize = 8_192;
const DEFAULT_MAX_INTERVENTIONS_PER_TASK: u32 = 20;
const DEFAULT_MIN_DELIVERY_SPACING_MS: u64 = 250;
const DEFAULT_BACKPRESSURE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
const DEFAULT_STALL_THRESHOLD_MS: u64 = 10_000;

/// The three rules always loaded when no config file supplies its own.
fn bundled_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            id: "planning-drift".to_string(),
            r#match: Some(r"I('ll| will) (analyze|think|consider)".to_string()),
            action: RuleActionConfig::Inject {
                payload: "Stop planning. Create the file now.".to_string(),
            },
            priority: 10,
            cooldown_ms: 5_000,
        },
        RuleConfig {
            id: "todo-marker".to_string(),
            r#match: Some(r"\bTODO\b|\bFIXME\b".to_string()),
            action: RuleActionConfig::Inject {
                payload: "No TODOs. Implement now.".to_string(),
            },
            priority: 5,
            cooldown_ms: 1_000,
        },
        RuleConfig {
            id: "stall-check".to_string(),
            r#match: None,
            action: RuleActionConfig::Stall,
            priority: 0,
            cooldown_ms: DEFAULT_STALL_THRESHOLD_MS,
        },
    ]
}

impl Config {
    /// Loads configuration from an optional TOML file, then overlays
    /// `AXIOM_*` environment variables, then validates the result.
    ///
    /// `config_path` is `None` when the caller passed no `--config` flag
    /// and `axiom.toml` does not exist in the working directory.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => RawConfig::default(),
        };

        Self::from_raw(raw)
    }

    fn from_raw(mut raw: RawConfig) -> Result<Self, ConfigError> {
        if let Ok(command) = std::env::var("AXIOM_CHILD_COMMAND") {
            raw.child.command = command;
        }
        if let Ok(v) = std::env::var("AXIOM_RING_BUFFER_BYTES") {
            raw.ring_buffer_bytes = v.parse().ok();
        }
        if let Ok(v) = std::env::var("AXIOM_MAX_LINE_BYTES") {
            raw.max_line_bytes = v.parse().ok();
        }
        if let Ok(v) = std::env::var("AXIOM_LOG_LEVEL") {
            raw.log_level = Some(v);
        }

        if raw.rules.is_empty() {
            raw.rules = bundled_rules();
        }

        if raw.child.command.trim().is_empty() {
            return Err(ConfigError::EmptyChildCommand);
        }

        let ring_buffer_bytes = raw.ring_buffer_bytes.unwrap_or(DEFAULT_RING_BUFFER_BYTES);
        if ring_buffer_bytes == 0 {
            return Err(ConfigError::ZeroField {
                field: "ring_buffer_bytes",
            });
        }
        let max_line_bytes = raw.max_line_bytes.unwrap_or(DEFAULT_MAX_LINE_BYTES);
        if max_line_bytes == 0 {
            return Err(ConfigError::ZeroField {
                field: "max_line_bytes",
            });
        }

        let mut seen_ids = std::collections::HashSet::new();
        let mut rules = Vec::with_capacity(raw.rules.len());
        for rule in raw.rules {
            if !seen_ids.insert(rule.id.clone()) {
                return Err(ConfigError::DuplicateRuleId(rule.id));
            }
            let pattern = match &rule.r#match {
                Some(pattern) => Some(regex::Regex::new(pattern).map_err(|source| {
                    ConfigError::InvalidRule {
                        id: rule.id.clone(),
                        source,
                    }
                })?),
                None => None,
            };
            rules.push(crate::core::pattern_scanner::Rule {
                id: rule.id,
                pattern,
                action: rule.action.into_action(),
                priority: rule.priority,
                cooldown: Duration::from_millis(rule.cooldown_ms),
            });
        }
        // Highest priority first, so the scanner's "first match wins" walk
        // is a simple linear scan.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(Self {
            child: raw.child,
            ring_buffer_bytes,
            max_line_bytes,
            max_interventions_per_task: raw
                .max_interventions_per_task
                .unwrap_or(DEFAULT_MAX_INTERVENTIONS_PER_TASK),
            min_delivery_spacing: Duration::from_millis(
                raw.min_delivery_spacing_ms
                    .unwrap_or(DEFAULT_MIN_DELIVERY_SPACING_MS),
            ),
            backpressure_timeout: Duration::from_millis(
                raw.backpressure_timeout_ms
                    .unwrap_or(DEFAULT_BACKPRESSURE_TIMEOUT_MS),
            ),
            shutdown_grace: Duration::from_millis(
                raw.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
            stall_threshold: Duration::from_millis(
                raw.stall_threshold_ms.unwrap_or(DEFAULT_STALL_THRESHOLD_MS),
            ),
            rules,
            log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

impl Default for Config {
    /// Compiled-in defaults, used when no config file is present. Must
    /// itself pass validation — pinned by a test in this module.
    fn default() -> Self {
        Self::from_raw(RawConfig::default()).expect("compiled-in defaults must validate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert_eq!(config.ring_buffer_bytes, DEFAULT_RING_BUFFER_BYTES);
        assert_eq!(config.rules.len(), 3);
    }

    #[test]
    fn bundled_rules_present_by_id() {
        let config = Config::default();
        let ids: Vec<&str> = config.rules.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"planning-drift"));
        assert!(ids.contains(&"todo-marker"));
        assert!(ids.contains(&"stall-check"));
    }

    #[test]
    fn empty_child_command_rejected() {
        let mut raw = RawConfig::default();
        raw.child.command = "   ".to_string();
        let err = Config::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyChildCommand));
    }

    #[test]
    fn duplicate_rule_ids_rejected() {
        let mut raw = RawConfig::default();
        raw.rules = vec![
            RuleConfig {
                id: "dup".to_string(),
                r#match: Some("a".to_string()),
                action: RuleActionConfig::RecordOnly,
                priority: 0,
                cooldown_ms: 0,
            },
            RuleConfig {
                id: "dup".to_string(),
                r#match: Some("b".to_string()),
                action: RuleActionConfig::RecordOnly,
                priority: 0,
                cooldown_ms: 0,
            },
        ];
        let err = Config::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRuleId(id) if id == "dup"));
    }

    #[test]
    fn invalid_regex_rejected() {
        let mut raw = RawConfig::default();
        raw.rules = vec![RuleConfig {
            id: "bad".to_string(),
            r#match: Some("(unclosed".to_string()),
            action: RuleActionConfig::RecordOnly,
            priority: 0,
            cooldown_ms: 0,
        }];
        let err = Config::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule { id, .. } if id == "bad"));
    }

    #[test]
    fn load_reads_and_overlays_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axiom.toml");
        std::fs::write(
            &path,
            r#"
            log_level = "debug"

            [child]
            command = "/bin/echo"
            "#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.child.command, "/bin/echo");
        assert_eq!(config.rules.len(), 3, "omitted rules fall back to the bundled set");
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.toml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn rules_sorted_by_descending_priority() {
        let mut raw = RawConfig::default();
        raw.rules = vec![
            RuleConfig {
                id: "low".to_string(),
                r#match: Some("x".to_string()),
                action: RuleActionConfig::RecordOnly,
                priority: 1,
                cooldown_ms: 0,
            },
            RuleConfig {
                id: "high".to_string(),
                r#match: Some("y".to_string()),
                action: RuleActionConfig::RecordOnly,
                priority: 9,
                cooldown_ms: 0,
            },
        ];
        let config = Config::from_raw(raw).unwrap();
        assert_eq!(config.rules[0].id, "high");
        assert_eq!(config.rules[1].id, "low");
    }
}
