use crate::error::Result;
use crate::invocation::IntentKind;
use crate::paths;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capacity of the recent-invocation ring buffer.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// A gap longer than this between invocations starts a new session.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u32,
}

fn default_history_capacity() -> usize {
    50
}

fn default_idle_timeout() -> u32 {
    240
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            idle_timeout_minutes: default_idle_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetentionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Completed features are archived this many days after completion.
    #[serde(default = "default_archive_after")]
    pub archive_after_days: u32,
}

fn default_archive_after() -> u32 {
    14
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            archive_after_days: default_archive_after(),
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Budget for a single advisory policy. Exceeding it degrades to `warn`.
    #[serde(default = "default_policy_timeout")]
    pub timeout_ms: u64,
}

fn default_policy_timeout() -> u64 {
    50
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_policy_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// PersistenceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// SuggestionConfig
// ---------------------------------------------------------------------------

/// Local-hour window, `start` inclusive and `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn contains(&self, hour: u32) -> bool {
        hour >= self.start && hour < self.end
    }

    fn is_valid(&self) -> bool {
        self.start < self.end && self.end <= 24
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionConfig {
    #[serde(default = "default_learning_weight")]
    pub learning_weight: f64,
    #[serde(default = "default_top_k")]
    pub learned_top_k: usize,
    #[serde(default = "default_tod_bonus")]
    pub time_of_day_bonus: f64,
    #[serde(default = "default_morning")]
    pub morning: HourWindow,
    #[serde(default = "default_evening")]
    pub evening: HourWindow,
    /// Distinct learned pairs allowed before all counts are halved.
    #[serde(default = "default_decay_threshold")]
    pub decay_threshold: usize,
}

fn default_learning_weight() -> f64 {
    0.3
}

fn default_top_k() -> usize {
    5
}

fn default_tod_bonus() -> f64 {
    0.25
}

fn default_morning() -> HourWindow {
    HourWindow { start: 6, end: 11 }
}

fn default_evening() -> HourWindow {
    HourWindow { start: 17, end: 22 }
}

fn default_decay_threshold() -> usize {
    256
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            learning_weight: default_learning_weight(),
            learned_top_k: default_top_k(),
            time_of_day_bonus: default_tod_bonus(),
            morning: default_morning(),
            evening: default_evening(),
            decay_threshold: default_decay_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTag {
    Resume,
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub command: String,
    #[serde(default = "default_edge_weight")]
    pub weight: f64,
}

fn default_edge_weight() -> f64 {
    1.0
}

fn edge(command: &str, weight: f64) -> Edge {
    Edge {
        command: command.to_string(),
        weight,
    }
}

/// The static workflow graph: canonical next steps per command, in
/// declaration order, plus tags used by the time-of-day heuristic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_graph")]
    pub graph: BTreeMap<String, Vec<Edge>>,
    #[serde(default = "default_tags")]
    pub tags: BTreeMap<String, Vec<CommandTag>>,
}

fn default_graph() -> BTreeMap<String, Vec<Edge>> {
    let mut g = BTreeMap::new();
    g.insert(
        "start_feature".to_string(),
        vec![edge("generate_tasks", 1.0), edge("checkpoint", 0.3)],
    );
    g.insert(
        "generate_tasks".to_string(),
        vec![edge("update_task", 1.0), edge("checkpoint", 0.3)],
    );
    g.insert(
        "update_task".to_string(),
        vec![
            edge("run_tests", 0.9),
            edge("update_task", 0.8),
            edge("checkpoint", 0.3),
        ],
    );
    g.insert(
        "run_tests".to_string(),
        vec![edge("update_task", 0.9), edge("complete_feature", 0.7)],
    );
    g.insert(
        "record_test".to_string(),
        vec![edge("update_task", 0.9), edge("complete_feature", 0.7)],
    );
    g.insert(
        "complete_feature".to_string(),
        vec![edge("start_feature", 0.8), edge("checkpoint", 0.5)],
    );
    g.insert(
        "block_feature".to_string(),
        vec![edge("unblock_feature", 0.6), edge("start_feature", 0.5)],
    );
    g.insert(
        "unblock_feature".to_string(),
        vec![edge("update_task", 1.0), edge("run_tests", 0.5)],
    );
    g.insert(
        "resume".to_string(),
        vec![edge("update_task", 1.0), edge("run_tests", 0.5)],
    );
    g.insert("checkpoint".to_string(), vec![edge("resume", 0.6)]);
    g
}

fn default_tags() -> BTreeMap<String, Vec<CommandTag>> {
    let mut t = BTreeMap::new();
    t.insert("resume".to_string(), vec![CommandTag::Resume]);
    t.insert("checkpoint".to_string(), vec![CommandTag::Checkpoint]);
    t
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            graph: default_graph(),
            tags: default_tags(),
        }
    }
}

impl WorkflowConfig {
    pub fn successors(&self, command: &str) -> &[Edge] {
        self.graph
            .get(command)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn tags_for(&self, command: &str) -> &[CommandTag] {
        self.tags.get(command).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// GuardConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Path prefixes where recursive deletes are harmless.
    #[serde(default = "default_scratch_paths")]
    pub scratch_paths: Vec<String>,
    /// Regexes matched against written paths; a match is a credential write.
    #[serde(default = "default_credential_patterns")]
    pub credential_patterns: Vec<String>,
    /// Extra regexes matched against shell commands, always blocked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_patterns: Vec<String>,
    /// Shell commands matching any of these are recorded as test runs.
    #[serde(default = "default_test_patterns")]
    pub test_patterns: Vec<String>,
    #[serde(skip)]
    compiled: OnceLock<CompiledPatterns>,
}

#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    pub credential: Vec<Regex>,
    pub deny: Vec<Regex>,
    pub test: Vec<Regex>,
}

fn default_scratch_paths() -> Vec<String> {
    [
        "/tmp/", "tmp/", "target/", "node_modules/", "dist/", "build/", ".cache/", "coverage/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_credential_patterns() -> Vec<String> {
    [
        r"(^|/)\.env(\.(local|development|production|staging|test))?$",
        r"\.pem$",
        r"\.key$",
        r"(^|/)id_(rsa|dsa|ecdsa|ed25519)$",
        r"(^|/)\.aws/credentials$",
        r"(^|/)\.netrc$",
        r"(^|/)credentials\.json$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_test_patterns() -> Vec<String> {
    [
        r"\bcargo\s+(test|nextest\s+run)\b",
        r"\b(npm|pnpm|yarn)\s+(run\s+)?test\b",
        r"\bpytest\b",
        r"\bgo\s+test\b",
        r"\b(jest|vitest)\b",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            scratch_paths: default_scratch_paths(),
            credential_patterns: default_credential_patterns(),
            deny_patterns: Vec::new(),
            test_patterns: default_test_patterns(),
            compiled: OnceLock::new(),
        }
    }
}

impl GuardConfig {
    /// Compiled regexes, built once. Patterns that fail to compile are
    /// skipped here and reported by [`Settings::sanitize`].
    pub fn compiled(&self) -> &CompiledPatterns {
        self.compiled.get_or_init(|| CompiledPatterns {
            credential: compile_all(&self.credential_patterns),
            deny: compile_all(&self.deny_patterns),
            test: compile_all(&self.test_patterns),
        })
    }

    pub fn is_scratch(&self, path: &str) -> bool {
        let Some(p) = paths::lexical_clean(path.trim_matches(|c| c == '"' || c == '\'')) else {
            return false;
        };
        self.scratch_paths.iter().any(|prefix| {
            let bare = prefix.trim_end_matches('/');
            !bare.is_empty() && (p == bare || p.starts_with(prefix.as_str()))
        })
    }

    pub fn is_credential_path(&self, path: &str) -> bool {
        self.compiled().credential.iter().any(|re| re.is_match(path))
    }

    pub fn is_test_command(&self, command: &str) -> bool {
        self.compiled().test.iter().any(|re| re.is_match(command))
    }
}

/// Whether `{key: val}` alone deserializes as [`Settings`].
fn fits(key: &Value, val: &Value) -> std::result::Result<(), serde_yaml::Error> {
    let mut probe = serde_yaml::Mapping::new();
    probe.insert(key.clone(), val.clone());
    serde_yaml::from_value::<Settings>(Value::Mapping(probe)).map(|_| ())
}

fn compile_all(patterns: &[String]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

// ---------------------------------------------------------------------------
// Settings (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_true", alias = "strictMode")]
    pub strict_mode: bool,
    #[serde(default = "default_max_active", alias = "maxActiveBranches")]
    pub max_active_branches: u32,
    #[serde(default = "default_suggestion_count", alias = "suggestionCount")]
    pub suggestion_count: usize,
    #[serde(default = "default_true", alias = "learningEnabled")]
    pub learning_enabled: bool,
    #[serde(default = "default_true", alias = "overrideRequiresFlag")]
    pub override_requires_flag: bool,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub suggestions: SuggestionConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Command id → intent overrides, merged over the built-in table.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, IntentKind>,
    #[serde(default)]
    pub guard: GuardConfig,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_active() -> u32 {
    3
}

fn default_suggestion_count() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            strict_mode: true,
            max_active_branches: default_max_active(),
            suggestion_count: default_suggestion_count(),
            learning_enabled: true,
            override_requires_flag: true,
            session: SessionConfig::default(),
            retention: RetentionConfig::default(),
            policy: PolicyConfig::default(),
            persistence: PersistenceConfig::default(),
            suggestions: SuggestionConfig::default(),
            workflow: WorkflowConfig::default(),
            commands: BTreeMap::new(),
            guard: GuardConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings for `root`, never failing. Problems are logged once and
    /// the affected values fall back to their defaults.
    pub fn load(root: &Path) -> Self {
        let (settings, warnings) = Self::load_with_warnings(root);
        for w in &warnings {
            tracing::warn!(level = ?w.level, "config: {}", w.message);
        }
        settings
    }

    /// Load the user-level file (if any) with the project file merged over
    /// it, returning every problem found along the way.
    pub fn load_with_warnings(root: &Path) -> (Self, Vec<ConfigWarning>) {
        let mut warnings = Vec::new();
        let mut merged = Value::Mapping(Default::default());

        let sources = [paths::user_config_path(), Some(paths::config_path(root))];
        for path in sources.into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(crate::error::GuardError::from)
                .and_then(|s| serde_yaml::from_str::<Value>(&s).map_err(Into::into))
            {
                Ok(Value::Null) => {}
                Ok(value) => deep_merge(&mut merged, value),
                Err(e) => warnings.push(ConfigWarning::error(format!(
                    "could not read {}: {e}; using defaults for its values",
                    path.display()
                ))),
            }
        }

        let (mut settings, mut field_warnings) = Self::from_value(merged);
        warnings.append(&mut field_warnings);
        warnings.extend(settings.sanitize());
        (settings, warnings)
    }

    /// Deserialize, dropping any value that does not fit its type so the rest
    /// of the document still applies. Sections are checked key by key, so one
    /// bad nested value only resets that value.
    pub fn from_value(value: Value) -> (Self, Vec<ConfigWarning>) {
        if let Ok(settings) = serde_yaml::from_value::<Settings>(value.clone()) {
            return (settings, Vec::new());
        }

        let mut warnings = Vec::new();
        let Value::Mapping(map) = value else {
            warnings.push(ConfigWarning::error(
                "config must be a mapping; using defaults",
            ));
            return (Settings::default(), warnings);
        };

        let mut kept = serde_yaml::Mapping::new();
        for (key, val) in map {
            let name = key.as_str().unwrap_or("<non-string key>").to_string();
            let Err(e) = fits(&key, &val) else {
                kept.insert(key, val);
                continue;
            };
            let Value::Mapping(section) = val else {
                warnings.push(ConfigWarning::error(format!(
                    "invalid value for '{name}' ({e}); using default"
                )));
                continue;
            };
            let mut valid = serde_yaml::Mapping::new();
            for (sub, sub_val) in section {
                let mut one = serde_yaml::Mapping::new();
                one.insert(sub.clone(), sub_val.clone());
                match fits(&key, &Value::Mapping(one)) {
                    Ok(()) => {
                        valid.insert(sub, sub_val);
                    }
                    Err(e) => {
                        let sub_name = sub.as_str().unwrap_or("<non-string key>");
                        warnings.push(ConfigWarning::error(format!(
                            "invalid value for '{name}.{sub_name}' ({e}); using default"
                        )));
                    }
                }
            }
            kept.insert(key, Value::Mapping(valid));
        }
        let settings = serde_yaml::from_value(Value::Mapping(kept)).unwrap_or_default();
        (settings, warnings)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Replace out-of-range values with their defaults, reporting each one.
    pub fn sanitize(&mut self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.max_active_branches == 0 {
            warnings.push(ConfigWarning::warning(format!(
                "max_active_branches must be at least 1; using {}",
                default_max_active()
            )));
            self.max_active_branches = default_max_active();
        }
        if self.suggestion_count == 0 {
            warnings.push(ConfigWarning::warning(format!(
                "suggestion_count must be at least 1; using {}",
                default_suggestion_count()
            )));
            self.suggestion_count = default_suggestion_count();
        }
        if self.session.history_capacity == 0 {
            warnings.push(ConfigWarning::warning(format!(
                "session.history_capacity must be at least 1; using {}",
                default_history_capacity()
            )));
            self.session.history_capacity = default_history_capacity();
        }
        if self.policy.timeout_ms == 0 {
            warnings.push(ConfigWarning::warning(format!(
                "policy.timeout_ms must be positive; using {}",
                default_policy_timeout()
            )));
            self.policy.timeout_ms = default_policy_timeout();
        }

        let p = &mut self.persistence;
        if p.max_attempts == 0 || p.base_delay_ms == 0 || p.max_delay_ms < p.base_delay_ms {
            warnings.push(ConfigWarning::warning(
                "persistence retry settings are inconsistent; using defaults",
            ));
            *p = PersistenceConfig::default();
        }

        let s = &mut self.suggestions;
        if !s.learning_weight.is_finite() || s.learning_weight < 0.0 {
            warnings.push(ConfigWarning::warning(format!(
                "suggestions.learning_weight must be a non-negative number; using {}",
                default_learning_weight()
            )));
            s.learning_weight = default_learning_weight();
        }
        if !s.time_of_day_bonus.is_finite() || s.time_of_day_bonus < 0.0 {
            warnings.push(ConfigWarning::warning(format!(
                "suggestions.time_of_day_bonus must be a non-negative number; using {}",
                default_tod_bonus()
            )));
            s.time_of_day_bonus = default_tod_bonus();
        }
        if s.learned_top_k == 0 {
            warnings.push(ConfigWarning::warning(format!(
                "suggestions.learned_top_k must be at least 1; using {}",
                default_top_k()
            )));
            s.learned_top_k = default_top_k();
        }
        if s.decay_threshold == 0 {
            warnings.push(ConfigWarning::warning(format!(
                "suggestions.decay_threshold must be at least 1; using {}",
                default_decay_threshold()
            )));
            s.decay_threshold = default_decay_threshold();
        }
        if !s.morning.is_valid() {
            warnings.push(ConfigWarning::warning(
                "suggestions.morning must satisfy start < end <= 24; using 6-11",
            ));
            s.morning = default_morning();
        }
        if !s.evening.is_valid() {
            warnings.push(ConfigWarning::warning(
                "suggestions.evening must satisfy start < end <= 24; using 17-22",
            ));
            s.evening = default_evening();
        }

        for (from, edges) in self.workflow.graph.iter_mut() {
            for e in edges.iter_mut() {
                if !e.weight.is_finite() || e.weight < 0.0 {
                    warnings.push(ConfigWarning::warning(format!(
                        "workflow edge {from} -> {} has invalid weight; using 1.0",
                        e.command
                    )));
                    e.weight = default_edge_weight();
                }
            }
        }

        let g = &mut self.guard;
        for (section, patterns) in [
            ("credential_patterns", &mut g.credential_patterns),
            ("deny_patterns", &mut g.deny_patterns),
            ("test_patterns", &mut g.test_patterns),
        ] {
            patterns.retain(|p| match Regex::new(p) {
                Ok(_) => true,
                Err(e) => {
                    warnings.push(ConfigWarning::warning(format!(
                        "guard.{section}: dropping invalid pattern '{p}': {e}"
                    )));
                    false
                }
            });
        }
        g.compiled = OnceLock::new();

        warnings
    }
}

/// Recursively merge `overlay` into `base`; mappings merge key by key, any
/// other value in `overlay` replaces the one in `base`.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
