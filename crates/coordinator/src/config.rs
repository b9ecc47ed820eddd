//! Configuration for the orchestrator and its collaborators.
//!
//! # File safety
//!
//! - Config file permission validation on Unix systems
//! - Rejects world-readable files containing API keys
//! - Warns about API keys stored in config files

use healmate_common::RetryPolicy;
use healmate_llm::LlmConfig;
use healmate_memory::{EmbeddingConfig, KnowledgeConfig, MemoryConfig, RetrievalConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main configuration, one TOML section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// `window_size` here is ignored; `[orchestrator].window_size` wins.
    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Rolling window size (N).
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Raw turns included in each prompt.
    #[serde(default = "default_prompt_turns")]
    pub prompt_turns: usize,

    /// Maximum actions per routing decision (M).
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,

    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,

    /// Deadline for a whole turn, including the wait for the session lock.
    #[serde(default = "default_turn_deadline_ms")]
    pub turn_deadline_ms: u64,

    #[serde(default = "default_reply_char_limit")]
    pub reply_char_limit: usize,
}

fn default_window_size() -> usize {
    10
}

fn default_prompt_turns() -> usize {
    5
}

fn default_max_actions() -> usize {
    4
}

fn default_tool_timeout_ms() -> u64 {
    8000
}

fn default_turn_deadline_ms() -> u64 {
    45_000
}

fn default_reply_char_limit() -> usize {
    4900
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            prompt_turns: default_prompt_turns(),
            max_actions: default_max_actions(),
            tool_timeout_ms: default_tool_timeout_ms(),
            turn_deadline_ms: default_turn_deadline_ms(),
            reply_char_limit: default_reply_char_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    Llm,
    Lexicon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_classifier")]
    pub classifier: ClassifierKind,

    /// Retry policy for tool backends (mood store, horoscope, classifier).
    #[serde(default = "RetryPolicy::persistence")]
    pub retry: RetryPolicy,
}

fn default_classifier() -> ClassifierKind {
    ClassifierKind::Llm
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            classifier: default_classifier(),
            retry: RetryPolicy::persistence(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file.
    ///
    /// On Unix systems, this function validates that:
    /// - The file is a regular file (not a symlink)
    /// - The file is not world-writable
    /// - The file is not world-readable if it contains an API key
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        validate_config_file_permissions(path)?;

        let config = Self::from_file_unchecked(path)?;

        if config.llm.api_key.is_some() {
            warn!(
                "API key found in config file '{}'. For better security, \
                 use environment variables instead (OPENAI_API_KEY, DEEPSEEK_API_KEY).",
                path.display()
            );
        }

        Ok(config)
    }

    /// Load configuration from a TOML file without permission checks.
    ///
    /// Use this only for testing or when you've already validated the file.
    pub fn from_file_unchecked(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let o = &self.orchestrator;
        if o.window_size == 0 {
            anyhow::bail!("orchestrator.window_size must be at least 1");
        }
        if o.max_actions == 0 {
            anyhow::bail!("orchestrator.max_actions must be at least 1");
        }
        if o.tool_timeout_ms == 0 || o.turn_deadline_ms == 0 {
            anyhow::bail!("orchestrator timeouts must be greater than zero");
        }
        if o.reply_char_limit == 0 {
            anyhow::bail!("orchestrator.reply_char_limit must be at least 1");
        }
        if self.retrieval.k == 0 {
            anyhow::bail!("retrieval.k must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_score) {
            anyhow::bail!("retrieval.min_score must be within [0, 1]");
        }
        if self.llm.max_concurrent_requests == 0 {
            anyhow::bail!("llm.max_concurrent_requests must be at least 1");
        }
        Ok(())
    }

    /// Memory settings with the orchestrator's window size applied.
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            window_size: self.orchestrator.window_size,
            ..self.memory.clone()
        }
    }
}

/// Validate config file permissions on Unix systems.
///
/// Requirements:
/// - File must be a regular file (not symlink, directory, etc.)
/// - File must not be world-writable (mode & 0o002 == 0)
/// - If file contains API key patterns, must not be world-readable
#[cfg(unix)]
fn validate_config_file_permissions(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

    if !metadata.is_file() {
        anyhow::bail!(
            "Config path '{}' is not a regular file. Symlinks and directories are not allowed.",
            path.display()
        );
    }

    let permission_bits = metadata.permissions().mode() & 0o777;

    if permission_bits & 0o002 != 0 {
        anyhow::bail!(
            "Config file '{}' is world-writable (mode {:04o}). \
             This is a security risk. Fix with: chmod o-w {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    let content = std::fs::read_to_string(path).unwrap_or_default();
    let has_api_key = content.contains("api_key")
        && (content.contains("sk-") || content.contains("key ="));

    if has_api_key && permission_bits & 0o004 != 0 {
        anyhow::bail!(
            "Config file '{}' contains an API key but is world-readable (mode {:04o}). \
             This is a security risk. Fix with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    if has_api_key && permission_bits & 0o040 != 0 {
        warn!(
            "Config file '{}' contains an API key and is group-readable (mode {:04o}). \
             Consider restricting access with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = CoordinatorConfig::from_toml("").unwrap();
        assert_eq!(config.orchestrator.window_size, 10);
        assert_eq!(config.orchestrator.max_actions, 4);
        assert_eq!(config.orchestrator.reply_char_limit, 4900);
        assert_eq!(config.retrieval.k, 4);
        assert_eq!(config.tools.classifier, ClassifierKind::Llm);
        assert_eq!(config.llm.provider, "openai");
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = CoordinatorConfig::from_toml(
            r#"
            [llm]
            provider = "ollama"
            model = "qwen2.5"

            [orchestrator]
            window_size = 6
            turn_deadline_ms = 1000

            [retrieval]
            k = 2

            [tools]
            classifier = "lexicon"
            "#,
        )
        .unwrap();
        assert_eq!(config.llm.provider, "ollama");
        assert_eq!(config.orchestrator.window_size, 6);
        assert_eq!(config.orchestrator.prompt_turns, 5);
        assert_eq!(config.retrieval.k, 2);
        assert_eq!(config.tools.classifier, ClassifierKind::Lexicon);
        assert_eq!(config.memory_config().window_size, 6);
    }

    #[test]
    fn test_rejects_zero_bounds() {
        assert!(CoordinatorConfig::from_toml("[orchestrator]\nwindow_size = 0").is_err());
        assert!(CoordinatorConfig::from_toml("[orchestrator]\nmax_actions = 0").is_err());
        assert!(CoordinatorConfig::from_toml("[retrieval]\nk = 0").is_err());
        assert!(CoordinatorConfig::from_toml("[retrieval]\nmin_score = 1.5").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_world_writable_file() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[orchestrator]\nwindow_size = 4").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o666)).unwrap();
        assert!(CoordinatorConfig::from_file(file.path()).is_err());

        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        let config = CoordinatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.orchestrator.window_size, 4);
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_world_readable_api_key() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[llm]\napi_key = \"sk-test\"").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(CoordinatorConfig::from_file(file.path()).is_err());
    }
}
