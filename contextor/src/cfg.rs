//! Runtime configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use ai_llm_service::config::default_config::DEFAULT_CHAT_OPEN_TIMEOUT_SECS;

use crate::error::ContextorError;
use crate::prompt::DEFAULT_SYSTEM;

/// Answer shown to end users whenever no grounded answer can be produced.
pub const DEFAULT_FALLBACK: &str = "I don't know what you're talking about, HAL.";

/// Config bag for question answering. All fields have defaults.
#[derive(Clone, Debug)]
pub struct ContextorConfig {
    /// Chunks retrieved per question when the request does not say.
    pub top_k: usize,
    /// Fixed user-facing answer for empty retrieval and every failure.
    pub fallback_answer: String,
    /// Bound for the first model response and every gap between fragments.
    pub generation_timeout: Duration,
    /// Bound for one attempt at opening the model stream.
    pub llm_open_timeout: Duration,
    /// Attempts to open the model stream; never applied mid-stream.
    pub llm_max_attempts: u32,
    /// Delay between stream-opening attempts.
    pub llm_retry_backoff: Duration,
    /// System instructions placed before the retrieved context.
    pub system_prompt: String,
}

impl Default for ContextorConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            fallback_answer: DEFAULT_FALLBACK.to_string(),
            generation_timeout: Duration::from_secs(30),
            llm_open_timeout: Duration::from_secs(DEFAULT_CHAT_OPEN_TIMEOUT_SECS),
            llm_max_attempts: 2,
            llm_retry_backoff: Duration::from_millis(500),
            system_prompt: DEFAULT_SYSTEM.trim().to_string(),
        }
    }
}

impl ContextorConfig {
    /// Build from environment variables with defaults.
    ///
    /// # Errors
    /// [`ContextorError::Config`] if a variable is set but invalid.
    ///
    /// # Example
    /// ```
    /// # use contextor::ContextorConfig;
    /// let cfg = ContextorConfig::from_env().unwrap();
    /// assert!(cfg.top_k >= 1);
    /// ```
    pub fn from_env() -> Result<Self, ContextorError> {
        let d = Self::default();
        let cfg = Self {
            top_k: parse("RAG_TOP_K", d.top_k)?,
            fallback_answer: env_str("FALLBACK_ANSWER").unwrap_or(d.fallback_answer),
            generation_timeout: Duration::from_secs(parse("GENERATION_TIMEOUT_SECS", 30u64)?),
            llm_open_timeout: Duration::from_secs(parse(
                "LLM_TIMEOUT_SECS",
                DEFAULT_CHAT_OPEN_TIMEOUT_SECS,
            )?),
            llm_max_attempts: parse("LLM_MAX_ATTEMPTS", d.llm_max_attempts)?,
            llm_retry_backoff: Duration::from_millis(parse("LLM_RETRY_BACKOFF_MS", 500u64)?),
            system_prompt: env_str("SYSTEM_PROMPT").unwrap_or(d.system_prompt),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ContextorError> {
        if self.top_k == 0 {
            return Err(ContextorError::Config("RAG_TOP_K must be > 0".into()));
        }
        if self.llm_max_attempts == 0 {
            return Err(ContextorError::Config("LLM_MAX_ATTEMPTS must be > 0".into()));
        }
        if self.generation_timeout.is_zero() || self.llm_open_timeout.is_zero() {
            return Err(ContextorError::Config(
                "GENERATION_TIMEOUT_SECS and LLM_TIMEOUT_SECS must be > 0".into(),
            ));
        }
        if self.open_budget() > self.generation_timeout {
            return Err(ContextorError::Config(format!(
                "{} open attempts of {:?} plus backoff need {:?}, more than GENERATION_TIMEOUT_SECS ({:?})",
                self.llm_max_attempts,
                self.llm_open_timeout,
                self.open_budget(),
                self.generation_timeout
            )));
        }
        Ok(())
    }

    /// Worst case spent opening the stream: every attempt timing out plus
    /// the linear backoff between them.
    pub fn open_budget(&self) -> Duration {
        let attempts = self.llm_max_attempts.max(1);
        let backoff: u32 = (1..attempts).sum();
        self.llm_open_timeout * attempts + self.llm_retry_backoff * backoff
    }
}

fn env_str(k: &str) -> Option<String> {
    std::env::var(k).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(k: &str, dflt: T) -> Result<T, ContextorError> {
    match env_str(k) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ContextorError::Config(format!("{k} has invalid value '{v}'"))),
        None => Ok(dflt),
    }
}
