use crate::RetryPolicy;

/// Tunables for the pipeline workflows and activities. Defaults match the
/// production values; `from_env` lets a host override them per deployment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Locale hint passed to the transcription provider.
    pub locale: String,
    /// Character budget per transcript chunk.
    pub chunk_size: usize,
    /// Characters of shared context between neighboring chunks.
    pub chunk_overlap: usize,
    /// Number of search hits fed into answer generation.
    pub top_k: usize,
    /// Delay between transcription polls.
    pub poll_interval_ms: u64,
    /// Polling window after which a transcription times out.
    pub max_wait_ms: u64,
    /// Retry policy for the query activity; masks index propagation lag.
    pub query_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            locale: "en-US".to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k: 5,
            poll_interval_ms: 10_000,
            max_wait_ms: 2 * 60 * 60 * 1000,
            query_retry: RetryPolicy::fixed(3, 3000),
        }
    }
}

impl PipelineConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            locale: env_str("PODFLOW_LOCALE").unwrap_or(defaults.locale),
            chunk_size: env_parse("PODFLOW_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            chunk_overlap: env_parse("PODFLOW_CHUNK_OVERLAP").unwrap_or(defaults.chunk_overlap),
            top_k: env_parse("PODFLOW_SEARCH_TOP_K").unwrap_or(defaults.top_k),
            poll_interval_ms: env_parse("PODFLOW_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval_ms),
            max_wait_ms: env_parse("PODFLOW_MAX_WAIT_MS").unwrap_or(defaults.max_wait_ms),
            query_retry: RetryPolicy::fixed(
                env_parse("PODFLOW_QUERY_RETRY_ATTEMPTS").unwrap_or(defaults.query_retry.max_attempts),
                env_parse("PODFLOW_QUERY_RETRY_INTERVAL_MS").unwrap_or(defaults.query_retry.first_retry_interval_ms),
            ),
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
