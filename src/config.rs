use std::path::PathBuf;
use std::time::Duration;

use crate::evaluation::Settings;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_TASKS_PATH: &str = "tasks";
const DEFAULT_DATA_PATH: &str = "data/bench.json";
const DEFAULT_MAX_CONCURRENT: usize = 2;
const DEFAULT_GENERATION_TIMEOUT: u64 = 600;
const DEFAULT_HEALTH_TIMEOUT: u64 = 30;
const DEFAULT_JUDGE_TIMEOUT: u64 = 300;
const DEFAULT_JUDGE_MAX_ATTEMPTS: u32 = 2;
const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub auth_token: Option<String>,
    pub ollama_url: String,
    pub tasks_path: PathBuf,
    pub data_path: PathBuf,
    pub max_concurrent_generations: usize,
    pub generation_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub judge_timeout_secs: u64,
    pub judge_max_attempts: u32,
    /// Capacity of the broadcast channel feeding websocket clients.
    pub event_buffer: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            auth_token: std::env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            ollama_url: std::env::var("OLLAMA_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.into()),
            tasks_path: PathBuf::from(
                std::env::var("TASKS_PATH").unwrap_or_else(|_| DEFAULT_TASKS_PATH.into()),
            ),
            data_path: PathBuf::from(
                std::env::var("DATA_PATH").unwrap_or_else(|_| DEFAULT_DATA_PATH.into()),
            ),
            max_concurrent_generations: env_parse(
                "MAX_CONCURRENT_GENERATIONS",
                DEFAULT_MAX_CONCURRENT,
            )
            .max(1),
            generation_timeout_secs: env_parse("GENERATION_TIMEOUT_SECS", DEFAULT_GENERATION_TIMEOUT),
            health_timeout_secs: env_parse("HEALTH_TIMEOUT_SECS", DEFAULT_HEALTH_TIMEOUT),
            judge_timeout_secs: env_parse("JUDGE_TIMEOUT_SECS", DEFAULT_JUDGE_TIMEOUT),
            judge_max_attempts: env_parse("JUDGE_MAX_ATTEMPTS", DEFAULT_JUDGE_MAX_ATTEMPTS).max(1),
            event_buffer: env_parse("EVENT_BUFFER", DEFAULT_EVENT_BUFFER).max(1),
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            tasks_path: self.tasks_path.clone(),
            max_concurrent: self.max_concurrent_generations,
            generation_timeout: Duration::from_secs(self.generation_timeout_secs),
            health_timeout: Duration::from_secs(self.health_timeout_secs),
            judge_timeout: Duration::from_secs(self.judge_timeout_secs),
            judge_attempts: self.judge_max_attempts,
        }
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║              llm-bench v{:<25}║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Port:              {:<28}║", self.port);
        tracing::info!("║  Auth:              {:<28}║", if self.auth_token.is_some() { "enabled" } else { "disabled" });
        tracing::info!("║  Ollama:            {:<28}║", self.ollama_url);
        tracing::info!("║  Tasks:             {:<28}║", self.tasks_path.display());
        tracing::info!("║  Data:              {:<28}║", self.data_path.display());
        tracing::info!("║  Max concurrent:    {:<28}║", self.max_concurrent_generations);
        tracing::info!("║  Generation timeout:{:<27}s ║", self.generation_timeout_secs);
        tracing::info!("║  Health timeout:    {:<27}s ║", self.health_timeout_secs);
        tracing::info!("║  Judge timeout:     {:<27}s ║", self.judge_timeout_secs);
        tracing::info!("║  Judge attempts:    {:<28}║", self.judge_max_attempts);
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_concurrent_generations, DEFAULT_MAX_CONCURRENT);
        assert_eq!(cfg.judge_max_attempts, DEFAULT_JUDGE_MAX_ATTEMPTS);
        assert_eq!(cfg.ollama_url, DEFAULT_OLLAMA_URL);
    }

    #[test]
    fn test_settings_carry_timeouts() {
        let cfg = Config::from_env();
        let settings = cfg.settings();
        assert_eq!(settings.generation_timeout, Duration::from_secs(DEFAULT_GENERATION_TIMEOUT));
        assert_eq!(settings.judge_timeout, Duration::from_secs(DEFAULT_JUDGE_TIMEOUT));
        assert_eq!(settings.tasks_path, PathBuf::from(DEFAULT_TASKS_PATH));
        assert_eq!(settings.max_concurrent, cfg.max_concurrent_generations);
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_parse::<u16>("NONEXISTENT_VAR_XYZ", 42), 42);
    }
}
