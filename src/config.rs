use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    OpenAi,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct UsageLimits {
    pub text: u32,
    pub image: u32,
    pub pdf: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    pub log_format: LogFormat,
    pub ai_provider: AiProvider,
    pub openai: OpenAiConfig,
    pub webhook_secret: Option<String>,
    pub signup_credits: i64,
    pub period_credits: i64,
    pub usage_limits: UsageLimits,
    pub admin_user_ids: Vec<String>,
    pub stage_delay: Duration,
    pub session_retention: Duration,
    pub upload_retention: Duration,
    pub state_path: Option<PathBuf>,
    pub max_upload_bytes: usize,
    pub api_rate_limit: RateLimitConfig,
    pub generation_rate_limit: RateLimitConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            cors_origin: "http://localhost:5173".to_string(),
            log_format: LogFormat::Json,
            ai_provider: AiProvider::Mock,
            openai: OpenAiConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4-turbo".to_string(),
                temperature: 0.7,
                timeout_secs: 60,
            },
            webhook_secret: None,
            signup_credits: 10_000_000,
            period_credits: 10_000_000,
            usage_limits: UsageLimits { text: 50, image: 20, pdf: 10 },
            admin_user_ids: Vec::new(),
            stage_delay: Duration::from_millis(1000),
            session_retention: Duration::from_secs(3600),
            upload_retention: Duration::from_secs(24 * 3600),
            state_path: None,
            max_upload_bytes: 10 * 1024 * 1024,
            api_rate_limit: RateLimitConfig {
                max_requests: 100,
                window: Duration::from_secs(15 * 60),
            },
            generation_rate_limit: RateLimitConfig {
                max_requests: 10,
                window: Duration::from_secs(10 * 60),
            },
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e)),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let api_key = env_string("OPENAI_API_KEY");
        let ai_provider = match env_string("AI_PROVIDER").as_deref() {
            Some("openai") => AiProvider::OpenAi,
            Some("mock") => AiProvider::Mock,
            Some(other) => anyhow::bail!("unsupported AI_PROVIDER: {}", other),
            None if api_key.is_some() => AiProvider::OpenAi,
            None => AiProvider::Mock,
        };

        let log_format = match env_string("LOG_FORMAT").as_deref() {
            Some("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };

        let admin_user_ids = env_string("ADMIN_USER_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host: env_string("BACKEND_HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port)?,
            cors_origin: env_string("CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            log_format,
            ai_provider,
            openai: OpenAiConfig {
                api_key,
                base_url: env_string("OPENAI_BASE_URL").unwrap_or(defaults.openai.base_url),
                model: env_string("OPENAI_MODEL").unwrap_or(defaults.openai.model),
                temperature: env_parse("OPENAI_TEMPERATURE", defaults.openai.temperature)?,
                timeout_secs: env_parse("OPENAI_TIMEOUT_SECS", defaults.openai.timeout_secs)?,
            },
            webhook_secret: env_string("WEBHOOK_SECRET"),
            signup_credits: env_parse("SIGNUP_CREDITS", defaults.signup_credits)?,
            period_credits: env_parse("PERIOD_CREDITS", defaults.period_credits)?,
            usage_limits: UsageLimits {
                text: env_parse("USAGE_LIMIT_TEXT", defaults.usage_limits.text)?,
                image: env_parse("USAGE_LIMIT_IMAGE", defaults.usage_limits.image)?,
                pdf: env_parse("USAGE_LIMIT_PDF", defaults.usage_limits.pdf)?,
            },
            admin_user_ids,
            stage_delay: Duration::from_millis(env_parse("GENERATION_STAGE_DELAY_MS", 1000u64)?),
            session_retention: Duration::from_secs(env_parse("SESSION_RETENTION_SECS", 3600u64)?),
            upload_retention: Duration::from_secs(env_parse("UPLOAD_RETENTION_SECS", 24 * 3600u64)?),
            state_path: env_string("LOCAL_STATE_PATH").map(PathBuf::from),
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            api_rate_limit: RateLimitConfig {
                max_requests: env_parse("API_RATE_LIMIT", defaults.api_rate_limit.max_requests)?,
                window: Duration::from_secs(env_parse("API_RATE_WINDOW_SECS", 900u64)?),
            },
            generation_rate_limit: RateLimitConfig {
                max_requests: env_parse(
                    "GENERATION_RATE_LIMIT",
                    defaults.generation_rate_limit.max_requests,
                )?,
                window: Duration::from_secs(env_parse("GENERATION_RATE_WINDOW_SECS", 600u64)?),
            },
        })
    }

    pub fn is_admin(&self, external_id: &str) -> bool {
        self.admin_user_ids.iter().any(|id| id == external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.signup_credits, 10_000_000);
        assert_eq!(cfg.usage_limits.pdf, 10);
        assert_eq!(cfg.generation_rate_limit.max_requests, 10);
        assert_eq!(cfg.max_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn admin_lookup_is_exact() {
        let cfg = AppConfig {
            admin_user_ids: vec!["user_admin".into()],
            ..AppConfig::default()
        };
        assert!(cfg.is_admin("user_admin"));
        assert!(!cfg.is_admin("user_admin2"));
    }
}
