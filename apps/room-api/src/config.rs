use std::path::PathBuf;
use std::time::Duration;

/// Room API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Redis connection string.
    pub redis_url: String,
    /// `debug` or `release`; controls log verbosity defaults.
    pub application_mode: String,
    /// Language allow-list; the first entry is the default for new
    /// sessions.
    pub languages: Vec<String>,
    /// Host directory for per-run sandbox scratch space.
    pub code_work_dir: PathBuf,
    /// Wall-clock budget for one sandbox run.
    pub run_timeout: Duration,
    /// reCAPTCHA secret. When unset, captcha checks are skipped (dev).
    pub captcha_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is
    /// missing or malformed.
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            redis_url: required_var("REDIS_URL"),
            application_mode: std::env::var("APPLICATION_MODE")
                .unwrap_or_else(|_| "debug".to_string()),
            languages: parse_languages(
                &std::env::var("LANGUAGES")
                    .unwrap_or_else(|_| "python,javascript,go,cpp".to_string()),
            ),
            code_work_dir: std::env::var("CODE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/coderoom-jobs")),
            run_timeout: Duration::from_secs(
                std::env::var("RUN_TIMEOUT_SECOND")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            captcha_secret: std::env::var("GOOGLE_CAPTCHA_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

fn parse_languages(raw: &str) -> Vec<String> {
    let languages: Vec<String> = raw
        .split(',')
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if languages.is_empty() {
        panic!("LANGUAGES must name at least one language");
    }
    languages
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}
