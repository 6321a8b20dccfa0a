use crate::error::{RelayError, Result};
use crate::proxy::{HeaderInjector, PathRewriter, ProxySettings, RewriteRule};
use crate::retry::BackoffPolicy;
use crate::services::FeedPollerConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::{Host, Url};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Local listener configuration
    pub listener: ListenerConfig,
    /// Upstream and forwarding configuration
    pub upstream: UpstreamConfig,
    /// Backoff used for retried upstream calls
    pub retry: RetryConfig,
    /// Feed poller configuration
    pub feed: FeedConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port to bind to (default: 7001)
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Path prefix taken from the upstream URL, empty for the root
    pub base_path: String,
    /// Connect plus TLS handshake timeout in seconds
    pub connect_timeout: u64,
    /// Response head and body idle timeout in seconds
    pub response_timeout: u64,
    pub rewrites: Vec<RewriteRule>,
    pub injector: HeaderInjector,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Make the first attempt without waiting
    pub immediate: bool,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub enabled: bool,
    /// Path of the JSON feed, fetched through the local listener
    pub path: String,
    pub interval_secs: u64,
    /// Ids or info hashes that are never announced
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(RelayError::InvalidConfig(format!(
                "LOG_FORMAT must be json or pretty, got {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let retry = RetryConfig {
            max_attempts: parse_env("RETRY_MAX_ATTEMPTS", "10")?,
            initial_delay_ms: parse_env("RETRY_INITIAL_DELAY_MS", "10")?,
            max_delay_ms: parse_env("RETRY_MAX_DELAY_MS", "120000")?,
            immediate: parse_env("RETRY_IMMEDIATE", "true")?,
        };
        if retry.max_attempts == 0 {
            return Err(RelayError::InvalidConfig(
                "RETRY_MAX_ATTEMPTS must be greater than 0".into(),
            ));
        }

        let feed = FeedConfig {
            enabled: parse_env("FEED_ENABLED", "true")?,
            path: get_env_or("FEED_PATH", "/torrent/all.json"),
            interval_secs: parse_env("FEED_INTERVAL_SECS", "60")?,
            removed: get_env_or("FEED_REMOVED", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };
        if !feed.path.starts_with('/') {
            return Err(RelayError::InvalidConfig(
                "FEED_PATH must start with '/'".into(),
            ));
        }
        if feed.interval_secs == 0 {
            return Err(RelayError::InvalidConfig(
                "FEED_INTERVAL_SECS must be greater than 0".into(),
            ));
        }

        Ok(Config {
            listener: ListenerConfig {
                host: get_env_or("RELAY_LISTEN_HOST", "127.0.0.1"),
                port: get_env_or("RELAY_LISTEN_PORT", "7001").parse().map_err(|_| {
                    RelayError::InvalidConfig(
                        "RELAY_LISTEN_PORT must be a valid port number".into(),
                    )
                })?,
            },
            upstream: parse_upstream()?,
            retry,
            feed,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty").parse()?,
            },
        })
    }

    /// Get the local listener address
    pub fn listen_addr(&self) -> String {
        if self.listener.host.contains(':') {
            format!("[{}]:{}", self.listener.host, self.listener.port)
        } else {
            format!("{}:{}", self.listener.host, self.listener.port)
        }
    }

    /// Settings for the root proxy node
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            upstream_host: self.upstream.host.clone(),
            upstream_port: self.upstream.port,
            use_tls: self.upstream.use_tls,
            base_path: self.upstream.base_path.clone(),
            rewriter: PathRewriter::new(self.upstream.rewrites.clone()),
            injector: self.upstream.injector.clone(),
            connect_timeout: Duration::from_secs(self.upstream.connect_timeout),
            response_timeout: Duration::from_secs(self.upstream.response_timeout),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_results: self.retry.max_attempts,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            immediate: self.retry.immediate,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            ..BackoffPolicy::default()
        }
    }

    pub fn feed_poller_config(&self) -> FeedPollerConfig {
        FeedPollerConfig {
            proxy_host: self.listener.host.clone(),
            proxy_port: self.listener.port,
            feed_path: self.feed.path.clone(),
            interval: Duration::from_secs(self.feed.interval_secs),
            removed: self.feed.removed.iter().cloned().collect(),
            backoff: self.backoff_policy(),
            connect_timeout: Duration::from_secs(self.upstream.connect_timeout),
            response_timeout: Duration::from_secs(self.upstream.response_timeout),
        }
    }
}

fn parse_upstream() -> Result<UpstreamConfig> {
    let raw = get_env_or("RELAY_UPSTREAM_URL", "https://tracker.example.org");
    let url = Url::parse(raw.trim()).map_err(|e| {
        RelayError::InvalidConfig(format!("RELAY_UPSTREAM_URL must be a valid URL: {}", e))
    })?;

    if url.fragment().is_some() || url.query().is_some() {
        return Err(RelayError::InvalidConfig(
            "RELAY_UPSTREAM_URL must not include query/fragment".into(),
        ));
    }

    let use_tls = match url.scheme() {
        "https" => true,
        "http" => false,
        other => {
            return Err(RelayError::InvalidConfig(format!(
                "RELAY_UPSTREAM_URL has unsupported scheme: {}",
                other
            )))
        }
    };

    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => {
            return Err(RelayError::InvalidConfig(
                "RELAY_UPSTREAM_URL must include a host".into(),
            ))
        }
    };

    let port = url.port_or_known_default().unwrap_or(if use_tls { 443 } else { 80 });

    let connect_timeout: u64 = parse_env("RELAY_CONNECT_TIMEOUT", "10")?;
    let response_timeout: u64 = parse_env("RELAY_RESPONSE_TIMEOUT", "30")?;
    if connect_timeout == 0 || response_timeout == 0 {
        return Err(RelayError::InvalidConfig(
            "RELAY_CONNECT_TIMEOUT and RELAY_RESPONSE_TIMEOUT must be greater than 0".into(),
        ));
    }

    Ok(UpstreamConfig {
        host,
        port,
        use_tls,
        base_path: url.path().trim_end_matches('/').to_string(),
        connect_timeout,
        response_timeout,
        rewrites: parse_rewrites(&get_env_or(
            "RELAY_PATH_REWRITES",
            "/tracker/announce$=>/tracker/uannounce",
        ))?,
        injector: parse_injected_headers()?,
    })
}

/// `pattern=>replacement` pairs separated by `;`
fn parse_rewrites(raw: &str) -> Result<Vec<RewriteRule>> {
    raw.split(';')
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .map(|rule| {
            let (pattern, replacement) = rule.split_once("=>").ok_or_else(|| {
                RelayError::InvalidConfig(format!(
                    "RELAY_PATH_REWRITES entry must look like pattern=>replacement: {:?}",
                    rule
                ))
            })?;
            RewriteRule::new(pattern.trim(), replacement.trim())
        })
        .collect()
}

fn parse_injected_headers() -> Result<HeaderInjector> {
    let mut injector = HeaderInjector::new();

    let user_agent = get_env_or("RELAY_USER_AGENT", "authrelay/0.1");
    if !user_agent.is_empty() {
        injector.insert("User-Agent", &user_agent)?;
    }

    for pair in get_env_or("RELAY_EXTRA_HEADERS", "")
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
    {
        let (name, value) = pair.split_once('=').ok_or_else(|| {
            RelayError::InvalidConfig(format!(
                "RELAY_EXTRA_HEADERS entry must look like Name=Value: {:?}",
                pair
            ))
        })?;
        injector.insert(name, value.trim())?;
    }

    // The credential goes last so nothing else can replace it
    let token = get_env_or("RELAY_AUTH_TOKEN", "");
    if !token.is_empty() {
        injector.insert_sensitive(&get_env_or("RELAY_AUTH_HEADER", "X-Relay-Key"), &token)?;
    }

    Ok(injector)
}

/// Parse an environment variable, falling back to a default
fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = get_env_or(key, default);
    raw.trim()
        .parse()
        .map_err(|_| RelayError::InvalidConfig(format!("{} has an invalid value: {:?}", key, raw)))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "RELAY_LISTEN_HOST",
        "RELAY_LISTEN_PORT",
        "RELAY_UPSTREAM_URL",
        "RELAY_CONNECT_TIMEOUT",
        "RELAY_RESPONSE_TIMEOUT",
        "RELAY_PATH_REWRITES",
        "RELAY_AUTH_HEADER",
        "RELAY_AUTH_TOKEN",
        "RELAY_USER_AGENT",
        "RELAY_EXTRA_HEADERS",
        "RETRY_MAX_ATTEMPTS",
        "RETRY_INITIAL_DELAY_MS",
        "RETRY_MAX_DELAY_MS",
        "RETRY_IMMEDIATE",
        "FEED_ENABLED",
        "FEED_PATH",
        "FEED_INTERVAL_SECS",
        "FEED_REMOVED",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:7001");
        assert_eq!(config.upstream.host, "tracker.example.org");
        assert_eq!(config.upstream.port, 443);
        assert!(config.upstream.use_tls);
        assert_eq!(config.upstream.base_path, "");
        assert_eq!(config.upstream.rewrites.len(), 1);
        assert_eq!(config.upstream.rewrites[0].pattern(), "/tracker/announce$");
        assert_eq!(config.upstream.rewrites[0].replacement(), "/tracker/uannounce");

        // No token configured, so only the user agent is injected
        let injected = config.upstream.injector.headers();
        assert_eq!(injected.len(), 1);
        assert_eq!(injected.get("user-agent").unwrap(), "authrelay/0.1");

        let policy = config.backoff_policy();
        assert_eq!(policy.max_results, 10);
        assert_eq!(policy.initial_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_secs(120));
        assert!(policy.immediate);

        assert!(config.feed.enabled);
        assert_eq!(config.feed.path, "/torrent/all.json");
        assert_eq!(config.feed.interval_secs, 60);
        assert!(config.feed.removed.is_empty());

        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Pretty);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("RELAY_LISTEN_PORT", "9000");
        env::set_var("RELAY_UPSTREAM_URL", "http://10.1.2.3:8080/lobber/");
        env::set_var("RELAY_AUTH_HEADER", "X_LOBBER_KEY");
        env::set_var("RELAY_AUTH_TOKEN", "s3cret");
        env::set_var("RELAY_EXTRA_HEADERS", "X-Node=storage-1; X-Env = prod");
        env::set_var("RELAY_PATH_REWRITES", "^/a=>/b; ^/b=>/c");
        env::set_var("RETRY_MAX_ATTEMPTS", "3");
        env::set_var("RETRY_IMMEDIATE", "false");
        env::set_var("FEED_REMOVED", "12, abcdef ,");
        env::set_var("LOG_FORMAT", "JSON");

        let config = Config::from_env().unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
        assert_eq!(config.upstream.host, "10.1.2.3");
        assert_eq!(config.upstream.port, 8080);
        assert!(!config.upstream.use_tls);
        assert_eq!(config.upstream.base_path, "/lobber");
        assert_eq!(config.upstream.rewrites.len(), 2);

        let injected = config.upstream.injector.headers();
        assert_eq!(injected.get("x_lobber_key").unwrap(), "s3cret");
        assert_eq!(injected.get("x-node").unwrap(), "storage-1");
        assert_eq!(injected.get("x-env").unwrap(), "prod");

        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.retry.immediate);
        assert_eq!(config.feed.removed, vec!["12".to_string(), "abcdef".to_string()]);
        assert_eq!(config.log.format, LogFormat::Json);

        let settings = config.proxy_settings();
        assert_eq!(settings.upstream_host, "10.1.2.3");
        assert_eq!(settings.base_path, "/lobber");
        assert_eq!(settings.rewriter.apply("/a/x"), "/c/x");

        let feed = config.feed_poller_config();
        assert_eq!(feed.proxy_port, 9000);
        assert!(feed.removed.contains("abcdef"));
        assert_eq!(feed.backoff.max_results, 3);
    }

    #[test]
    fn test_upstream_ipv6_host() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("RELAY_UPSTREAM_URL", "https://[::1]:8443");
        let config = Config::from_env().unwrap();
        assert_eq!(config.upstream.host, "::1");
        assert_eq!(config.upstream.port, 8443);
    }

    #[test]
    fn test_config_from_env_invalid_values() {
        let _lock = ENV_LOCK.lock().unwrap();

        let cases: &[(&str, &str)] = &[
            ("RELAY_LISTEN_PORT", "not-a-port"),
            ("RELAY_UPSTREAM_URL", "not a url"),
            ("RELAY_UPSTREAM_URL", "ftp://tracker.example.org"),
            ("RELAY_UPSTREAM_URL", "https://tracker.example.org/?key=1"),
            ("RELAY_PATH_REWRITES", "/missing-arrow"),
            ("RELAY_PATH_REWRITES", "(unclosed=>/x"),
            ("RELAY_AUTH_TOKEN", "bad\nvalue"),
            ("RELAY_EXTRA_HEADERS", "no-equals-sign"),
            ("RETRY_MAX_ATTEMPTS", "0"),
            ("RETRY_IMMEDIATE", "sometimes"),
            ("FEED_PATH", "torrent/all.json"),
            ("FEED_INTERVAL_SECS", "0"),
            ("RELAY_CONNECT_TIMEOUT", "0"),
            ("RELAY_RESPONSE_TIMEOUT", "0"),
            ("LOG_FORMAT", "xml"),
        ];

        for (key, value) in cases {
            let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
            env::set_var(key, value);
            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, RelayError::InvalidConfig(_)),
                "{}={:?} gave {:?}",
                key,
                value,
                err
            );
        }
    }

    #[test]
    fn test_auth_token_is_not_debug_printed() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("RELAY_AUTH_TOKEN", "do-not-log-me");
        let config = Config::from_env().unwrap();
        assert!(!format!("{:?}", config).contains("do-not-log-me"));
    }
}
