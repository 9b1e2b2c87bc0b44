//! Service configuration, read from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Scanner binaries the service knows how to drive locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Sqlmap,
    Nmap,
    Nikto,
    Mock,
}

impl FromStr for ToolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlmap" => Ok(ToolKind::Sqlmap),
            "nmap" => Ok(ToolKind::Nmap),
            "nikto" => Ok(ToolKind::Nikto),
            "mock" => Ok(ToolKind::Mock),
            other => Err(ConfigError::invalid(
                "SCANNER_TOOLS",
                format!("unknown tool {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub queued_tools: Vec<String>,
    pub tools: Vec<ToolKind>,
    pub tool_timeout: Duration,
    pub nikto_timeout: Duration,
    pub guest_scan_limit: u32,
    pub queue_poll_interval: Duration,
    pub rate_limit_per_hour: u32,
    pub rate_limit_per_day: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            database_url: "sqlite:vulnscan.db?mode=rwc".to_string(),
            redis_url: None,
            queued_tools: vec!["zap".to_string()],
            tools: vec![ToolKind::Sqlmap, ToolKind::Nmap, ToolKind::Nikto],
            tool_timeout: Duration::from_secs(300),
            nikto_timeout: Duration::from_secs(600),
            guest_scan_limit: 3,
            queue_poll_interval: Duration::from_millis(2000),
            rate_limit_per_hour: 50,
            rate_limit_per_day: 200,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let tools = match lookup("SCANNER_TOOLS") {
            Some(list) => split_list(&list)
                .iter()
                .map(|name| name.parse())
                .collect::<Result<Vec<ToolKind>, _>>()?,
            None => defaults.tools,
        };

        let config = Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: lookup("REDIS_URL").filter(|url| !url.trim().is_empty()),
            queued_tools: lookup("QUEUED_TOOLS")
                .map(|list| split_list(&list))
                .unwrap_or(defaults.queued_tools),
            tools,
            tool_timeout: parse_or(&lookup, "TOOL_TIMEOUT_SECS", defaults.tool_timeout, Duration::from_secs)?,
            nikto_timeout: parse_or(&lookup, "NIKTO_TIMEOUT_SECS", defaults.nikto_timeout, Duration::from_secs)?,
            guest_scan_limit: parse_or(&lookup, "GUEST_SCAN_LIMIT", defaults.guest_scan_limit, |n| n)?,
            queue_poll_interval: parse_or(
                &lookup,
                "QUEUE_POLL_MILLIS",
                defaults.queue_poll_interval,
                Duration::from_millis,
            )?,
            rate_limit_per_hour: parse_or(&lookup, "RATE_LIMIT_PER_HOUR", defaults.rate_limit_per_hour, |n| n)?,
            rate_limit_per_day: parse_or(&lookup, "RATE_LIMIT_PER_DAY", defaults.rate_limit_per_day, |n| n)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool_timeout.is_zero() {
            return Err(ConfigError::invalid("TOOL_TIMEOUT_SECS", "Must be greater than 0"));
        }
        if self.nikto_timeout.is_zero() {
            return Err(ConfigError::invalid("NIKTO_TIMEOUT_SECS", "Must be greater than 0"));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(ConfigError::invalid("QUEUE_POLL_MILLIS", "Must be greater than 0"));
        }
        if self.rate_limit_per_hour == 0 {
            return Err(ConfigError::invalid("RATE_LIMIT_PER_HOUR", "Must be greater than 0"));
        }
        if self.rate_limit_per_day == 0 {
            return Err(ConfigError::invalid("RATE_LIMIT_PER_DAY", "Must be greater than 0"));
        }

        let queued = self.redis_url.is_some() && !self.queued_tools.is_empty();
        if self.tools.is_empty() && !queued {
            return Err(ConfigError::invalid(
                "SCANNER_TOOLS",
                "At least one scanning tool must be configured",
            ));
        }
        Ok(())
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<F, N, T>(lookup: &F, key: &str, default: T, convert: fn(N) -> T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    N: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<N>()
            .map(convert)
            .map_err(|_| ConfigError::invalid(key, format!("not a number: {raw:?}"))),
        None => Ok(default),
    }
}
