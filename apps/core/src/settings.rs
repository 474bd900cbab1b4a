use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER_PORT: u16 = 58765;
pub const DEFAULT_ACTION_KEYWORD: &str = "bw";

/// Cache staleness budget as offered in the launcher's settings panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CacheTtl {
    #[default]
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    SixHours,
    TwelveHours,
    OneDay,
    Indefinite,
}

impl CacheTtl {
    pub const ALL: [CacheTtl; 8] = [
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::SixHours,
        Self::TwelveHours,
        Self::OneDay,
        Self::Indefinite,
    ];

    /// Unknown labels fall back to five minutes.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|ttl| ttl.label().eq_ignore_ascii_case(trimmed))
            .unwrap_or_default()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5 minutes",
            Self::FifteenMinutes => "15 minutes",
            Self::ThirtyMinutes => "30 minutes",
            Self::OneHour => "1 hour",
            Self::SixHours => "6 hours",
            Self::TwelveHours => "12 hours",
            Self::OneDay => "1 day",
            Self::Indefinite => "Indefinite",
        }
    }

    /// `None` means cached listings never go stale.
    pub fn stale_time(self) -> Option<Duration> {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        let secs = match self {
            Self::FiveMinutes => 5 * MINUTE,
            Self::FifteenMinutes => 15 * MINUTE,
            Self::ThirtyMinutes => 30 * MINUTE,
            Self::OneHour => HOUR,
            Self::SixHours => 6 * HOUR,
            Self::TwelveHours => 12 * HOUR,
            Self::OneDay => 24 * HOUR,
            Self::Indefinite => return None,
        };
        Some(Duration::from_secs(secs))
    }
}

impl From<String> for CacheTtl {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<CacheTtl> for String {
    fn from(value: CacheTtl) -> Self {
        value.label().to_string()
    }
}

/// Settings object the launcher hands over with `initialize` and `query`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache_ttl: CacheTtl,
    #[serde(rename = "actionKeyword")]
    pub action_keyword: Option<String>,
    #[serde(rename = "bitwardenServerPort")]
    pub server_port: Option<String>,
    #[serde(rename = "bitwardenEmail")]
    pub email: Option<String>,
    #[serde(rename = "bitwardenPassword")]
    pub password: Option<String>,
}

impl Settings {
    /// Empty, unparsable or zero ports fall back to the default.
    pub fn port(&self) -> u16 {
        self.server_port
            .as_deref()
            .and_then(|raw| raw.trim().parse::<u16>().ok())
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    pub fn action_keyword(&self) -> &str {
        self.action_keyword
            .as_deref()
            .map(str::trim)
            .filter(|keyword| !keyword.is_empty())
            .unwrap_or(DEFAULT_ACTION_KEYWORD)
    }

    pub fn stale_time(&self) -> Option<Duration> {
        self.cache_ttl.stale_time()
    }

    pub fn stored_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|value| !value.is_empty())
    }
}
