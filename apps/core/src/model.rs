use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LoginUri {
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Login {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub totp: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub uris: Vec<LoginUri>,
}

/// One entry of the vault listing, exactly as `bw serve` returns it.
/// Items are snapshots: nothing in the plugin mutates them after fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VaultItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub login: Option<Login>,
}

impl VaultItem {
    pub fn new(id: &str, name: &str, username: Option<&str>, password: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            login: Some(Login {
                username: username.map(str::to_string),
                password: password.map(str::to_string),
                totp: None,
                uris: Vec::new(),
            }),
        }
    }

    pub fn with_totp(mut self, seed: &str) -> Self {
        let login = self.login.get_or_insert_with(Login::default);
        login.totp = Some(seed.to_string());
        self
    }

    pub fn username(&self) -> Option<&str> {
        self.login
            .as_ref()
            .and_then(|login| login.username.as_deref())
            .filter(|value| !value.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.login.as_ref().and_then(|login| login.password.as_deref())
    }

    pub fn has_totp(&self) -> bool {
        self.login
            .as_ref()
            .and_then(|login| login.totp.as_deref())
            .is_some_and(|seed| !seed.trim().is_empty())
    }
}

/// Lock state reported by the vault server. Derived fresh for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unauthenticated,
    Locked,
    Unlocked,
}

impl ServerState {
    /// Anything the server says that we do not recognise counts as
    /// unauthenticated, which routes the user to the login prompt.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "locked" => Self::Locked,
            "unlocked" => Self::Unlocked,
            _ => Self::Unauthenticated,
        }
    }

    pub fn is_authenticated(self) -> bool {
        !matches!(self, Self::Unauthenticated)
    }
}

pub fn normalize_for_search(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
