use secrecy::SecretString;

/// Wraps an API key with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    /// Read the key from an environment variable, if set and non-empty.
    pub fn from_env(var: &str) -> Option<Self> {
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Some(Self::new(v)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Environment variable names recognized at startup.
pub mod env_vars {
    pub const REFINE_API_KEY: &str = "REFINE_API_KEY";
    pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
}
