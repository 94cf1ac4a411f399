//! In-process credential store.

use std::collections::HashMap;

use berth_core::{BerthError, CredentialProvider};

/// Credentials handed in explicitly, e.g. from CLI flags.
#[derive(Default, Clone)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// Values are secrets; only names are printed.
impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.values.keys().collect();
        names.sort();
        f.debug_struct("StaticCredentials")
            .field("names", &names)
            .finish()
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self, name: &str) -> berth_core::Result<String> {
        match self.values.get(name) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            Some(_) => Err(BerthError::Registry(format!("credential {name} is empty"))),
            None => Err(BerthError::Registry(format!("no credential named {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let creds = StaticCredentials::new().with("ghcr", "token-123");
        assert_eq!(creds.credential("ghcr").unwrap(), "token-123");
        assert!(creds.credential("dockerhub").is_err());
    }

    #[test]
    fn test_debug_hides_values() {
        let creds = StaticCredentials::new().with("ghcr", "token-123");
        let printed = format!("{creds:?}");
        assert!(printed.contains("ghcr"));
        assert!(!printed.contains("token-123"));
    }
}
