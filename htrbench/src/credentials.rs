use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::error::{HtrError, Result};

/// Credential material for one backend. Which fields are required depends on
/// the service: Microsoft needs `key` + `endpoint`, Google and Mistral need
/// `key`, and `endpoint` optionally overrides a service's default base URL.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Look up credentials for `service`, checking environment variables first
/// (`HTRBENCH_<SERVICE>_KEY` / `HTRBENCH_<SERVICE>_ENDPOINT`) and falling
/// back to `<credentials_dir>/<service>.json`.
///
/// Failure here is an [`HtrError::Auth`]: fatal for this adapter, harmless
/// for the rest of the run.
pub fn credentials_for(service: &str, credentials_dir: Option<&Path>) -> Result<Credentials> {
    let prefix = format!("HTRBENCH_{}", service.replace('-', "_").to_uppercase());

    if let Ok(key) = env::var(format!("{prefix}_KEY")) {
        return Ok(Credentials {
            key,
            endpoint: env::var(format!("{prefix}_ENDPOINT")).ok(),
        });
    }

    let Some(dir) = credentials_dir else {
        return Err(HtrError::Auth(format!(
            "No credentials for {service}: set {prefix}_KEY or provide a credentials directory"
        )));
    };

    let path = dir.join(format!("{service}.json"));
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        HtrError::Auth(format!(
            "Cannot read credentials file {}: {e}",
            path.display()
        ))
    })?;
    let creds: Credentials = serde_json::from_str(&contents).map_err(|e| {
        HtrError::Auth(format!(
            "Malformed credentials file {}: {e}",
            path.display()
        ))
    })?;
    if creds.key.is_empty() {
        return Err(HtrError::Auth(format!(
            "Empty key in credentials file {}",
            path.display()
        )));
    }
    Ok(creds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_credentials_take_precedence() {
        env::set_var("HTRBENCH_GOOGLE_KEY", "env-key");
        let creds = credentials_for("google", None).unwrap();
        assert_eq!(creds.key, "env-key");
        assert!(creds.endpoint.is_none());
        env::remove_var("HTRBENCH_GOOGLE_KEY");
    }

    #[test]
    #[serial]
    fn test_missing_credentials_is_auth_error() {
        env::remove_var("HTRBENCH_GOOGLE_KEY");
        let err = credentials_for("google", None).unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    #[serial]
    fn test_credentials_file_fallback() {
        env::remove_var("HTRBENCH_MICROSOFT_KEY");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("microsoft.json"),
            r#"{"key": "abc123", "endpoint": "https://example.cognitiveservices.azure.com"}"#,
        )
        .unwrap();

        let creds = credentials_for("microsoft", Some(dir.path())).unwrap();
        assert_eq!(creds.key, "abc123");
        assert_eq!(
            creds.endpoint.as_deref(),
            Some("https://example.cognitiveservices.azure.com")
        );
    }

    #[test]
    #[serial]
    fn test_malformed_credentials_file() {
        env::remove_var("HTRBENCH_MISTRAL_KEY");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mistral.json"), "not json").unwrap();

        let err = credentials_for("mistral", Some(dir.path())).unwrap_err();
        assert!(err.is_auth());
        assert!(err.to_string().contains("Malformed"));
    }
}
