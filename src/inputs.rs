use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const FINGERPRINT_LEN: usize = 16;

/// One API key. The key itself never leaves this type except for the request
/// that needs it; everything else identifies the credential by fingerprint.
#[derive(Clone)]
pub struct Credential {
    key: SecretString,
    fingerprint: String,
}

impl Credential {
    pub fn new(key: SecretString) -> Self {
        let digest = Sha256::digest(key.expose_secret().as_bytes());
        let mut fingerprint = URL_SAFE_NO_PAD.encode(digest);
        fingerprint.truncate(FINGERPRINT_LEN);
        Self { key, fingerprint }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn key(&self) -> &SecretString {
        &self.key
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Reads the keys file, appends the key from the environment (if any) and
/// drops duplicates while keeping the first occurrence.
pub fn load_credentials(config: &AppConfig) -> AppResult<Vec<Credential>> {
    let mut keys = match fs::read_to_string(&config.keys_file) {
        Ok(contents) => parse_lines(&contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if config.google_places_api_key.is_none() {
                return Err(AppError::Config(format!(
                    "keys file {} not found",
                    config.keys_file.display()
                )));
            }
            Vec::new()
        }
        Err(err) => return Err(AppError::Io(err)),
    };
    if let Some(key) = &config.google_places_api_key {
        keys.push(key.expose_secret().trim().to_string());
    }

    let mut seen = HashSet::new();
    let credentials = keys
        .into_iter()
        .filter(|key| seen.insert(key.clone()))
        .map(|key| Credential::new(SecretString::from(key)))
        .collect::<Vec<_>>();

    if credentials.is_empty() {
        return Err(AppError::Config("no API credentials configured".into()));
    }
    info!(count = credentials.len(), "loaded API credentials");
    Ok(credentials)
}

/// Search types from `search`, restricted to those listed in `valid`.
pub fn load_place_types(search: &Path, valid: &Path) -> AppResult<Vec<String>> {
    let requested = parse_lines(&read_required(search)?);
    let valid = parse_lines(&read_required(valid)?)
        .into_iter()
        .collect::<HashSet<_>>();
    filter_place_types(requested, &valid)
}

fn filter_place_types(requested: Vec<String>, valid: &HashSet<String>) -> AppResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();
    for place_type in requested {
        if !valid.contains(&place_type) {
            warn!(place_type = %place_type, "dropping unknown place type");
            continue;
        }
        if seen.insert(place_type.clone()) {
            accepted.push(place_type);
        }
    }
    if accepted.is_empty() {
        return Err(AppError::Config("no valid place types to search".into()));
    }
    Ok(accepted)
}

fn read_required(path: &Path) -> AppResult<String> {
    fs::read_to_string(path).map_err(|err| {
        AppError::Path(format!("unable to read {}: {err}", path.display()))
    })
}

/// Trimmed, non-empty lines.
pub fn parse_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn config_with_keys(path: PathBuf, env_key: Option<&str>) -> AppConfig {
        AppConfig {
            keys_file: path,
            google_places_api_key: env_key.map(|key| SecretString::from(key.to_string())),
            ..AppConfig::default()
        }
    }

    #[test]
    fn fingerprints_are_stable_and_opaque() {
        let a = Credential::new(SecretString::from("AIza-key-one".to_string()));
        let b = Credential::new(SecretString::from("AIza-key-one".to_string()));
        let c = Credential::new(SecretString::from("AIza-key-two".to_string()));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), FINGERPRINT_LEN);
        assert!(!format!("{a:?}").contains("AIza"));
    }

    #[test]
    fn loads_deduplicated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        fs::write(&path, "alpha\n\n  beta \nalpha\n").unwrap();

        let credentials = load_credentials(&config_with_keys(path, Some("beta"))).unwrap();
        let keys = credentials
            .iter()
            .map(|c| c.key().expose_secret().to_string())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["alpha", "beta"]);
    }

    #[test]
    fn empty_key_set_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        fs::write(&path, "\n   \n").unwrap();
        assert!(matches!(
            load_credentials(&config_with_keys(path, None)),
            Err(AppError::Config(_))
        ));
        assert!(load_credentials(&config_with_keys(dir.path().join("missing.txt"), None)).is_err());
    }

    #[test]
    fn filters_unknown_place_types() {
        let dir = tempfile::tempdir().unwrap();
        let search = dir.path().join("search.txt");
        let valid = dir.path().join("valid.txt");
        fs::write(&search, "cafe\nspaceport\nbar\ncafe\n").unwrap();
        fs::write(&valid, "bar\ncafe\nrestaurant\n").unwrap();

        assert_eq!(load_place_types(&search, &valid).unwrap(), vec!["cafe", "bar"]);

        fs::write(&search, "spaceport\n").unwrap();
        assert!(load_place_types(&search, &valid).is_err());
    }
}
