//! Loads the YAML configuration file into a list of service definitions
//! (§6 of the spec). The only recognised top-level key is `services`.

use std::path::Path;

use serde::Deserialize;

use crate::persistence::models::ServiceDef;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AppConfig {
    pub services: Vec<ServiceDef>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_services_list() {
        let yaml = r#"
services:
  - name: web
    repository: alice/site
    path: /tmp/site
    branch: main
    deploy_command: echo hi
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "web");
    }

    #[test]
    fn ignores_unrecognised_top_level_keys() {
        let yaml = r#"
some_future_key: true
services: []
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.services.is_empty());
    }

    #[test]
    fn load_reads_and_parses_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pushbot.yaml");
        std::fs::write(
            &path,
            "services:\n  - name: web\n    repository: alice/site\n    path: /tmp/site\n    branch: main\n    deploy_command: echo hi\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "web");
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reports_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pushbot.yaml");
        std::fs::write(&path, "services: [this is not a service list").unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
