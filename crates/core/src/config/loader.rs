use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("SEEDWARDEN_").split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[session]
base_dir = "/srv/torrents"
poll_interval_ms = 250
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.session.base_dir.to_str(), Some("/srv/torrents"));
        assert_eq!(config.session.poll_interval_ms, 250);
        assert_eq!(config.session.cache_ttl_ms, 1000);
        assert_eq!(config.session.torrents_subdir, "torrentfiles");
    }

    #[test]
    fn test_load_config_from_str_empty_uses_defaults() {
        let config = load_config_from_str("").unwrap();
        assert!(!config.session.blank_slate);
        assert_eq!(config.session.poll_interval_ms, 1000);
    }

    #[test]
    fn test_load_config_from_str_wrong_type() {
        let toml = r#"
[session]
blank_slate = "sometimes"
"#;
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[session]
base_dir = "/tmp/seedwarden"
blank_slate = true
cache_ttl_ms = 500
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert!(config.session.blank_slate);
        assert_eq!(config.session.cache_ttl_ms, 500);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
[session]
poll_interval_ms = 2000
"#,
            )?;
            jail.set_env("SEEDWARDEN_SESSION__POLL_INTERVAL_MS", "300");

            let config = load_config(Path::new("config.toml")).unwrap();
            assert_eq!(config.session.poll_interval_ms, 300);
            Ok(())
        });
    }
}
