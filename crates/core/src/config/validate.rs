use std::path::{Component, Path};

use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Poll interval and cache TTL are not 0
/// - Torrents subdir is a single plain path component
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let session = &config.session;

    if session.poll_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "session.poll_interval_ms cannot be 0".to_string(),
        ));
    }

    if session.cache_ttl_ms == 0 {
        return Err(ConfigError::ValidationError(
            "session.cache_ttl_ms cannot be 0".to_string(),
        ));
    }

    let mut components = Path::new(&session.torrents_subdir).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => {
            return Err(ConfigError::ValidationError(format!(
                "session.torrents_subdir must be a single directory name, got {:?}",
                session.torrents_subdir
            )));
        }
    }

    Ok(())
}
