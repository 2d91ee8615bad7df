use super::types::{AuthConfig, ClientConfig};
use crate::error::{Result, SftpError};
use std::path::Path;
use tracing::warn;

/// Load a client configuration from a YAML file
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file does not exist
/// - The file cannot be read
/// - The YAML content is invalid or cannot be parsed
/// - The configuration fails validation (empty hostname, zero chunk size,
///   missing key file, ...)
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        return Err(SftpError::ConfigNotFound {
            path: path.display().to_string(),
        });
    }

    // Warn if config file has overly permissive permissions (may contain secrets)
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.mode() & 0o777;
            if mode & 0o037 != 0 {
                warn!(
                    config_path = %path.display(),
                    permissions = format!("{mode:04o}"),
                    "Config file may contain secrets and has permissive permissions. \
                     Consider: chmod 640 {}",
                    path.display()
                );
            }
        }
    }

    let content = std::fs::read_to_string(path)?;
    let mut config: ClientConfig = serde_saphyr::from_str(&content)?;

    if let AuthConfig::Key { path: key_path, .. } = &mut config.auth {
        *key_path = shellexpand::tilde(key_path.as_str()).into_owned();
    }

    validate_config(&config)?;
    validate_key_file(&config)?;

    Ok(config)
}

/// Structural validation shared by the loader and the client constructor.
///
/// # Errors
///
/// Returns `ConfigInvalid` naming the first offending field.
pub fn validate_config(config: &ClientConfig) -> Result<()> {
    if config.hostname.is_empty() {
        return Err(invalid("hostname", "Hostname cannot be empty"));
    }

    if config.username.is_empty() {
        return Err(invalid("username", "Username cannot be empty"));
    }

    if config.port == 0 {
        return Err(invalid("port", "Port must be between 1 and 65535"));
    }

    if config.chunk_size == 0 {
        return Err(invalid("chunk_size", "Chunk size must be at least 1 byte"));
    }

    if config.max_connections == 0 {
        return Err(invalid(
            "max_connections",
            "At least one connection per host is required",
        ));
    }

    if config.max_workers == 0 {
        return Err(invalid(
            "max_workers",
            "At least one blocking worker is required",
        ));
    }

    if let AuthConfig::Key { path, .. } = &config.auth
        && path.is_empty()
    {
        return Err(invalid("auth.path", "Key path cannot be empty"));
    }

    Ok(())
}

/// Key file must exist and must not be readable by group/others
fn validate_key_file(config: &ClientConfig) -> Result<()> {
    let AuthConfig::Key { path, .. } = &config.auth else {
        return Ok(());
    };

    let key_path = Path::new(path);
    if !key_path.exists() {
        return Err(invalid("auth.path", &format!("Key file not found: {path}")));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(metadata) = std::fs::metadata(key_path) {
            let mode = metadata.mode() & 0o777;
            if mode & 0o077 != 0 {
                return Err(invalid(
                    "auth.path",
                    &format!(
                        "SSH key file '{path}' has permissions {mode:04o}; expected 0600. \
                         Fix with: chmod 600 {path}"
                    ),
                ));
            }
        }
    }

    Ok(())
}

fn invalid(field: &str, reason: &str) -> SftpError {
    SftpError::ConfigInvalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Get the default configuration file path
#[must_use]
pub fn default_config_path() -> std::path::PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("pooled-sftp")
        .join("config.yaml")
}

#[cfg(test)]
#[allow(clippy::needless_raw_string_hashes)]
mod tests {
    use super::*;
    use crate::config::BackoffStrategy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_not_found() {
        let result = load_config(Path::new("/nonexistent/config.yaml"));
        assert!(matches!(result, Err(SftpError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("config.yaml"));
        assert!(path.to_string_lossy().contains("pooled-sftp"));
    }

    #[test]
    fn test_load_password_config() {
        let file = write_yaml(
            r#"
hostname: sftp.example.com
username: deploy
auth:
  type: password
  password: "s3cret"
max_connections: 2
backoff: fixed
"#,
        );

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.hostname, "sftp.example.com");
        assert_eq!(config.port, 22);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.backoff, BackoffStrategy::Fixed);
    }

    #[test]
    fn test_empty_hostname_rejected() {
        let file = write_yaml(
            r#"
hostname: ""
username: deploy
auth:
  type: agent
"#,
        );

        let result = load_config(file.path());
        assert!(
            matches!(result, Err(SftpError::ConfigInvalid { field, reason })
            if field == "hostname" && reason.contains("empty"))
        );
    }

    #[test]
    fn test_empty_username_rejected() {
        let file = write_yaml(
            r#"
hostname: "192.168.1.1"
username: ""
auth:
  type: agent
"#,
        );

        let result = load_config(file.path());
        assert!(
            matches!(result, Err(SftpError::ConfigInvalid { field, .. }) if field == "username")
        );
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let file = write_yaml(
            r#"
hostname: "192.168.1.1"
username: deploy
auth:
  type: agent
chunk_size: 0
"#,
        );

        let result = load_config(file.path());
        assert!(
            matches!(result, Err(SftpError::ConfigInvalid { field, .. }) if field == "chunk_size")
        );
    }

    #[test]
    fn test_missing_key_file_rejected() {
        let file = write_yaml(
            r#"
hostname: "192.168.1.1"
username: deploy
auth:
  type: key
  path: /nonexistent/id_ed25519
"#,
        );

        let result = load_config(file.path());
        assert!(
            matches!(result, Err(SftpError::ConfigInvalid { field, reason })
            if field == "auth.path" && reason.contains("not found"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_key_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let key = NamedTempFile::new().unwrap();
        std::fs::set_permissions(key.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let file = write_yaml(&format!(
            "hostname: h\nusername: u\nauth:\n  type: key\n  path: {}\n",
            key.path().display()
        ));

        let result = load_config(file.path());
        assert!(
            matches!(result, Err(SftpError::ConfigInvalid { reason, .. }) if reason.contains("0600"))
        );
    }

    #[test]
    fn test_invalid_yaml() {
        let file = write_yaml("hostname: [unclosed");
        let result = load_config(file.path());
        assert!(matches!(result, Err(SftpError::Yaml(_))));
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = ClientConfig::with_password("h", "u", "p");
        config.max_workers = 0;
        assert!(
            matches!(validate_config(&config), Err(SftpError::ConfigInvalid { field, .. }) if field == "max_workers")
        );
    }

    #[test]
    fn test_validate_ok() {
        let config = ClientConfig::with_password("h", "u", "p");
        assert!(validate_config(&config).is_ok());
    }
}
