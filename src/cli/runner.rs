//! CLI command implementations

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::{AuthConfig, ClientConfig, default_config_path, load_config, validate_config};
use crate::error::{Result, SftpError};
use crate::ports::FileAttributes;
use crate::ssh::{ProgressCallback, SftpClient, Ssh2Transport, TransferProgress};

use super::{Cli, Commands, TargetArgs};

/// What a command printed and whether it succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub success: bool,
}

impl CommandOutput {
    fn ok(text: String) -> Self {
        Self {
            text,
            success: true,
        }
    }
}

/// Build the client configuration from the config file and CLI flags.
///
/// An explicit `--config` must exist. Without one, the default config file is
/// used when present; otherwise `--host`, `--user` and an auth flag are
/// required.
///
/// # Errors
///
/// Returns the loader error or `ConfigInvalid` for missing settings.
pub fn resolve_config(config_path: Option<&Path>, target: &TargetArgs) -> Result<ClientConfig> {
    let default_path = default_config_path();
    let file = match config_path {
        Some(path) => Some(path),
        None if default_path.exists() => Some(default_path.as_path()),
        None => None,
    };

    let mut config = if let Some(path) = file {
        info!(config = %path.display(), "Loading configuration");
        load_config(path)?
    } else {
        let hostname = target.host.as_deref().ok_or_else(|| missing("hostname", "--host"))?;
        let username = target.user.as_deref().ok_or_else(|| missing("username", "--user"))?;
        let auth = auth_from_flags(target)
            .ok_or_else(|| missing("auth", "--password, --key or --agent"))?;
        ClientConfig::new(hostname, username, auth)
    };

    if let Some(host) = &target.host {
        config.hostname.clone_from(host);
    }
    if let Some(port) = target.port {
        config.port = port;
    }
    if let Some(user) = &target.user {
        config.username.clone_from(user);
    }
    if let Some(auth) = auth_from_flags(target) {
        config.auth = auth;
    }
    if let Some(retries) = target.retries {
        config.max_retries = retries;
    }

    validate_config(&config)?;
    debug!(
        target_host = %config.display_target(),
        auth = config.auth.method_name(),
        "Configuration resolved"
    );
    Ok(config)
}

fn auth_from_flags(target: &TargetArgs) -> Option<AuthConfig> {
    if let Some(password) = &target.password {
        return Some(AuthConfig::Password {
            password: Zeroizing::new(password.clone()),
        });
    }
    if let Some(key) = &target.key {
        let path = shellexpand::tilde(&key.to_string_lossy()).into_owned();
        return Some(AuthConfig::Key {
            path,
            passphrase: None,
        });
    }
    target.agent.then_some(AuthConfig::Agent)
}

fn missing(field: &str, flag: &str) -> SftpError {
    SftpError::ConfigInvalid {
        field: field.to_string(),
        reason: format!("no config file found; pass {flag}"),
    }
}

/// Resolve the configuration, connect over SSH and run one command.
///
/// # Errors
///
/// Returns configuration, connection or operation errors.
pub async fn run(cli: Cli) -> Result<CommandOutput> {
    let config = resolve_config(cli.config.as_deref(), &cli.target)?;
    let Cli { command, json, .. } = cli;

    SftpClient::scoped(config, Arc::new(Ssh2Transport::new()), |client| async move {
        execute(&client, command, json).await
    })
    .await
}

/// Run one command against an existing client.
///
/// # Errors
///
/// Returns the operation's error.
pub async fn execute(client: &SftpClient, command: Commands, json: bool) -> Result<CommandOutput> {
    match command {
        Commands::Ls { path, long } => {
            let entries = client.read_dir(&path).await?;
            if json {
                return Ok(CommandOutput::ok(to_json(&entries)));
            }
            let mut output = String::new();
            for entry in &entries {
                if long {
                    let _ = writeln!(
                        output,
                        "{} {:>12} {}",
                        format_mode(&entry.attrs),
                        entry.attrs.size.unwrap_or(0),
                        entry.name
                    );
                } else {
                    let _ = writeln!(output, "{}", entry.name);
                }
            }
            Ok(CommandOutput::ok(output))
        }

        Commands::Stat { path } => {
            let attrs = client.stat(&path).await?;
            if json {
                return Ok(CommandOutput::ok(to_json(&attrs)));
            }
            let mut output = String::new();
            let _ = writeln!(output, "  Path: {path}");
            let _ = writeln!(output, "  Type: {}", file_type(&attrs));
            let _ = writeln!(output, "  Mode: {}", format_mode(&attrs));
            let _ = writeln!(output, "  Size: {} bytes", attrs.size.unwrap_or(0));
            if let Some(mtime) = attrs.mtime {
                let _ = writeln!(output, "  Modified: {mtime} (unix)");
            }
            if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
                let _ = writeln!(output, "  Owner: {uid}:{gid}");
            }
            Ok(CommandOutput::ok(output))
        }

        Commands::Put {
            local,
            remote,
            progress,
        } => {
            let bytes = client.put(&local, &remote, progress_printer(progress)).await?;
            finish_progress_line(progress);
            Ok(CommandOutput::ok(transfer_message(
                json,
                "File uploaded",
                &local.display().to_string(),
                &remote,
                bytes,
            )))
        }

        Commands::Get {
            remote,
            local,
            progress,
        } => {
            let bytes = client.get(&remote, &local, progress_printer(progress)).await?;
            finish_progress_line(progress);
            Ok(CommandOutput::ok(transfer_message(
                json,
                "File downloaded",
                &remote,
                &local.display().to_string(),
                bytes,
            )))
        }

        Commands::Mkdir { path, mode } => {
            match mode {
                Some(mode) => client.mkdir_with_mode(&path, mode).await?,
                None => client.mkdir(&path).await?,
            }
            Ok(CommandOutput::ok(done(json, "created", &path)))
        }

        Commands::Rmdir { path } => {
            client.rmdir(&path).await?;
            Ok(CommandOutput::ok(done(json, "removed", &path)))
        }

        Commands::Rm { path } => {
            client.remove(&path).await?;
            Ok(CommandOutput::ok(done(json, "removed", &path)))
        }

        Commands::Exists { path } => {
            let exists = client.exists(&path).await?;
            let text = if json {
                to_json(&serde_json::json!({ "path": path, "exists": exists }))
            } else {
                format!("{exists}\n")
            };
            Ok(CommandOutput {
                text,
                success: exists,
            })
        }

        Commands::PutDir {
            local,
            remote,
            progress,
        } => {
            let summary = client
                .put_dir(&local, &remote, progress_printer(progress))
                .await?;
            finish_progress_line(progress);
            Ok(CommandOutput::ok(if json {
                to_json(&summary)
            } else {
                summary_message("Directory uploaded", &remote, &summary)
            }))
        }

        Commands::GetDir {
            remote,
            local,
            progress,
        } => {
            let summary = client
                .get_dir(&remote, &local, progress_printer(progress))
                .await?;
            finish_progress_line(progress);
            Ok(CommandOutput::ok(if json {
                to_json(&summary)
            } else {
                summary_message("Directory downloaded", &local.display().to_string(), &summary)
            }))
        }
    }
}

fn progress_printer(enabled: bool) -> Option<ProgressCallback> {
    if !enabled {
        return None;
    }
    Some(Arc::new(|progress: TransferProgress| {
        eprint!(
            "\r  {}: {:.1}% ({} / {} bytes)",
            progress.path,
            progress.percent(),
            progress.bytes_transferred,
            progress.total_bytes
        );
        let _ = std::io::stderr().flush();
    }))
}

fn finish_progress_line(enabled: bool) {
    if enabled {
        eprintln!();
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(mut text) => {
            text.push('\n');
            text
        }
        Err(e) => format!("{{\"error\": \"{e}\"}}\n"),
    }
}

fn done(json: bool, action: &str, path: &str) -> String {
    if json {
        to_json(&serde_json::json!({ "path": path, "action": action }))
    } else {
        format!("{path}: {action}\n")
    }
}

fn transfer_message(json: bool, title: &str, from: &str, to: &str, bytes: u64) -> String {
    if json {
        return to_json(&serde_json::json!({ "from": from, "to": to, "bytes": bytes }));
    }
    let mut output = String::new();
    let _ = writeln!(output, "{title}:");
    let _ = writeln!(output, "  From: {from}");
    let _ = writeln!(output, "  To: {to}");
    let _ = writeln!(output, "  Size: {bytes} bytes");
    output
}

fn summary_message(title: &str, destination: &str, summary: &crate::ssh::TransferSummary) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "{title}:");
    let _ = writeln!(output, "  Destination: {destination}");
    let _ = writeln!(output, "  Files: {}", summary.files_transferred);
    let _ = writeln!(output, "  Directories created: {}", summary.directories_created);
    let _ = writeln!(output, "  Bytes: {}", summary.bytes_transferred);
    let _ = writeln!(output, "  Duration: {}ms", summary.duration_ms);
    output
}

fn file_type(attrs: &FileAttributes) -> &'static str {
    if attrs.is_dir() {
        "directory"
    } else if attrs.is_file() {
        "file"
    } else {
        "other"
    }
}

/// `ls -l` style: type character followed by the permission bits in octal.
fn format_mode(attrs: &FileAttributes) -> String {
    let kind = if attrs.is_dir() { 'd' } else { '-' };
    match attrs.permissions {
        Some(perm) => format!("{kind}{:04o}", perm & 0o7777),
        None => format!("{kind}????"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::MemoryTransport;

    async fn client(transport: &MemoryTransport) -> SftpClient {
        let mut config = ClientConfig::with_password("server1", "admin", "pw");
        config.retry_delay_ms = 1;
        SftpClient::with_transport(config, Arc::new(transport.clone()))
            .await
            .unwrap()
    }

    // ============== Config resolution ==============

    #[test]
    fn test_resolve_from_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "hostname: file-host\nusername: file-user\nauth:\n  type: agent\n",
        )
        .unwrap();

        let target = TargetArgs {
            port: Some(2222),
            password: Some("secret".to_string()),
            retries: Some(0),
            ..TargetArgs::default()
        };
        let config = resolve_config(Some(&path), &target).unwrap();
        assert_eq!(config.hostname, "file-host");
        assert_eq!(config.port, 2222);
        assert_eq!(config.max_retries, 0);
        assert!(matches!(config.auth, AuthConfig::Password { .. }));
    }

    #[test]
    fn test_resolve_missing_explicit_file() {
        let err = resolve_config(Some(Path::new("/nonexistent/c.yaml")), &TargetArgs::default())
            .unwrap_err();
        assert!(matches!(err, SftpError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_auth_from_flags() {
        let agent = TargetArgs {
            agent: true,
            ..TargetArgs::default()
        };
        assert!(matches!(auth_from_flags(&agent), Some(AuthConfig::Agent)));
        assert!(auth_from_flags(&TargetArgs::default()).is_none());
    }

    // ============== Commands ==============

    #[tokio::test]
    async fn test_ls_long_and_json() {
        let transport = MemoryTransport::new();
        transport.add_file("/srv/a.txt", b"abc");
        transport.add_dir("/srv/sub");
        let client = client(&transport).await;

        let long = execute(
            &client,
            Commands::Ls {
                path: "/srv".to_string(),
                long: true,
            },
            false,
        )
        .await
        .unwrap();
        assert!(long.text.contains("-0644"));
        assert!(long.text.contains("a.txt"));
        assert!(long.text.contains("d0755"));

        let json = execute(
            &client,
            Commands::Ls {
                path: "/srv".to_string(),
                long: false,
            },
            true,
        )
        .await
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json.text).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_exists_sets_success() {
        let transport = MemoryTransport::new();
        let client = client(&transport).await;
        let out = execute(
            &client,
            Commands::Exists {
                path: "/nope".to_string(),
            },
            false,
        )
        .await
        .unwrap();
        assert!(!out.success);
        assert_eq!(out.text, "false\n");
    }

    #[tokio::test]
    async fn test_put_and_mkdir_commands() {
        let transport = MemoryTransport::new();
        let client = client(&transport).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("f.txt");
        std::fs::write(&local, b"hello").unwrap();

        execute(
            &client,
            Commands::Mkdir {
                path: "/up".to_string(),
                mode: Some(0o700),
            },
            false,
        )
        .await
        .unwrap();
        let out = execute(
            &client,
            Commands::Put {
                local,
                remote: "/up/f.txt".to_string(),
                progress: false,
            },
            true,
        )
        .await
        .unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&out.text).unwrap();
        assert_eq!(parsed["bytes"], 5);
        assert_eq!(transport.read_file("/up/f.txt").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_stat_missing_propagates() {
        let transport = MemoryTransport::new();
        let client = client(&transport).await;
        let err = execute(
            &client,
            Commands::Stat {
                path: "/nope".to_string(),
            },
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SftpError::FileNotFound { .. }));
    }

    #[test]
    fn test_format_mode() {
        let attrs = FileAttributes {
            permissions: Some(0o040_755),
            ..FileAttributes::default()
        };
        assert_eq!(format_mode(&attrs), "d0755");
        assert_eq!(format_mode(&FileAttributes::default()), "-????");
    }
}
