//! Transport adapter over the `ssh2` crate (libssh2 bindings)

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};
use tracing::debug;

use crate::config::AuthConfig;
use crate::ports::{
    ConnectParams, FileAttributes, RemoteDirEntry, RemoteFile, SftpTransport, TransportError,
    TransportErrorKind, TransportSession,
};

// SFTP status codes (draft-ietf-secsh-filexfer)
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_NO_CONNECTION: i32 = 6;
const SSH_FX_CONNECTION_LOST: i32 = 7;
const SSH_FX_NO_SUCH_PATH: i32 = 10;

// libssh2 session error codes
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_AGENT_PROTOCOL: i32 = -42;

/// Map an `ssh2` error from an SFTP request.
fn map_error(e: &ssh2::Error, path: &str) -> TransportError {
    let kind = match e.code() {
        ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE | SSH_FX_NO_SUCH_PATH) => TransportErrorKind::NotFound,
        ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => TransportErrorKind::PermissionDenied,
        ErrorCode::SFTP(SSH_FX_NO_CONNECTION | SSH_FX_CONNECTION_LOST) => {
            TransportErrorKind::Connection
        }
        ErrorCode::SFTP(_) => TransportErrorKind::Failure,
        ErrorCode::Session(_) => TransportErrorKind::Connection,
    };
    TransportError::new(kind, e.message()).with_path(path)
}

/// Map an `ssh2` error from a `userauth_*` call.
fn map_auth_error(e: &ssh2::Error, method: &str) -> TransportError {
    let kind = match e.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_FILE
            | LIBSSH2_ERROR_AUTHENTICATION_FAILED
            | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
            | LIBSSH2_ERROR_AGENT_PROTOCOL,
        ) => TransportErrorKind::Authentication,
        _ => TransportErrorKind::Connection,
    };
    TransportError::new(kind, format!("{method} authentication failed: {}", e.message()))
}

/// Map a stream error from reading or writing an open handle.
fn map_stream_error(e: &std::io::Error, path: &str) -> TransportError {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => TransportErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => TransportErrorKind::PermissionDenied,
        _ => TransportErrorKind::Io,
    };
    TransportError::new(kind, e.to_string()).with_path(path)
}

fn connection_error(what: &str, err: impl std::fmt::Display) -> TransportError {
    TransportError::new(TransportErrorKind::Connection, format!("{what}: {err}"))
}

fn to_attributes(stat: &ssh2::FileStat) -> FileAttributes {
    FileAttributes {
        size: stat.size,
        permissions: stat.perm,
        mtime: stat.mtime,
        atime: stat.atime,
        uid: stat.uid,
        gid: stat.gid,
    }
}

/// Opens real SFTP sessions over TCP
///
/// Each `connect` performs TCP connect (bounded by the configured timeout),
/// SSH handshake, authentication and SFTP subsystem start-up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Transport;

impl Ssh2Transport {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn authenticate(session: &Session, params: &ConnectParams) -> Result<(), TransportError> {
        let user = params.username.as_str();
        let method = params.auth.method_name();
        let result = match &params.auth {
            AuthConfig::Password { password } => session.userauth_password(user, password.as_str()),
            AuthConfig::Key { path, passphrase } => session.userauth_pubkey_file(
                user,
                None,
                Path::new(path),
                passphrase.as_deref().map(String::as_str),
            ),
            AuthConfig::Agent => session.userauth_agent(user),
        };
        result.map_err(|e| map_auth_error(&e, method))?;

        if !session.authenticated() {
            return Err(TransportError::new(
                TransportErrorKind::Authentication,
                format!("{method} authentication was not accepted"),
            ));
        }
        Ok(())
    }
}

impl SftpTransport for Ssh2Transport {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn TransportSession>, TransportError> {
        let target = format!("{}:{}", params.hostname, params.port);
        let addr = target
            .to_socket_addrs()
            .map_err(|e| connection_error(&format!("cannot resolve {target}"), e))?
            .next()
            .ok_or_else(|| {
                TransportError::new(
                    TransportErrorKind::Connection,
                    format!("no address found for {target}"),
                )
            })?;

        let tcp = TcpStream::connect_timeout(&addr, params.timeout)
            .map_err(|e| connection_error(&format!("TCP connection to {target} failed"), e))?;

        let mut session =
            Session::new().map_err(|e| connection_error("failed to create SSH session", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(params.timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| connection_error("SSH handshake failed", e))?;

        Self::authenticate(&session, params)?;

        let sftp = session
            .sftp()
            .map_err(|e| connection_error("failed to open SFTP channel", e))?;

        debug!(addr = %target, user = %params.username, "SFTP session established");
        Ok(Box::new(Ssh2Session {
            session,
            sftp: Some(sftp),
        }))
    }
}

struct Ssh2Session {
    session: Session,
    /// `None` after close
    sftp: Option<Sftp>,
}

impl Ssh2Session {
    fn sftp(&self, path: &str) -> Result<&Sftp, TransportError> {
        self.sftp.as_ref().ok_or_else(|| {
            TransportError::new(TransportErrorKind::Connection, "session closed").with_path(path)
        })
    }
}

impl TransportSession for Ssh2Session {
    fn open_read(&mut self, path: &str) -> Result<Box<dyn RemoteFile>, TransportError> {
        let file = self
            .sftp(path)?
            .open(Path::new(path))
            .map_err(|e| map_error(&e, path))?;
        Ok(Box::new(Ssh2File {
            file,
            path: path.to_string(),
        }))
    }

    fn open_write(&mut self, path: &str, mode: i32) -> Result<Box<dyn RemoteFile>, TransportError> {
        let file = self
            .sftp(path)?
            .open_mode(
                Path::new(path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
                OpenType::File,
            )
            .map_err(|e| map_error(&e, path))?;
        Ok(Box::new(Ssh2File {
            file,
            path: path.to_string(),
        }))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError> {
        let entries = self
            .sftp(path)?
            .readdir(Path::new(path))
            .map_err(|e| map_error(&e, path))?;

        Ok(entries
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().into_owned();
                (name != "." && name != "..").then(|| RemoteDirEntry {
                    name,
                    attrs: to_attributes(&stat),
                })
            })
            .collect())
    }

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), TransportError> {
        self.sftp(path)?
            .mkdir(Path::new(path), mode)
            .map_err(|e| map_error(&e, path))
    }

    fn rmdir(&mut self, path: &str) -> Result<(), TransportError> {
        self.sftp(path)?
            .rmdir(Path::new(path))
            .map_err(|e| map_error(&e, path))
    }

    fn remove(&mut self, path: &str) -> Result<(), TransportError> {
        self.sftp(path)?
            .unlink(Path::new(path))
            .map_err(|e| map_error(&e, path))
    }

    fn stat(&mut self, path: &str) -> Result<FileAttributes, TransportError> {
        self.sftp(path)?
            .stat(Path::new(path))
            .map(|stat| to_attributes(&stat))
            .map_err(|e| map_error(&e, path))
    }

    fn is_alive(&mut self) -> bool {
        // One cheap round-trip through the SFTP channel
        self.sftp
            .as_ref()
            .is_some_and(|sftp| sftp.realpath(Path::new(".")).is_ok())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.sftp.take().is_none() {
            return Ok(());
        }
        self.session
            .disconnect(None, "closing pooled session", None)
            .map_err(|e| connection_error("SSH disconnect failed", e))
    }
}

struct Ssh2File {
    file: ssh2::File,
    path: String,
}

impl RemoteFile for Ssh2File {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.file
            .read(buf)
            .map_err(|e| map_stream_error(&e, &self.path))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.file
            .write(data)
            .map_err(|e| map_stream_error(&e, &self.path))
    }

    fn close(mut self: Box<Self>) -> Result<(), TransportError> {
        self.file
            .flush()
            .map_err(|e| map_stream_error(&e, &self.path))
    }
}
