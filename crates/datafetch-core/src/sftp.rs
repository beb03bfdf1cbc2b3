//! SFTP access used by the SFTP loader and locators
//!
//! `ssh2` is blocking, so every session call runs inside
//! `tokio::task::spawn_blocking`, the same way blocking FTP transfers are
//! wrapped elsewhere in the workspace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ssh2::{ErrorCode, Session};
use std::collections::BTreeMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SftpProtocolConfig;
use crate::credentials::SftpCredentials;
use crate::error::FailureKind;

/// libssh2 `LIBSSH2_ERROR_AUTHENTICATION_FAILED`
const SSH_AUTHENTICATION_FAILED: i32 = -18;
/// SFTP status `NO_SUCH_FILE`
const SFTP_NO_SUCH_FILE: i32 = 2;
/// SFTP status `PERMISSION_DENIED`
const SFTP_PERMISSION_DENIED: i32 = 3;

/// A classified SFTP failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SftpError {
    pub kind: FailureKind,
    pub message: String,
}

impl SftpError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    fn from_ssh(context: &str, err: ssh2::Error) -> Self {
        let kind = match err.code() {
            ErrorCode::Session(SSH_AUTHENTICATION_FAILED) => FailureKind::Permanent,
            ErrorCode::SFTP(SFTP_NO_SUCH_FILE) | ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => {
                FailureKind::Permanent
            },
            _ => FailureKind::Transient,
        };
        Self {
            kind,
            message: format!("{}: {}", context, err),
        }
    }
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub size: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

/// An open SFTP session
#[async_trait]
pub trait RemoteFileSystem: Send + Sync {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError>;
}

/// Opens SFTP sessions from resolved credentials
#[async_trait]
pub trait SftpConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &SftpCredentials,
        config: &SftpProtocolConfig,
    ) -> Result<Arc<dyn RemoteFileSystem>, SftpError>;
}

// ============================================================================
// ssh2 implementation
// ============================================================================

/// Production connector backed by libssh2
#[derive(Debug, Clone, Default)]
pub struct Ssh2Connector;

// fields drop in declaration order: the channel closes before its session
struct Ssh2Handle {
    sftp: ssh2::Sftp,
    _session: Session,
}

/// SFTP session over `ssh2`; calls are serialized on one channel
pub struct Ssh2FileSystem {
    handle: Arc<Mutex<Ssh2Handle>>,
    host: String,
}

fn open_session(
    credentials: &SftpCredentials,
    timeout: Duration,
) -> Result<Ssh2Handle, SftpError> {
    let address = credentials.address();
    let socket = address
        .to_socket_addrs()
        .map_err(|e| SftpError::transient(format!("resolving {}: {}", address, e)))?
        .next()
        .ok_or_else(|| SftpError::permanent(format!("{} did not resolve", address)))?;

    let tcp = TcpStream::connect_timeout(&socket, timeout)
        .map_err(|e| SftpError::transient(format!("connecting to {}: {}", address, e)))?;

    let mut session =
        Session::new().map_err(|e| SftpError::from_ssh("creating ssh session", e))?;
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| SftpError::from_ssh("ssh handshake", e))?;
    session
        .userauth_password(&credentials.username, &credentials.password)
        .map_err(|e| SftpError::from_ssh("password authentication", e))?;
    if !session.authenticated() {
        return Err(SftpError::permanent(format!(
            "authentication rejected for {}@{}",
            credentials.username, address
        )));
    }

    let sftp = session
        .sftp()
        .map_err(|e| SftpError::from_ssh("opening sftp channel", e))?;

    Ok(Ssh2Handle {
        _session: session,
        sftp,
    })
}

#[async_trait]
impl SftpConnector for Ssh2Connector {
    async fn connect(
        &self,
        credentials: &SftpCredentials,
        config: &SftpProtocolConfig,
    ) -> Result<Arc<dyn RemoteFileSystem>, SftpError> {
        debug!(host = %credentials.host, port = credentials.port, "Connecting to SFTP server");

        let creds = credentials.clone();
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let handle = tokio::task::spawn_blocking(move || open_session(&creds, timeout))
            .await
            .map_err(|e| SftpError::transient(format!("sftp connect task failed: {}", e)))??;

        info!(host = %credentials.host, "SFTP session established");

        Ok(Arc::new(Ssh2FileSystem {
            handle: Arc::new(Mutex::new(handle)),
            host: credentials.host.clone(),
        }))
    }
}

impl Ssh2FileSystem {
    async fn with_sftp<T, F>(&self, f: F) -> Result<T, SftpError>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Sftp) -> Result<T, SftpError> + Send + 'static,
    {
        let handle = Arc::clone(&self.handle);
        tokio::task::spawn_blocking(move || {
            let guard = handle
                .lock()
                .map_err(|_| SftpError::transient("sftp session lock poisoned"))?;
            f(&guard.sftp)
        })
        .await
        .map_err(|e| SftpError::transient(format!("sftp task failed: {}", e)))?
    }
}

#[async_trait]
impl RemoteFileSystem for Ssh2FileSystem {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        debug!(host = %self.host, path, "Listing remote directory");
        let dir = path.to_string();
        self.with_sftp(move |sftp| {
            let entries = sftp
                .readdir(Path::new(&dir))
                .map_err(|e| SftpError::from_ssh(&format!("listing {}", dir), e))?;
            Ok(entries
                .into_iter()
                .map(|(path, stat)| RemoteEntry {
                    path: path.to_string_lossy().to_string(),
                    size: stat.size,
                    modified_at: stat
                        .mtime
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0)),
                    is_dir: stat.is_dir(),
                })
                .collect())
        })
        .await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        debug!(host = %self.host, path, "Reading remote file");
        let file_path = path.to_string();
        self.with_sftp(move |sftp| {
            let mut file = sftp
                .open(Path::new(&file_path))
                .map_err(|e| SftpError::from_ssh(&format!("opening {}", file_path), e))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|e| SftpError::transient(format!("reading {}: {}", file_path, e)))?;
            Ok(data)
        })
        .await
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// A directory tree held in memory; used for local dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteFileSystem {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryRemoteFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), content.into());
        }
        self
    }
}

#[async_trait]
impl RemoteFileSystem for MemoryRemoteFileSystem {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        let files = self
            .files
            .lock()
            .map_err(|_| SftpError::transient("listing lock poisoned"))?;
        let dir = format!("{}/", path.trim_end_matches('/'));

        let mut entries: BTreeMap<String, RemoteEntry> = BTreeMap::new();
        for (file_path, content) in files.iter() {
            let Some(rest) = file_path.strip_prefix(&dir) else {
                continue;
            };
            match rest.split_once('/') {
                Some((sub, _)) => {
                    let sub_path = format!("{}{}", dir, sub);
                    entries.entry(sub_path.clone()).or_insert(RemoteEntry {
                        path: sub_path,
                        size: None,
                        modified_at: None,
                        is_dir: true,
                    });
                },
                None => {
                    entries.insert(
                        file_path.clone(),
                        RemoteEntry {
                            path: file_path.clone(),
                            size: Some(content.len() as u64),
                            modified_at: None,
                            is_dir: false,
                        },
                    );
                },
            }
        }

        if entries.is_empty() {
            return Err(SftpError::permanent(format!("no such directory: {}", path)));
        }
        Ok(entries.into_values().collect())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        let files = self
            .files
            .lock()
            .map_err(|_| SftpError::transient("read lock poisoned"))?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| SftpError::permanent(format!("no such file: {}", path)))
    }
}

/// Connector that hands out a shared [`MemoryRemoteFileSystem`]
#[derive(Debug, Clone, Default)]
pub struct MemorySftpConnector {
    fs: MemoryRemoteFileSystem,
}

impl MemorySftpConnector {
    pub fn new(fs: MemoryRemoteFileSystem) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl SftpConnector for MemorySftpConnector {
    async fn connect(
        &self,
        _credentials: &SftpCredentials,
        _config: &SftpProtocolConfig,
    ) -> Result<Arc<dyn RemoteFileSystem>, SftpError> {
        Ok(Arc::new(self.fs.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tree() -> MemoryRemoteFileSystem {
        MemoryRemoteFileSystem::new()
            .with_file("/doc/cor/a.txt", "alpha")
            .with_file("/doc/cor/b.csv", "beta")
            .with_file("/doc/cor/2023/c.txt", "gamma")
    }

    #[tokio::test]
    async fn test_memory_listing_reports_files_and_dirs() {
        let entries = tree().list_dir("/doc/cor").await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| (e.path.as_str(), e.is_dir)).collect();
        assert_eq!(
            paths,
            vec![
                ("/doc/cor/2023", true),
                ("/doc/cor/a.txt", false),
                ("/doc/cor/b.csv", false)
            ]
        );
        assert_eq!(entries[1].size, Some(5));
    }

    #[tokio::test]
    async fn test_memory_missing_paths_are_permanent() {
        let fs = tree();
        assert_eq!(fs.read_file("/nope").await.unwrap_err().kind, FailureKind::Permanent);
        assert_eq!(fs.list_dir("/nope").await.unwrap_err().kind, FailureKind::Permanent);
        assert_eq!(fs.read_file("/doc/cor/a.txt").await.unwrap(), b"alpha");
    }
}
