//! SFTP file transfer over pooled SSH clients
//!
//! Transfers ride the same pooled connection as command execution; they are
//! not commands and report a [`TransferResult`] with byte counts instead of
//! an exit code.

use std::path::Path;
use std::time::{Duration, Instant};

use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use walkdir::WalkDir;

use super::SshAdapter;
use crate::command::SshOptions;
use crate::error::{Error, Result};

/// Outcome of a file or directory transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferResult {
    pub bytes: u64,
    pub files: u32,
    pub duration: Duration,
}

impl SshAdapter {
    async fn sftp_session(&self, opts: &SshOptions) -> Result<(SftpSession, String)> {
        let acquired = self.pool.acquire(opts).await?;
        let mut channel = {
            let handle = acquired.handle.lock().await;
            handle.channel_open_session().await.map_err(Error::from)?
        };
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(Error::from)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::Connection(format!("sftp subsystem failed: {}", e)))?;
        Ok((sftp, acquired.key))
    }

    /// Upload one local file to `dst` on the remote host.
    pub async fn upload_file(
        &self,
        opts: &SshOptions,
        src: &Path,
        dst: &str,
    ) -> Result<TransferResult> {
        let started = Instant::now();
        let (sftp, key) = self.sftp_session(opts).await?;

        let outcome = async {
            let mut local = tokio::fs::File::open(src).await.map_err(Error::from)?;
            let mut remote = sftp
                .create(dst)
                .await
                .map_err(|e| Error::Connection(format!("sftp create {}: {}", dst, e)))?;
            let bytes = tokio::io::copy(&mut local, &mut remote)
                .await
                .map_err(Error::from)?;
            remote.shutdown().await.map_err(Error::from)?;
            debug!(src = %src.display(), dst, bytes, "uploaded file");
            Ok(TransferResult {
                bytes,
                files: 1,
                duration: started.elapsed(),
            })
        }
        .await;

        self.pool.release(&key).await;
        outcome
    }

    /// Download one remote file into `dst` locally.
    pub async fn download_file(
        &self,
        opts: &SshOptions,
        src: &str,
        dst: &Path,
    ) -> Result<TransferResult> {
        let started = Instant::now();
        let (sftp, key) = self.sftp_session(opts).await?;

        let outcome = async {
            let mut remote = sftp
                .open(src)
                .await
                .map_err(|e| Error::Connection(format!("sftp open {}: {}", src, e)))?;
            let mut local = tokio::fs::File::create(dst).await.map_err(Error::from)?;
            let bytes = tokio::io::copy(&mut remote, &mut local)
                .await
                .map_err(Error::from)?;
            local.flush().await.map_err(Error::from)?;
            debug!(src, dst = %dst.display(), bytes, "downloaded file");
            Ok(TransferResult {
                bytes,
                files: 1,
                duration: started.elapsed(),
            })
        }
        .await;

        self.pool.release(&key).await;
        outcome
    }

    /// Recursively upload a local directory under `dst` on the remote host.
    pub async fn upload_dir(
        &self,
        opts: &SshOptions,
        src: &Path,
        dst: &str,
    ) -> Result<TransferResult> {
        let started = Instant::now();
        let (sftp, key) = self.sftp_session(opts).await?;

        let outcome = async {
            let mut bytes = 0_u64;
            let mut files = 0_u32;

            for entry in WalkDir::new(src).follow_links(false) {
                let entry = entry
                    .map_err(|e| Error::InvalidArgument(format!("walking {}: {}", src.display(), e)))?;
                let relative = entry
                    .path()
                    .strip_prefix(src)
                    .map_err(Error::internal)?;
                if relative.as_os_str().is_empty() {
                    continue;
                }
                let remote_path = format!("{}/{}", dst.trim_end_matches('/'), relative.display());

                if entry.file_type().is_dir() {
                    // Existing directories are fine.
                    let _ = sftp.create_dir(&remote_path).await;
                } else if entry.file_type().is_file() {
                    let mut local = tokio::fs::File::open(entry.path()).await.map_err(Error::from)?;
                    let mut remote = sftp.create(&remote_path).await.map_err(|e| {
                        Error::Connection(format!("sftp create {}: {}", remote_path, e))
                    })?;
                    bytes += tokio::io::copy(&mut local, &mut remote)
                        .await
                        .map_err(Error::from)?;
                    remote.shutdown().await.map_err(Error::from)?;
                    files += 1;
                }
            }

            debug!(src = %src.display(), dst, files, bytes, "uploaded directory");
            Ok(TransferResult {
                bytes,
                files,
                duration: started.elapsed(),
            })
        }
        .await;

        self.pool.release(&key).await;
        outcome
    }

    /// Recursively download a remote directory into `dst` locally.
    pub async fn download_dir(
        &self,
        opts: &SshOptions,
        src: &str,
        dst: &Path,
    ) -> Result<TransferResult> {
        let started = Instant::now();
        let (sftp, key) = self.sftp_session(opts).await?;

        let outcome = async {
            let mut bytes = 0_u64;
            let mut files = 0_u32;
            let mut pending = vec![src.trim_end_matches('/').to_string()];

            while let Some(dir) = pending.pop() {
                let relative = dir.strip_prefix(src).unwrap_or("").trim_start_matches('/');
                let local_dir = dst.join(relative);
                tokio::fs::create_dir_all(&local_dir).await.map_err(Error::from)?;

                let entries = sftp
                    .read_dir(&dir)
                    .await
                    .map_err(|e| Error::Connection(format!("sftp read_dir {}: {}", dir, e)))?;

                for entry in entries {
                    let name = entry.file_name();
                    let remote_path = format!("{}/{}", dir, name);
                    if entry.file_type().is_dir() {
                        pending.push(remote_path);
                    } else {
                        let mut remote = sftp.open(&remote_path).await.map_err(|e| {
                            Error::Connection(format!("sftp open {}: {}", remote_path, e))
                        })?;
                        let mut local = tokio::fs::File::create(local_dir.join(&name))
                            .await
                            .map_err(Error::from)?;
                        bytes += tokio::io::copy(&mut remote, &mut local)
                            .await
                            .map_err(Error::from)?;
                        files += 1;
                    }
                }
            }

            debug!(src, dst = %dst.display(), files, bytes, "downloaded directory");
            Ok(TransferResult {
                bytes,
                files,
                duration: started.elapsed(),
            })
        }
        .await;

        self.pool.release(&key).await;
        outcome
    }
}
