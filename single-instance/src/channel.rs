use crate::Error;
use crate::codec::HEADER_LEN;
use crate::codec::MAX_FRAME_LEN;
use crate::codec::body_len;
use futures::Stream;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::time::Instant;

/// Written back by the primary once a payload was decoded
pub const ACK: u8 = 0x06;

const SOCKET_MODE: u32 = 0o600;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Listening socket of the primary instance
#[derive(Debug)]
pub struct Endpoint {
    listener: UnixListener,
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl Endpoint {
    /// Bind the socket at `path`.
    ///
    /// Must only be called while holding the instance lock: a socket file left
    /// behind by a crashed primary is removed first.
    pub fn listen(path: &Path) -> Result<Endpoint, Error> {
        match fs::remove_file(path) {
            Ok(()) => log::debug!("Removed leftover socket {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::ChannelBind(e)),
        }

        let listener = UnixListener::bind(path).map_err(Error::ChannelBind)?;
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(Error::ChannelBind)?;
        let metadata = fs::metadata(path).map_err(Error::ChannelBind)?;

        log::debug!("Listening on {:?}", path);
        Ok(Endpoint {
            listener,
            path: path.to_path_buf(),
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Endless stream of incoming connections
    pub fn incoming(&self) -> impl Stream<Item = io::Result<Connection>> + '_ {
        futures::stream::unfold(&self.listener, |listener| async move {
            let accepted = listener
                .accept()
                .await
                .map(|(stream, _)| Connection { stream });
            Some((accepted, listener))
        })
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // A newer primary may already have bound its own socket here
        let ours = fs::metadata(&self.path)
            .map(|m| m.dev() == self.dev && m.ino() == self.ino)
            .unwrap_or(false);
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("Failed to remove socket {:?}: {}", self.path, e);
            }
        }
    }
}

/// One handoff connection, seen from either side
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    /// Connect to the primary at `path`.
    ///
    /// A missing socket or a refused connection usually means the primary has
    /// the lock but has not bound yet, so those are retried with backoff
    /// until `timeout` runs out.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Connection, Error> {
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, UnixStream::connect(path)).await {
                Ok(Ok(stream)) => return Ok(Connection { stream }),
                Ok(Err(e)) if is_not_listening(&e) => {
                    log::trace!("Primary not listening on {:?} yet: {}", path, e);
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => return Err(Error::ChannelConnectTimeout(timeout)),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ChannelConnectTimeout(timeout));
            }
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Send an encoded payload and wait for the acknowledgement.
    ///
    /// Returns whether the primary acknowledged in time. A slow primary is not
    /// an error since the payload has already been written, but a primary
    /// that closes the connection without acknowledging never got it:
    /// that is [`Error::ChannelClosed`].
    pub async fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<bool, Error> {
        let written = tokio::time::timeout(timeout, async {
            self.stream.write_all(payload).await?;
            self.stream.shutdown().await
        })
        .await
        .map_err(|_| Error::ChannelConnectTimeout(timeout))?;
        match written {
            Ok(()) => {}
            Err(e) if is_peer_gone(&e) => {
                log::debug!("Primary went away while sending: {}", e);
                return Err(Error::ChannelClosed);
            }
            Err(e) => return Err(Error::Io(e)),
        }

        let mut ack = [0u8; 1];
        match tokio::time::timeout(timeout, self.stream.read(&mut ack)).await {
            Ok(Ok(1)) if ack[0] == ACK => Ok(true),
            Ok(Ok(_)) => {
                log::debug!("Primary closed the connection without acknowledging");
                Err(Error::ChannelClosed)
            }
            Ok(Err(e)) => {
                log::debug!("Reading acknowledgement failed: {}", e);
                Err(Error::ChannelClosed)
            }
            Err(_) => {
                log::warn!("No acknowledgement within {}ms", timeout.as_millis());
                Ok(false)
            }
        }
    }

    /// Read one frame worth of bytes, or less if the peer closes early. The
    /// bytes are not validated here.
    pub async fn read_payload(&mut self) -> io::Result<Vec<u8>> {
        let mut payload = Vec::new();
        (&mut self.stream)
            .take(HEADER_LEN as u64)
            .read_to_end(&mut payload)
            .await?;

        if payload.len() == HEADER_LEN {
            let len = body_len(&payload);
            if len <= MAX_FRAME_LEN {
                (&mut self.stream)
                    .take(len as u64)
                    .read_to_end(&mut payload)
                    .await?;
            }
        }
        Ok(payload)
    }

    pub async fn acknowledge(&mut self) {
        if let Err(e) = self.stream.write_all(&[ACK]).await {
            log::debug!("Secondary left before acknowledgement: {}", e);
        }
    }
}

fn is_not_listening(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}
