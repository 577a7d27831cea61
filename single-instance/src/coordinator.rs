use crate::Connection;
use crate::Endpoint;
use crate::Error;
use crate::HandoffMessage;
use crate::InstanceIdentity;
use crate::LockAttempt;
use crate::LockHandle;
use crate::LockState;
use crate::codec;
use crate::identity::default_runtime_dir;
use futures::StreamExt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
pub const DEFAULT_STALE_LOCK_GRACE: Duration = Duration::from_millis(1000);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct Config {
    /// Application scoped name, e.g. a bundle identifier or a database path
    pub identity: String,
    /// How long a secondary tries to reach the primary. Also bounds how long
    /// the primary waits for a single secondary to send its payload.
    pub connect_timeout: Duration,
    /// How long a busy lock with a dead recorded owner is watched before it
    /// is reclaimed
    pub stale_lock_grace: Duration,
    /// How long shutdown waits for in-flight handoffs
    pub drain_timeout: Duration,
    /// Directory for the lock file and socket, defaults to
    /// `$XDG_RUNTIME_DIR` or the temp dir
    pub runtime_dir: Option<PathBuf>,
}

impl Config {
    pub fn new(identity: impl Into<String>) -> Self {
        Config {
            identity: identity.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stale_lock_grace: DEFAULT_STALE_LOCK_GRACE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            runtime_dir: None,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn stale_lock_grace(mut self, grace: Duration) -> Self {
        self.stale_lock_grace = grace;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }
}

/// Outcome of [`Coordinator::start`]
#[derive(Debug)]
pub enum Role {
    /// This process owns the identity and serves handoffs until the
    /// [`PrimaryInstance`] is shut down or dropped
    Primary(PrimaryInstance),
    /// The launch was delivered to the primary, this process should exit
    HandedOff,
}

pub struct Coordinator {
    config: Config,
    identity: InstanceIdentity,
    runtime_dir: PathBuf,
}

impl Coordinator {
    pub fn new(config: Config) -> Result<Self, Error> {
        let identity = InstanceIdentity::new(config.identity.clone())?;
        let runtime_dir = config
            .runtime_dir
            .clone()
            .unwrap_or_else(default_runtime_dir);
        Ok(Coordinator {
            config,
            identity,
            runtime_dir,
        })
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn lock_path(&self) -> PathBuf {
        self.identity.lock_path(&self.runtime_dir)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.identity.socket_path(&self.runtime_dir)
    }

    /// Become the primary instance, or hand `message` over to the running
    /// one.
    ///
    /// - `message`: Launch context to deliver when another instance is
    ///   running, usually [`HandoffMessage::from_current_process`]
    /// - `on_handoff`: Called in the primary for every message a secondary
    ///   delivers, in the order the connections were accepted. It runs on the
    ///   serve loop and should return quickly (e.g. forward to a channel).
    pub async fn start<F>(&self, message: HandoffMessage, on_handoff: F) -> Result<Role, Error>
    where
        F: Fn(HandoffMessage) + Send + Sync + 'static,
    {
        std::fs::create_dir_all(&self.runtime_dir).map_err(Error::LockIo)?;

        match self.acquire().await? {
            LockAttempt::Acquired(lock) => return self.become_primary(lock, on_handoff),
            LockAttempt::AlreadyHeld(owner) => {
                log::debug!(
                    "Instance {:?} is held by {:?}, handing off",
                    self.identity.name(),
                    owner
                );
            }
        }

        match self.hand_off(&message).await {
            Ok(()) => return Ok(Role::HandedOff),
            Err(Error::ChannelConnectTimeout(timeout)) => {
                log::warn!(
                    "Primary did not answer within {}ms, checking whether it is still alive",
                    timeout.as_millis()
                );
            }
            Err(Error::ChannelClosed) => {
                log::warn!("Primary went away during handoff, checking whether it is still alive");
            }
            Err(e) => return Err(e),
        }

        match self.acquire().await? {
            LockAttempt::Acquired(lock) => {
                log::info!("Reclaimed instance {:?}", self.identity.name());
                self.become_primary(lock, on_handoff)
            }
            LockAttempt::AlreadyHeld(_) => {
                self.hand_off(&message).await?;
                Ok(Role::HandedOff)
            }
        }
    }

    async fn acquire(&self) -> Result<LockAttempt, Error> {
        let path = self.lock_path();
        let grace = self.config.stale_lock_grace;
        tokio::task::spawn_blocking(move || LockHandle::try_acquire(&path, grace))
            .await
            .map_err(|e| Error::LockIo(io::Error::other(e)))?
    }

    fn become_primary<F>(&self, lock: LockHandle, on_handoff: F) -> Result<Role, Error>
    where
        F: Fn(HandoffMessage) + Send + Sync + 'static,
    {
        // On failure the lock is dropped and released with it
        let endpoint = Endpoint::listen(&self.socket_path())?;
        log::info!(
            "Primary instance for {:?} listening on {:?}",
            self.identity.name(),
            endpoint.path()
        );

        let socket_path = endpoint.path().to_path_buf();
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let serve_task = tokio::spawn(serve(
            endpoint,
            on_handoff,
            self.config.connect_timeout,
            self.config.drain_timeout,
            shutdown_receiver,
        ));

        Ok(Role::Primary(PrimaryInstance {
            lock,
            socket_path,
            shutdown_sender,
            serve_task: Some(serve_task),
        }))
    }

    async fn hand_off(&self, message: &HandoffMessage) -> Result<(), Error> {
        let payload = codec::encode(message)?;
        let mut connection =
            Connection::connect(&self.socket_path(), self.config.connect_timeout).await?;
        let acknowledged = connection
            .send(&payload, self.config.connect_timeout)
            .await?;
        log::info!(
            "Handed off {} argument(s) to the primary instance (acknowledged: {})",
            message.arguments.len(),
            acknowledged
        );
        Ok(())
    }
}

/// Ownership of the instance identity, held by the primary process.
///
/// Dropping it stops the serve loop and releases the lock immediately, use
/// [`PrimaryInstance::shutdown`] to let in-flight handoffs finish first.
#[derive(Debug)]
pub struct PrimaryInstance {
    lock: LockHandle,
    socket_path: PathBuf,
    shutdown_sender: watch::Sender<bool>,
    serve_task: Option<JoinHandle<()>>,
}

impl PrimaryInstance {
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, wait for in-flight handoffs up to the drain timeout,
    /// then remove the socket and release the lock
    pub async fn shutdown(mut self) -> Result<(), Error> {
        let _ = self.shutdown_sender.send(true);
        if let Some(task) = self.serve_task.take() {
            if let Err(e) = task.await {
                log::warn!("Serve loop ended abnormally: {}", e);
            }
        }
        self.lock.release()
    }
}

impl Drop for PrimaryInstance {
    fn drop(&mut self) {
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
    }
}

async fn serve<F>(
    endpoint: Endpoint,
    on_handoff: F,
    read_timeout: Duration,
    drain_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fn(HandoffMessage) + Send + Sync + 'static,
{
    // Readers run concurrently, the dispatcher delivers in accept order
    let (queue, mut pending) = mpsc::unbounded_channel::<oneshot::Receiver<HandoffMessage>>();
    let dispatcher = tokio::spawn(async move {
        while let Some(next) = pending.recv().await {
            // A dropped sender means the payload was rejected
            let Ok(message) = next.await else {
                continue;
            };
            if std::panic::catch_unwind(AssertUnwindSafe(|| on_handoff(message))).is_err() {
                log::error!("Handoff callback panicked, continuing");
            }
        }
    });

    let mut readers = JoinSet::new();
    {
        let incoming = endpoint.incoming();
        futures::pin_mut!(incoming);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(accepted) = incoming.next() => match accepted {
                    Ok(connection) => {
                        let (delivery, delivered) = oneshot::channel();
                        let _ = queue.send(delivered);
                        readers.spawn(receive(connection, delivery, read_timeout));
                    }
                    Err(e) => {
                        log::warn!("Accepting handoff connection failed: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(_) = readers.join_next(), if !readers.is_empty() => {}
            }
        }
    }

    log::debug!("Serve loop stopping, {} handoff(s) in flight", readers.len());
    drop(endpoint);

    let drained = tokio::time::timeout(drain_timeout, async {
        while readers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        log::warn!(
            "Dropping {} handoff(s) still in flight after {}ms",
            readers.len(),
            drain_timeout.as_millis()
        );
        readers.abort_all();
        while readers.join_next().await.is_some() {}
    }

    drop(queue);
    let _ = dispatcher.await;
    log::debug!("Serve loop stopped");
}

async fn receive(
    mut connection: Connection,
    delivery: oneshot::Sender<HandoffMessage>,
    read_timeout: Duration,
) {
    let payload = match tokio::time::timeout(read_timeout, connection.read_payload()).await {
        Ok(Ok(payload)) => payload,
        Ok(Err(e)) => {
            log::warn!("Reading handoff failed: {}", e);
            return;
        }
        Err(_) => {
            log::warn!(
                "Secondary sent nothing within {}ms, dropping connection",
                read_timeout.as_millis()
            );
            return;
        }
    };

    match codec::decode(&payload) {
        Ok(message) => {
            log::debug!("Received handoff: {:?}", message);
            let _ = delivery.send(message);
            connection.acknowledge().await;
        }
        Err(e) => log::warn!("Dropping handoff: {}", e),
    }
}
