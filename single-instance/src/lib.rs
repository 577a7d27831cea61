//! Single instance coordination for desktop applications on Unix.
//!
//! The first process to start with a given identity takes an exclusive lock
//! and listens on a Unix socket next to it. Later launches find the lock held,
//! send their arguments and working directory over the socket and exit.
//!
//! ```no_run
//! use unix_single_instance::Config;
//! use unix_single_instance::Coordinator;
//! use unix_single_instance::HandoffMessage;
//! use unix_single_instance::Role;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::new(Config::new("org.example.MyApp"))?;
//! let message = HandoffMessage::from_current_process()?;
//! match coordinator.start(message, |m| println!("open {:?}", m.arguments)).await? {
//!     Role::Primary(primary) => {
//!         // run the application, then
//!         primary.shutdown().await?;
//!     }
//!     Role::HandedOff => std::process::exit(0),
//! }
//! # Ok(())
//! # }
//! ```
mod channel;
mod codec;
mod coordinator;
mod error;
mod identity;
mod lock;
pub use channel::*;
pub use codec::*;
pub use coordinator::*;
pub use error::*;
pub use identity::*;
pub use lock::*;
use std::io;
use std::thread::JoinHandle;

/// Runs the single instance checker on a thread of its own
///
/// - `unique_name`: Unique name to identify the instance (e.g. database path)
/// - `callback`: The callback to invoke when a secondary instance tries to
///   start (this is used in primary instance only)
///
/// Returns the serving thread in the primary instance. In a secondary instance
/// the launch is handed to the primary and `Error::AlreadyRunning` is
/// returned.
///
/// The primary serves until the process exits and is never shut down, so its
/// lock file and socket stay in the runtime directory afterwards. The next
/// launch reuses or replaces both. Use [`Coordinator`] and
/// [`PrimaryInstance::shutdown`] directly when they must be removed on exit.
pub fn only_single_instance(
    unique_name: &str,
    callback: impl Fn(HandoffMessage) + Send + Sync + 'static,
) -> Result<JoinHandle<()>, Error> {
    let coordinator = Coordinator::new(Config::new(unique_name))?;
    let message = HandoffMessage::from_current_process()?;
    let (role_sender, role) = std::sync::mpsc::channel::<Result<bool, Error>>();

    let handle = std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = role_sender.send(Err(Error::Io(e)));
                return;
            }
        };

        runtime.block_on(async move {
            match coordinator.start(message, callback).await {
                Ok(Role::Primary(_primary)) => {
                    let _ = role_sender.send(Ok(true));
                    // Keep serving for the rest of the process
                    futures::future::pending::<()>().await;
                }
                Ok(Role::HandedOff) => {
                    let _ = role_sender.send(Ok(false));
                }
                Err(e) => {
                    let _ = role_sender.send(Err(e));
                }
            }
        })
    });

    match role.recv() {
        Ok(Ok(true)) => Ok(handle),
        Ok(Ok(false)) => Err(Error::AlreadyRunning),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Io(io::Error::other(
            "single instance thread exited before deciding",
        ))),
    }
}
