//! # tend
//!
//! Keeps one child process alive and its output on disk.
//!
//! The supervisor starts `<dir>/run`, restarts it with back-off when it
//! fails, stops it with SIGTERM escalating to SIGKILL, and forwards its
//! stdout/stderr into `<dir>/log/out` and `<dir>/log/err`. Log files can be
//! reopened in place so an external rotator can move them aside.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use detach::ServicePaths;
//! use tend::{signals, Supervisor, SupervisorContext, Tunables};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = ServicePaths::new("/srv/web")?;
//! let ctx = SupervisorContext::new(paths, Tunables::default());
//! signals::listen(ctx.handle(), ctx.shutdown.clone())?;
//!
//! let code = Supervisor::new(ctx).run().await?;
//! std::process::exit(code);
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod signals;
pub mod supervisor;

pub use config::{load_tunables, Tunables};
pub use context::{Control, ControlHandle, SupervisorContext};
pub use error::ForwardError;
pub use forwarder::{ForwardReport, Forwarder};
pub use supervisor::{restart_delay, Supervisor};
