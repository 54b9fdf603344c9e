//! Service-directory lifecycle: who owns a directory, how a supervisor gets
//! detached from the operator's terminal, and how operators reach it.

pub mod paths;
pub mod token;
pub mod liveness;
pub mod bootstrap;
pub mod control;
pub mod command;
pub mod error;

pub use paths::ServicePaths;
pub use token::{BootstrapPhase, LaunchState, LaunchToken, STATE_ENV_KEY};
pub use liveness::{Claim, Liveness, LivenessStore, PidRecord};
pub use bootstrap::{AckPipe, Bootstrap, Resumed};
pub use control::ControlSignal;
pub use command::ServiceCommand;
pub use error::{BootstrapError, StateError};
