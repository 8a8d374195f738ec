//! Agent node liveness and shutdown.

pub mod lease;
pub mod shutdown;

pub use lease::LeaseManager;
pub use shutdown::{
    HttpShutdownNotifier, ProcessController, ShutdownNotifier, ShutdownOutcome, ShutdownProtocol,
    ShutdownStage, ShutdownTimeouts,
};
