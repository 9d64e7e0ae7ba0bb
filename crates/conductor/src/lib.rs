//! Manager-side message dispatch (C7), fixed-rate loops (C8), and the
//! top-level session assembly (C9).

pub mod conductor;
pub mod handler;
pub mod loops;

pub use conductor::{Conductor, ConductorConfig, StateLogSink};
pub use handler::{HandlerDeps, MessageHandler};
