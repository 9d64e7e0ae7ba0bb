//! Vehicle-side control pipeline: command conversion (C10), velocity sink
//! adapter (C11), and the command subscriber plus watchdog (C12).

pub mod converter;
pub mod sink;
pub mod subscriber;

pub use converter::{Converter, ConverterConfig, RawIntent};
pub use sink::{LoggingVelocitySink, RosCmdVelSink, VelocitySink};
pub use subscriber::CommandSubscriber;
