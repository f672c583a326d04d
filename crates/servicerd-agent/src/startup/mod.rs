//! Process startup: logging and signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::shutdown_on_signal;
