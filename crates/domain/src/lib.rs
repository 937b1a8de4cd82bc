pub mod config;
pub mod error;
pub mod session;

pub use error::{Error, Result};
pub use session::{
    duration_minutes, CleanupReport, ConfigSnapshot, Session, SessionStatus, StepOutcome,
};
