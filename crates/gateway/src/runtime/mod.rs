pub mod lifecycle;
pub mod log_sink;
pub mod pool;
pub mod registry;
pub mod session_lock;
pub mod spawn;
pub mod sweeper;
