pub mod progress;
pub mod retry;

pub use progress::{SpeedCalculator, format_bytes, format_speed, format_eta};
pub use retry::{BackoffPolicy, BackoffTimers};
