pub mod cancel;
pub mod credentials;
pub mod event;
pub mod reactor;
pub mod retry;
pub mod scheduler;
pub mod segment;
pub mod segmenter;
pub mod state;
pub mod telemetry;
pub mod time;
