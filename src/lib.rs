pub mod audio;
pub mod config;
pub mod error;
pub mod kernel;
pub mod services;

pub use config::NarratorConfig;
pub use error::{AudioError, ConfigError, PoolError, SynthesisError};
pub use kernel::event::{PipelineEvent, SessionCommand};
pub use kernel::reactor::{Coordinator, SessionControl, SessionHandle, SessionReport};
pub use kernel::state::SessionStatus;
pub use services::synth::{SynthesisRequest, Synthesizer, VoiceParams};
