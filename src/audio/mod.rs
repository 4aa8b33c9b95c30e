pub mod backend;
pub mod codec;
pub mod output;

pub use backend::{AudioBackend, VirtualBackend};
pub use output::CpalBackend;
