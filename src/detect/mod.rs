mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{ReplayBackend, ScriptedBackend};
pub use registry::BackendRegistry;
pub use result::{BBox, Detection};
