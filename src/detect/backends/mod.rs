pub mod replay;
pub mod scripted;

pub use replay::ReplayBackend;
pub use scripted::ScriptedBackend;
