// Job and queue types
mod job;
pub use job::*;

// Event stream types
mod event;
pub use event::*;

// Preset types
mod preset;
pub use preset::*;

// Probe metadata types
mod probe;
pub use probe::*;
