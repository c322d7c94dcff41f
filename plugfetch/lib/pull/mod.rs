//! The pull pipeline: handler dispatch over the descriptor DAG, progress tracking,
//! layer application, and the orchestrator tying them together.

mod apply;
mod handlers;
mod progress;
mod puller;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use apply::*;
pub use handlers::*;
pub use progress::*;
pub use puller::*;
