//! Job execution: the dispatcher claims pending jobs and hands each one
//! to a worker that runs the full build pipeline.

mod dispatcher;
mod worker;

pub use dispatcher::Dispatcher;
pub use worker::{Worker, WorkerDeps};
