//! Health of the worker: broker connection and job queue saturation.

mod check;
mod checker;

pub use check::*;
pub use checker::*;
