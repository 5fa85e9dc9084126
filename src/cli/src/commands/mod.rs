//! shopctl subcommands.

pub mod config;
pub mod health;
pub mod publish;
pub mod queues;
