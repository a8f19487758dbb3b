pub mod config;
pub mod controller;
pub mod reconcilers;

pub use config::Config;
pub use controller::{run, Context};
