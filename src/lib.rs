#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod legacy;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod remote;
pub mod settings;
pub mod store;
pub mod sync;
