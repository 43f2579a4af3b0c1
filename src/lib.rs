#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod error;
pub mod locks;
pub mod logging;
pub mod manager;
pub mod model;
pub mod orchestrator;
pub mod parse;
pub mod paths;
pub mod progress;
pub mod reconcile;
pub mod runner;
pub mod script;
pub mod snapshots;
pub mod store;
pub mod util;
pub mod vbox;

#[cfg(test)]
mod testing;
