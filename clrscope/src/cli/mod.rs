//! Command-line interface for clrscope
//!
//! This module contains CLI argument parsing and configuration

pub mod args;

pub use args::{Args, Command, TargetArgs};
