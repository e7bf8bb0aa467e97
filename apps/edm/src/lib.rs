//! # edm
//!
//! Command-line front end of the EDM engine: argument parsing, the
//! configuration file, and the commands that drive [`edm_core::Edm`].

pub mod cli;
pub mod config;
