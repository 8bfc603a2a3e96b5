#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod config;
pub mod diagnostics;
pub mod estimator;
pub mod history;
pub mod linear;
pub mod message;
pub mod mixture;
pub mod prepare;
pub mod solver;

pub use config::VampConfig;
pub use solver::{FitStatus, VampError, VampFit, fit_em_vamp};
