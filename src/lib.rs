pub mod config;
pub mod core;
pub mod distributions;
pub mod error;
pub mod gibbs;
pub mod harmonize;
pub mod io;
pub mod orchestrate;
pub mod stats;

pub use error::{CsxError, Result};
