//! Core library: tag algebra, configuration watching, interners, image
//! canonicalization, and the scanner/merger/weighter stages.

pub mod confwatch;
pub mod error;
pub mod imaging;
pub mod interner;
pub mod merger;
pub mod scanner;
pub mod tags;
pub mod weighter;

pub use error::{Error, Result};
