pub mod anki;
pub mod cache;
pub mod compiler;
pub mod engine;
pub mod project;
pub mod scanner;

pub use crate::utils::error::Result;
