pub mod audio;
pub mod config;
pub mod error;
pub mod realtime;
pub mod session;
pub mod tools;
pub mod wake;

pub use error::{EdgeError, Result};
