pub mod config;
pub mod error;
pub mod source;

pub use config::Config;
pub use error::*;
pub use source::*;
