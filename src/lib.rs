pub mod error;
pub mod ops;
pub mod shell;

pub use error::{Result, ShellError};
