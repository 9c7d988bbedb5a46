pub mod error;
pub mod types;
pub mod value;

pub use error::{ErrorKind, MigrationError, Result};
pub use types::{Column, Row, Schema};
pub use value::{DataType, Value};
