//! Small shared helpers: identifier validation and duration parsing.

pub mod duration;
pub mod ident;

pub use duration::parse_duration;
pub use ident::validate_identifier;
