pub mod api;
pub mod grbl;
pub mod protocol;
