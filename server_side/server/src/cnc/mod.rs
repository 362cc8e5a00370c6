pub mod connection;
pub mod controller;
pub mod grbl;
pub mod machine_writer;
