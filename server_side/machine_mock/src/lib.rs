mod trivial;

pub use trivial::{recording_machine, trivial_machine};
