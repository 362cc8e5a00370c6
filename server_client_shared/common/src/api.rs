use gcode::ProgramSummary;
use serde::{Serialize, Deserialize};

use crate::protocol::FileMeta;

pub const SOCKET: &str = "/socket";
pub const HEALTH: &str = "/api/health";
pub const GCODE: &str = "/api/gcode";
pub const INTERPRETER_SETTINGS: &str = "/api/settings/interpreter";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Health {
    pub status: String,
    pub version: String,
    pub open_ports: Vec<String>,
    pub clients: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoadedProgram {
    pub meta: FileMeta,
    /// Present once the background parse of this program has finished.
    pub summary: Option<ProgramSummary>,
}
