use serde_json::Value;

use crate::cnc::controller::ControllerError;

pub const FEED_HOLD: u8 = b'!';
pub const CYCLE_START: u8 = b'~';
pub const STATUS_REPORT: u8 = b'?';
pub const SOFT_RESET: u8 = 0x18;
pub const JOG_CANCEL: u8 = 0x85;

#[derive(Debug, Clone, PartialEq)]
pub enum GrblCommand {
    /// Line commands, subject to flow control.
    Lines(Vec<String>),
    Realtime(u8),
    Reset,
    StartProgram,
    PauseProgram,
    ResumeProgram,
    StopProgram,
}

fn bad_argument(command: &str, message: impl Into<String>) -> ControllerError {
    ControllerError::BadArgument { command: command.to_string(), message: message.into() }
}

fn first_number(command: &str, args: &[Value]) -> Result<i64, ControllerError> {
    match args.first() {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => number.as_f64().map(|v| v.round() as i64).ok_or_else(|| bad_argument(command, "expected a number")),
        Some(Value::String(text)) => text.trim().parse::<i64>().map_err(|_| bad_argument(command, format!("expected a number, got {:?}", text))),
        Some(other) => Err(bad_argument(command, format!("expected a number, got {}", other))),
    }
}

// Realtime override bytes, see the Grbl 1.1 interface documentation.
fn feed_or_spindle_override(command: &str, args: &[Value], base: u8) -> Result<u8, ControllerError> {
    match first_number(command, args)? {
        0 | 100 => Ok(base),
        10 => Ok(base + 1),
        -10 => Ok(base + 2),
        1 => Ok(base + 3),
        -1 => Ok(base + 4),
        other => Err(bad_argument(command, format!("unsupported step {}", other))),
    }
}
fn rapid_override(command: &str, args: &[Value]) -> Result<u8, ControllerError> {
    match first_number(command, args)? {
        0 | 100 => Ok(0x95),
        50 => Ok(0x96),
        25 => Ok(0x97),
        other => Err(bad_argument(command, format!("unsupported rapid override {}", other))),
    }
}

fn gcode_lines(command: &str, args: &[Value]) -> Result<Vec<String>, ControllerError> {
    let text = match args.first() {
        Some(Value::String(text)) => text,
        _ => return Err(bad_argument(command, "expected g-code text")),
    };
    Ok(text.lines().map(str::trim).filter(|line| !line.is_empty()).map(str::to_string).collect())
}

pub fn parse_command(name: &str, args: &[Value]) -> Result<GrblCommand, ControllerError> {
    let command = match name {
        "gcode" => GrblCommand::Lines(gcode_lines(name, args)?),
        "homing" => GrblCommand::Lines(vec!["$H".to_string()]),
        "unlock" => GrblCommand::Lines(vec!["$X".to_string()]),
        "sleep" => GrblCommand::Lines(vec!["$SLP".to_string()]),
        "check" => GrblCommand::Lines(vec!["$C".to_string()]),
        "feedhold" => GrblCommand::Realtime(FEED_HOLD),
        "cyclestart" => GrblCommand::Realtime(CYCLE_START),
        "statusreport" => GrblCommand::Realtime(STATUS_REPORT),
        "jog:cancel" => GrblCommand::Realtime(JOG_CANCEL),
        "feedOverride" => GrblCommand::Realtime(feed_or_spindle_override(name, args, 0x90)?),
        "spindleOverride" => GrblCommand::Realtime(feed_or_spindle_override(name, args, 0x99)?),
        "rapidOverride" => GrblCommand::Realtime(rapid_override(name, args)?),
        "reset" => GrblCommand::Reset,
        "gcode:start" => GrblCommand::StartProgram,
        "gcode:pause" => GrblCommand::PauseProgram,
        "gcode:resume" => GrblCommand::ResumeProgram,
        "gcode:stop" => GrblCommand::StopProgram,
        _ => return Err(ControllerError::UnknownCommand(name.to_string())),
    };
    Ok(command)
}
