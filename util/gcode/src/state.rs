use serde::{Deserialize, Serialize};

pub const AXIS_COUNT: usize = 6;
pub const AXIS_LETTERS: [char; AXIS_COUNT] = ['X', 'Y', 'Z', 'A', 'B', 'C'];
pub const X: usize = 0;
pub const Y: usize = 1;
pub const Z: usize = 2;

pub type Coordinates = [f64; AXIS_COUNT];

pub fn axis_index(letter: char) -> Option<usize> {
    AXIS_LETTERS.iter().position(|axis| *axis == letter)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, derive_more::Add, derive_more::Sub, derive_more::Mul)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}
impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vector3 { x, y, z }
    }
    pub fn from_coordinates(coordinates: &Coordinates) -> Self {
        Vector3 { x: coordinates[X], y: coordinates[Y], z: coordinates[Z] }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionMode {
    Rapid,
    Linear,
    ArcClockwise,
    ArcCounterclockwise,
    Probe,
    Cancel,
}
impl MotionMode {
    pub fn is_arc(self) -> bool {
        matches!(self, MotionMode::ArcClockwise | MotionMode::ArcCounterclockwise)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plane {
    XY,
    ZX,
    YZ,
}
impl Plane {
    /// The two in-plane axes (in rotation order) and the helical axis.
    pub fn axes(self) -> (usize, usize, usize) {
        match self {
            Plane::XY => (X, Y, Z),
            Plane::ZX => (Z, X, Y),
            Plane::YZ => (Y, Z, X),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMode {
    Absolute,
    Incremental,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    Millimeters,
    Inches,
}
impl Units {
    pub fn to_mm(self, value: f64) -> f64 {
        match self {
            Units::Millimeters => value,
            Units::Inches => value * 25.4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMode {
    InverseTime,
    UnitsPerMinute,
    UnitsPerRevolution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpindleMode {
    Clockwise,
    Counterclockwise,
    Off,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoolantMode {
    Off,
    Mist,
    Flood,
    MistAndFlood,
}
impl CoolantMode {
    pub fn with_mist(self) -> Self {
        match self {
            CoolantMode::Off | CoolantMode::Mist => CoolantMode::Mist,
            CoolantMode::Flood | CoolantMode::MistAndFlood => CoolantMode::MistAndFlood,
        }
    }
    pub fn with_flood(self) -> Self {
        match self {
            CoolantMode::Off | CoolantMode::Flood => CoolantMode::Flood,
            CoolantMode::Mist | CoolantMode::MistAndFlood => CoolantMode::MistAndFlood,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CutterCompensation {
    Off,
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolLengthOffset {
    Cancel,
    Dynamic,
    FromTable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramMode {
    Running,
    Paused,
    Ended,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModalState {
    pub motion: MotionMode,
    pub plane: Plane,
    pub distance: DistanceMode,
    pub arc_distance: DistanceMode,
    pub units: Units,
    pub feed_mode: FeedMode,
    pub spindle: SpindleMode,
    pub coolant: CoolantMode,
    pub cutter_compensation: CutterCompensation,
    pub tool_length_offset: ToolLengthOffset,
    pub program: ProgramMode,
    /// 0 for G54 up to 8 for G59.3.
    pub wcs: usize,
    pub tool: u32,
}
impl Default for ModalState {
    fn default() -> Self {
        ModalState {
            motion: MotionMode::Rapid,
            plane: Plane::XY,
            distance: DistanceMode::Absolute,
            arc_distance: DistanceMode::Incremental,
            units: Units::Millimeters,
            feed_mode: FeedMode::UnitsPerMinute,
            spindle: SpindleMode::Off,
            coolant: CoolantMode::Off,
            cutter_compensation: CutterCompensation::Off,
            tool_length_offset: ToolLengthOffset::Cancel,
            program: ProgramMode::Running,
            wcs: 0,
            tool: 0,
        }
    }
}

pub const WCS_CODES: [&str; 9] = ["54", "55", "56", "57", "58", "59", "59.1", "59.2", "59.3"];

pub fn wcs_index(code: &str) -> Option<usize> {
    WCS_CODES.iter().position(|wcs| *wcs == code)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub mpos: Coordinates,
    pub pos: Coordinates,
    pub wcs: [Coordinates; 9],
    pub g92: Coordinates,
    pub tlo: f64,
    pub g28: Coordinates,
    pub g30: Coordinates,
}
impl Default for Position {
    fn default() -> Self {
        Position {
            mpos: [0.0; AXIS_COUNT],
            pos: [0.0; AXIS_COUNT],
            wcs: [[0.0; AXIS_COUNT]; 9],
            g92: [0.0; AXIS_COUNT],
            tlo: 0.0,
            g28: [0.0; AXIS_COUNT],
            g30: [0.0; AXIS_COUNT],
        }
    }
}
impl Position {
    pub fn active_offset(&self, wcs: usize) -> Coordinates {
        let mut offset = [0.0; AXIS_COUNT];
        for (axis, value) in offset.iter_mut().enumerate() {
            *value = self.wcs[wcs][axis] + self.g92[axis];
        }
        offset[Z] += self.tlo;
        offset
    }
    pub fn recompute(&mut self, wcs: usize) {
        let offset = self.active_offset(wcs);
        for axis in 0..AXIS_COUNT {
            self.pos[axis] = self.mpos[axis] - offset[axis];
        }
    }
    pub fn to_machine(&self, wcs: usize, work: &Coordinates) -> Coordinates {
        let offset = self.active_offset(wcs);
        let mut machine = *work;
        for axis in 0..AXIS_COUNT {
            machine[axis] += offset[axis];
        }
        machine
    }
    pub fn move_to_work(&mut self, wcs: usize, work: &Coordinates) {
        self.mpos = self.to_machine(wcs, work);
        self.recompute(wcs);
    }
}
