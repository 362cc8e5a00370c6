use std::{collections::{BTreeMap, BTreeSet}, f64::consts::TAU};

use serde::{Deserialize, Serialize};

use crate::{
    config::{InterpreterConfig, RotaryAxis},
    measure::{motion_time, EstimatedExtent},
    program::LineData,
    state::{
        axis_index, wcs_index, Coordinates, CoolantMode, CutterCompensation, DistanceMode, FeedMode,
        ModalState, MotionMode, Plane, Position, ProgramMode, SpindleMode, ToolLengthOffset, Units,
        Vector3, AXIS_COUNT, Z,
    },
    tokenize::tokenize_line,
};

const ANGLE_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComparableFloat(pub f64);
impl Eq for ComparableFloat {}
impl PartialOrd for ComparableFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ComparableFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Receives the geometry produced while interpreting. Every callback defaults to doing nothing.
pub trait GeometrySink {
    fn add_line(&mut self, _modal: &ModalState, _start: Vector3, _end: Vector3) {}
    fn add_arc_curve(&mut self, _modal: &ModalState, _arc: &ArcCurve) {}
    fn add_curve(&mut self, _modal: &ModalState, _points: &[Vector3]) {}
}

pub struct NullSink;
impl GeometrySink for NullSink {}

/// One straight, curved or arc move in work coordinates (mm, degrees for rotary axes).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    pub kind: MotionMode,
    pub start: Coordinates,
    pub end: Coordinates,
    pub center: Option<Vector3>,
    pub plane: Plane,
    pub use_curve: bool,
    pub commanded: [bool; AXIS_COUNT],
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArcCurve {
    pub start: Vector3,
    pub end: Vector3,
    pub center: Vector3,
    pub clockwise: bool,
    pub plane: Plane,
    pub points: Vec<Vector3>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArcGeometry {
    pub start_angle: f64,
    /// Negative for clockwise arcs.
    pub sweep: f64,
    pub start_radius: f64,
    pub end_radius: f64,
    pub helix: f64,
}
impl ArcGeometry {
    pub fn length(&self) -> f64 {
        let planar = self.sweep.abs() * (self.start_radius + self.end_radius) / 2.0;
        (planar * planar + self.helix * self.helix).sqrt()
    }
}

fn component(vector: &Vector3, axis: usize) -> f64 {
    match axis {
        0 => vector.x,
        1 => vector.y,
        _ => vector.z,
    }
}

fn vector_from(values: [f64; 3]) -> Vector3 {
    Vector3::new(values[0], values[1], values[2])
}

pub fn arc_geometry(motion: &Motion) -> Option<ArcGeometry> {
    let center = motion.center?;
    let (axis_0, axis_1, helix_axis) = motion.plane.axes();
    let start = (motion.start[axis_0] - component(&center, axis_0), motion.start[axis_1] - component(&center, axis_1));
    let end = (motion.end[axis_0] - component(&center, axis_0), motion.end[axis_1] - component(&center, axis_1));
    let start_angle = f64::atan2(start.1, start.0);
    let mut end_angle = f64::atan2(end.1, end.0);
    // Coinciding angles are a full turn, never an empty arc.
    if (end_angle - start_angle).abs() < ANGLE_EPSILON {
        end_angle = match motion.kind {
            MotionMode::ArcClockwise => start_angle - TAU,
            _ => start_angle + TAU,
        };
    } else {
        match motion.kind {
            MotionMode::ArcClockwise if end_angle >= start_angle => end_angle -= TAU,
            MotionMode::ArcCounterclockwise if end_angle <= start_angle => end_angle += TAU,
            _ => (),
        }
    }
    Some(ArcGeometry {
        start_angle,
        sweep: end_angle - start_angle,
        start_radius: start.0.hypot(start.1),
        end_radius: end.0.hypot(end.1),
        helix: motion.end[helix_axis] - motion.start[helix_axis],
    })
}

/// Tessellates an arc into `segments + 1` points whatever its size.
pub fn arc_curve(motion: &Motion, segments: usize) -> Option<ArcCurve> {
    let geometry = arc_geometry(motion)?;
    let center = motion.center?;
    let (axis_0, axis_1, helix_axis) = motion.plane.axes();
    let segments = segments.max(1);
    let start = Vector3::from_coordinates(&motion.start);
    let end = Vector3::from_coordinates(&motion.end);
    let points = (0..=segments).map(|step| {
        if step == 0 {
            return start;
        }
        if step == segments {
            return end;
        }
        let progress = step as f64 / segments as f64;
        let angle = geometry.start_angle + geometry.sweep * progress;
        let radius = geometry.start_radius * (1.0 - progress) + geometry.end_radius * progress;
        let mut point = [0.0; 3];
        point[axis_0] = component(&center, axis_0) + radius * angle.cos();
        point[axis_1] = component(&center, axis_1) + radius * angle.sin();
        point[helix_axis] = motion.start[helix_axis] + geometry.helix * progress;
        vector_from(point)
    }).collect();
    Some(ArcCurve {
        start,
        end,
        center,
        clockwise: motion.kind == MotionMode::ArcClockwise,
        plane: motion.plane,
        points,
    })
}

/// Samples a move while rotating each point around the wrap axis by that axis' angle.
pub fn wrap_curve(motion: &Motion, axis: RotaryAxis, segments: usize) -> Vec<Vector3> {
    let segments = segments.max(1);
    (0..=segments).map(|step| {
        let progress = step as f64 / segments as f64;
        let mut at = [0.0; AXIS_COUNT];
        for index in 0..AXIS_COUNT {
            at[index] = motion.start[index] * (1.0 - progress) + motion.end[index] * progress;
        }
        let (sin, cos) = at[axis.index()].to_radians().sin_cos();
        let (x, y, z) = (at[0], at[1], at[2]);
        match axis {
            RotaryAxis::A => Vector3::new(x, y * cos - z * sin, y * sin + z * cos),
            RotaryAxis::B => Vector3::new(x * cos + z * sin, y, -x * sin + z * cos),
            RotaryAxis::C => Vector3::new(x * cos - y * sin, x * sin + y * cos, z),
        }
    }).collect()
}

pub fn letter_bit(letter: char) -> u32 {
    if letter.is_ascii_uppercase() { 1 << (letter as u8 - b'A') } else { 0 }
}

/// Everything accumulated over a run of lines.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VmState {
    pub feedrates: BTreeSet<ComparableFloat>,
    pub tools: BTreeSet<u32>,
    pub spindle_speeds: BTreeSet<ComparableFloat>,
    /// 1-based line number to the malformed words on it.
    pub invalid_lines: BTreeMap<usize, Vec<String>>,
    pub unsupported: BTreeSet<String>,
    pub extent: EstimatedExtent,
    pub moved: [bool; AXIS_COUNT],
    /// Seconds.
    pub total_time: f64,
    pub total_lines: usize,
    pub rapid_moves: usize,
    pub feed_moves: usize,
    pub arc_moves: usize,
    /// Bit n set when the letter `'A' + n` has appeared.
    pub words_seen: u32,
}
impl VmState {
    /// Folds one line's effects in. `modal`, `feedrate` and `spindle_speed` are the values in force
    /// once the line has been read.
    pub fn apply_line(
        &mut self,
        config: &InterpreterConfig,
        line_number: usize,
        modal: &ModalState,
        feedrate: f64,
        spindle_speed: f64,
        line: &LineData,
        sink: &mut dyn GeometrySink,
    ) {
        self.total_lines += 1;
        self.words_seen |= line.words;
        if line.is_invalid() {
            self.invalid_lines.insert(line_number, line.invalid.clone());
        }
        self.unsupported.extend(line.unsupported.iter().cloned());
        if let Some(tool) = line.tool {
            self.tools.insert(tool);
        }
        if let Some(speed) = line.spindle {
            self.spindle_speeds.insert(ComparableFloat(speed));
        }
        if let Some(dwell) = line.dwell {
            self.total_time += dwell;
        }
        for motion in &line.motions {
            match motion.kind {
                MotionMode::Rapid => self.rapid_moves += 1,
                MotionMode::ArcClockwise | MotionMode::ArcCounterclockwise => self.arc_moves += 1,
                _ => self.feed_moves += 1,
            }
            if motion.kind != MotionMode::Rapid && feedrate > 0.0 {
                self.feedrates.insert(ComparableFloat(feedrate));
            }
            for (moved, commanded) in self.moved.iter_mut().zip(motion.commanded.iter()) {
                *moved |= *commanded;
            }
            self.extent.extend_to(&motion.start, &motion.commanded);
            self.extent.extend_to(&motion.end, &motion.commanded);
            self.total_time += motion_time(config, modal.feed_mode, feedrate, spindle_speed, motion);

            let mut tagged = *modal;
            tagged.motion = motion.kind;
            if motion.kind.is_arc() {
                if let Some(arc) = arc_curve(motion, config.arc_points) {
                    for point in &arc.points {
                        let mut at = motion.end;
                        at[0] = point.x;
                        at[1] = point.y;
                        at[2] = point.z;
                        self.extent.extend_to(&at, &motion.commanded);
                    }
                    sink.add_arc_curve(&tagged, &arc);
                }
            } else if let (true, Some(axis)) = (motion.use_curve, config.rotary_wrap) {
                sink.add_curve(&tagged, &wrap_curve(motion, axis, config.curve_points));
            } else {
                sink.add_line(&tagged, Vector3::from_coordinates(&motion.start), Vector3::from_coordinates(&motion.end));
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Reference {
    G28,
    G30,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum NonModal {
    Dwell,
    SetOffsets,
    GoHome(Reference),
    StoreHome(Reference),
    SetOriginOffset,
    ClearOriginOffset,
    DynamicToolOffset,
}
impl NonModal {
    fn uses_axis_words(self) -> bool {
        !matches!(self, NonModal::Dwell | NonModal::StoreHome(_) | NonModal::ClearOriginOffset)
    }
}

#[derive(Default)]
struct LineWords {
    axes: [Option<f64>; AXIS_COUNT],
    offsets: [Option<f64>; 3],
    radius: Option<f64>,
    feed: Option<f64>,
    speed: Option<f64>,
    tool: Option<f64>,
    p: Option<f64>,
    l: Option<f64>,
}
impl LineWords {
    fn has_axes(&self) -> bool {
        self.axes.iter().any(Option::is_some)
    }
    fn has_offsets(&self) -> bool {
        self.offsets.iter().any(Option::is_some)
    }
    fn commanded(&self) -> [bool; AXIS_COUNT] {
        let mut commanded = [false; AXIS_COUNT];
        for (flag, value) in commanded.iter_mut().zip(self.axes.iter()) {
            *flag = value.is_some();
        }
        commanded
    }
}

/// The modal virtual machine. Feed one line at a time through `interpret`.
pub struct Interpreter {
    config: InterpreterConfig,
    pub modal: ModalState,
    pub position: Position,
    /// Active feed rate: mm/min, mm/rev under G95, 1/min under G93.
    pub feedrate: f64,
    pub spindle_speed: f64,
    pub state: VmState,
    line_number: usize,
}
impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        Interpreter {
            config,
            modal: ModalState::default(),
            position: Position::default(),
            feedrate: 0.0,
            spindle_speed: 0.0,
            state: VmState::default(),
            line_number: 0,
        }
    }
    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }
    pub fn into_state(self) -> VmState {
        self.state
    }

    pub fn interpret(&mut self, text: &str, sink: &mut dyn GeometrySink) -> LineData {
        let tokens = tokenize_line(text);
        let mut line = LineData { invalid: tokens.invalid, ..Default::default() };
        let mut words = LineWords::default();
        let mut non_modal = None;
        let mut machine_coordinates = false;

        for word in &tokens.words {
            line.words |= letter_bit(word.letter);
            if let Some(axis) = axis_index(word.letter) {
                words.axes[axis] = Some(word.value);
                continue;
            }
            match word.letter {
                'I' => words.offsets[0] = Some(word.value),
                'J' => words.offsets[1] = Some(word.value),
                'K' => words.offsets[2] = Some(word.value),
                'R' => words.radius = Some(word.value),
                'F' => words.feed = Some(word.value),
                'S' => words.speed = Some(word.value),
                'T' => words.tool = Some(word.value),
                'P' => words.p = Some(word.value),
                'L' => words.l = Some(word.value),
                _ => (),
            }
        }

        for word in tokens.words.iter().filter(|word| word.letter == 'G') {
            let modal = &mut self.modal;
            match word.raw.as_str() {
                "0" => modal.motion = MotionMode::Rapid,
                "1" => modal.motion = MotionMode::Linear,
                "2" => modal.motion = MotionMode::ArcClockwise,
                "3" => modal.motion = MotionMode::ArcCounterclockwise,
                "38.2" | "38.3" | "38.4" | "38.5" => modal.motion = MotionMode::Probe,
                "80" => modal.motion = MotionMode::Cancel,
                "17" => modal.plane = Plane::XY,
                "18" => modal.plane = Plane::ZX,
                "19" => modal.plane = Plane::YZ,
                "90" => modal.distance = DistanceMode::Absolute,
                "91" => modal.distance = DistanceMode::Incremental,
                "90.1" => modal.arc_distance = DistanceMode::Absolute,
                "91.1" => modal.arc_distance = DistanceMode::Incremental,
                "20" => modal.units = Units::Inches,
                "21" => modal.units = Units::Millimeters,
                "93" => modal.feed_mode = FeedMode::InverseTime,
                "94" => modal.feed_mode = FeedMode::UnitsPerMinute,
                "95" => modal.feed_mode = FeedMode::UnitsPerRevolution,
                "40" => modal.cutter_compensation = CutterCompensation::Off,
                "41" => modal.cutter_compensation = CutterCompensation::Left,
                "42" => modal.cutter_compensation = CutterCompensation::Right,
                "43" => modal.tool_length_offset = ToolLengthOffset::FromTable,
                "43.1" => non_modal = Some(NonModal::DynamicToolOffset),
                "49" => {
                    modal.tool_length_offset = ToolLengthOffset::Cancel;
                    self.position.tlo = 0.0;
                }
                "4" => non_modal = Some(NonModal::Dwell),
                "10" => non_modal = Some(NonModal::SetOffsets),
                "28" => non_modal = Some(NonModal::GoHome(Reference::G28)),
                "30" => non_modal = Some(NonModal::GoHome(Reference::G30)),
                "28.1" => non_modal = Some(NonModal::StoreHome(Reference::G28)),
                "30.1" => non_modal = Some(NonModal::StoreHome(Reference::G30)),
                "92" => non_modal = Some(NonModal::SetOriginOffset),
                "92.1" => non_modal = Some(NonModal::ClearOriginOffset),
                "53" => machine_coordinates = true,
                // Exact path mode has no effect on the estimate.
                "61" => (),
                code => match wcs_index(code) {
                    Some(index) => modal.wcs = index,
                    None => line.unsupported.push(format!("G{}", code)),
                },
            }
        }
        self.position.recompute(self.modal.wcs);

        if let Some(feed) = words.feed {
            self.feedrate = match self.modal.feed_mode {
                FeedMode::InverseTime => feed.max(0.0),
                FeedMode::UnitsPerMinute => self.config.clamp_feed(self.modal.units.to_mm(feed)),
                FeedMode::UnitsPerRevolution => self.modal.units.to_mm(feed).max(0.0),
            };
        }
        if let Some(speed) = words.speed {
            self.spindle_speed = speed.max(0.0);
            line.spindle = Some(self.spindle_speed);
        }
        if let Some(tool) = words.tool {
            let tool = tool.max(0.0) as u32;
            self.modal.tool = tool;
            line.tool = Some(tool);
        }
        for word in tokens.words.iter().filter(|word| word.letter == 'M') {
            match word.raw.as_str() {
                "0" | "1" => self.modal.program = ProgramMode::Paused,
                "2" | "30" => self.end_program(),
                "3" => self.modal.spindle = SpindleMode::Clockwise,
                "4" => self.modal.spindle = SpindleMode::Counterclockwise,
                "5" => self.modal.spindle = SpindleMode::Off,
                // Tool changes only matter through the T word.
                "6" => (),
                "7" => self.modal.coolant = self.modal.coolant.with_mist(),
                "8" => self.modal.coolant = self.modal.coolant.with_flood(),
                "9" => self.modal.coolant = CoolantMode::Off,
                code => line.unsupported.push(format!("M{}", code)),
            }
        }

        let axes_consumed = match non_modal {
            Some(command) => {
                self.run_non_modal(command, &words, &mut line);
                command.uses_axis_words()
            }
            None => false,
        };
        let wants_motion = words.has_axes() || (self.modal.motion.is_arc() && words.has_offsets());
        if !axes_consumed && wants_motion && self.modal.motion != MotionMode::Cancel {
            self.run_motion(&words, machine_coordinates, &mut line);
        }

        self.line_number += 1;
        self.state.apply_line(&self.config, self.line_number, &self.modal, self.feedrate, self.spindle_speed, &line, sink);
        line
    }

    fn end_program(&mut self) {
        let modal = &mut self.modal;
        modal.program = ProgramMode::Ended;
        modal.motion = MotionMode::Linear;
        modal.plane = Plane::XY;
        modal.distance = DistanceMode::Absolute;
        modal.feed_mode = FeedMode::UnitsPerMinute;
        modal.cutter_compensation = CutterCompensation::Off;
        modal.spindle = SpindleMode::Off;
        modal.coolant = CoolantMode::Off;
        modal.wcs = 0;
        self.position.recompute(0);
    }

    fn axis_value(&self, axis: usize, value: f64) -> f64 {
        if axis <= Z { self.modal.units.to_mm(value) } else { value }
    }

    /// Work coordinate target after distance mode and units are applied.
    fn work_target(&self, axes: &[Option<f64>; AXIS_COUNT]) -> Coordinates {
        let mut target = self.position.pos;
        for (axis, value) in axes.iter().enumerate() {
            if let Some(value) = value {
                let value = self.axis_value(axis, *value);
                target[axis] = match self.modal.distance {
                    DistanceMode::Absolute => value,
                    DistanceMode::Incremental => self.position.pos[axis] + value,
                };
            }
        }
        target
    }

    fn move_to(&mut self, kind: MotionMode, end: Coordinates, commanded: [bool; AXIS_COUNT], line: &mut LineData) {
        let start = self.position.pos;
        let use_curve = matches!(kind, MotionMode::Rapid | MotionMode::Linear)
            && self.config.rotary_wrap.map_or(false, |axis| commanded[axis.index()]);
        line.motions.push(Motion {
            kind,
            start,
            end,
            center: None,
            plane: self.modal.plane,
            use_curve,
            commanded,
        });
        self.position.move_to_work(self.modal.wcs, &end);
    }

    fn run_motion(&mut self, words: &LineWords, machine_coordinates: bool, line: &mut LineData) {
        let motion = self.modal.motion;
        if machine_coordinates {
            let mut machine = self.position.mpos;
            for (axis, value) in words.axes.iter().enumerate() {
                if let Some(value) = value {
                    machine[axis] = self.axis_value(axis, *value);
                }
            }
            let offset = self.position.active_offset(self.modal.wcs);
            let mut end = machine;
            for axis in 0..AXIS_COUNT {
                end[axis] -= offset[axis];
            }
            let kind = if motion == MotionMode::Rapid { MotionMode::Rapid } else { MotionMode::Linear };
            self.move_to(kind, end, words.commanded(), line);
            return;
        }
        let end = self.work_target(&words.axes);
        if !motion.is_arc() {
            self.move_to(motion, end, words.commanded(), line);
            return;
        }

        let start = self.position.pos;
        let plane = self.modal.plane;
        let (axis_0, axis_1, _) = plane.axes();
        let mut center = [start[0], start[1], start[2]];
        if let Some(radius) = words.radius {
            let radius = self.modal.units.to_mm(radius);
            let x = end[axis_0] - start[axis_0];
            let y = end[axis_1] - start[axis_1];
            let squared = 4.0 * radius * radius - x * x - y * y;
            let chord = x.hypot(y);
            if squared < 0.0 || chord == 0.0 {
                line.invalid.push(format!("R{}", radius));
                return;
            }
            let mut h = -squared.sqrt() / chord;
            if motion == MotionMode::ArcCounterclockwise {
                h = -h;
            }
            if radius < 0.0 {
                h = -h;
            }
            center[axis_0] = start[axis_0] + 0.5 * (x - y * h);
            center[axis_1] = start[axis_1] + 0.5 * (y + x * h);
        } else if words.has_offsets() {
            for axis in [axis_0, axis_1] {
                let offset = self.modal.units.to_mm(words.offsets[axis].unwrap_or(0.0));
                center[axis] = match self.modal.arc_distance {
                    DistanceMode::Incremental => start[axis] + offset,
                    DistanceMode::Absolute => offset,
                };
            }
        } else {
            line.invalid.push(match motion {
                MotionMode::ArcClockwise => "G2".into(),
                _ => "G3".into(),
            });
            return;
        }
        let mut commanded = words.commanded();
        commanded[axis_0] = true;
        commanded[axis_1] = true;
        line.motions.push(Motion {
            kind: motion,
            start,
            end,
            center: Some(vector_from(center)),
            plane,
            use_curve: false,
            commanded,
        });
        self.position.move_to_work(self.modal.wcs, &end);
    }

    fn run_non_modal(&mut self, command: NonModal, words: &LineWords, line: &mut LineData) {
        let wcs = self.modal.wcs;
        match command {
            NonModal::Dwell => line.dwell = Some(words.p.unwrap_or(0.0).max(0.0)),
            NonModal::SetOffsets => {
                let slot = match words.p.map(|p| p.round() as i64) {
                    None | Some(0) => wcs,
                    Some(p) if (1..=9).contains(&p) => (p - 1) as usize,
                    Some(p) => {
                        line.invalid.push(format!("P{}", p));
                        return;
                    }
                };
                let level = words.l.map(|l| l.round() as i64);
                for (axis, value) in words.axes.iter().enumerate() {
                    let Some(value) = value else { continue };
                    let value = self.axis_value(axis, *value);
                    match level {
                        Some(2) => self.position.wcs[slot][axis] = value,
                        Some(20) => {
                            let tlo = if axis == Z { self.position.tlo } else { 0.0 };
                            self.position.wcs[slot][axis] = self.position.mpos[axis] - self.position.g92[axis] - tlo - value;
                        }
                        _ => (),
                    }
                }
                if !matches!(level, Some(2) | Some(20)) {
                    line.unsupported.push(format!("G10 L{}", level.unwrap_or(0)));
                }
                self.position.recompute(wcs);
            }
            NonModal::GoHome(reference) => {
                if words.has_axes() {
                    let intermediate = self.work_target(&words.axes);
                    self.move_to(MotionMode::Rapid, intermediate, words.commanded(), line);
                }
                let stored = match reference {
                    Reference::G28 => self.position.g28,
                    Reference::G30 => self.position.g30,
                };
                let mut machine = self.position.mpos;
                let mut commanded = [false; AXIS_COUNT];
                for axis in 0..AXIS_COUNT {
                    let homed = if words.has_axes() { words.axes[axis].is_some() } else { true };
                    if homed && machine[axis] != stored[axis] {
                        machine[axis] = stored[axis];
                        commanded[axis] = true;
                    }
                }
                if commanded.iter().any(|moved| *moved) {
                    let offset = self.position.active_offset(wcs);
                    let mut end = machine;
                    for axis in 0..AXIS_COUNT {
                        end[axis] -= offset[axis];
                    }
                    self.move_to(MotionMode::Rapid, end, commanded, line);
                }
            }
            NonModal::StoreHome(Reference::G28) => self.position.g28 = self.position.mpos,
            NonModal::StoreHome(Reference::G30) => self.position.g30 = self.position.mpos,
            NonModal::SetOriginOffset => {
                for (axis, value) in words.axes.iter().enumerate() {
                    let Some(value) = value else { continue };
                    let value = self.axis_value(axis, *value);
                    let tlo = if axis == Z { self.position.tlo } else { 0.0 };
                    self.position.g92[axis] = self.position.mpos[axis] - self.position.wcs[wcs][axis] - tlo - value;
                }
                self.position.recompute(wcs);
            }
            NonModal::ClearOriginOffset => {
                self.position.g92 = [0.0; AXIS_COUNT];
                self.position.recompute(wcs);
            }
            NonModal::DynamicToolOffset => {
                self.modal.tool_length_offset = ToolLengthOffset::Dynamic;
                self.position.tlo = self.axis_value(Z, words.axes[Z].unwrap_or(0.0));
                self.position.recompute(wcs);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    #[derive(Debug, PartialEq)]
    pub enum Segment {
        Line(MotionMode, Vector3, Vector3),
        Arc(MotionMode, ArcCurve),
        Curve(MotionMode, Vec<Vector3>),
    }

    #[derive(Default)]
    pub struct SegmentRecorder(pub Vec<Segment>);
    impl GeometrySink for SegmentRecorder {
        fn add_line(&mut self, modal: &ModalState, start: Vector3, end: Vector3) {
            self.0.push(Segment::Line(modal.motion, start, end));
        }
        fn add_arc_curve(&mut self, modal: &ModalState, arc: &ArcCurve) {
            self.0.push(Segment::Arc(modal.motion, arc.clone()));
        }
        fn add_curve(&mut self, modal: &ModalState, points: &[Vector3]) {
            self.0.push(Segment::Curve(modal.motion, points.to_vec()));
        }
    }

    fn run(lines: &[&str]) -> (Interpreter, SegmentRecorder) {
        let mut interpreter = Interpreter::new(InterpreterConfig::default());
        let mut recorder = SegmentRecorder::default();
        for line in lines {
            interpreter.interpret(line, &mut recorder);
        }
        (interpreter, recorder)
    }

    fn close(a: Vector3, b: Vector3) -> bool {
        (a.x - b.x).abs() < 1e-9 && (a.y - b.y).abs() < 1e-9 && (a.z - b.z).abs() < 1e-9
    }

    #[test]
    fn test_rapid_then_linear() {
        let (interpreter, recorder) = run(&["G0 X10 Y10", "G1 X20 Y10 F500"]);
        assert_eq!(recorder.0, vec![
            Segment::Line(MotionMode::Rapid, Vector3::new(0.0, 0.0, 0.0), Vector3::new(10.0, 10.0, 0.0)),
            Segment::Line(MotionMode::Linear, Vector3::new(10.0, 10.0, 0.0), Vector3::new(20.0, 10.0, 0.0)),
        ]);
        let mut feed_only = Interpreter::new(InterpreterConfig::default());
        feed_only.position.move_to_work(0, &[10.0, 10.0, 0.0, 0.0, 0.0, 0.0]);
        feed_only.interpret("G1 X20 Y10 F500", &mut NullSink);
        assert!(feed_only.state.total_time > 1.2);
        assert!(interpreter.state.total_time > feed_only.state.total_time);
        assert_eq!(interpreter.state.feedrates.iter().map(|f| f.0).collect::<Vec<_>>(), vec![500.0]);
        assert_eq!(interpreter.state.extent.bounds[0], Some((0.0, 20.0)));
        assert_eq!(interpreter.state.extent.bounds[2], None);
        assert_eq!(interpreter.state.moved, [true, true, false, false, false, false]);
    }

    #[test]
    fn test_clockwise_semicircle() {
        let (_, recorder) = run(&["G2 X10 Y0 I5 J0"]);
        let Segment::Arc(mode, arc) = &recorder.0[0] else { panic!("expected an arc") };
        assert_eq!(*mode, MotionMode::ArcClockwise);
        assert!(arc.clockwise);
        assert_eq!(arc.points.len(), 33);
        assert!(close(arc.points[0], Vector3::new(0.0, 0.0, 0.0)));
        assert!(close(arc.points[32], Vector3::new(10.0, 0.0, 0.0)));
        assert!(close(arc.points[16], Vector3::new(5.0, 5.0, 0.0)));
        for point in &arc.points {
            assert!(((point.x - 5.0).hypot(point.y) - 5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_equal_angles_make_a_full_circle() {
        let (interpreter, recorder) = run(&["G3 I5"]);
        let Segment::Arc(_, arc) = &recorder.0[0] else { panic!("expected an arc") };
        assert_eq!(arc.points.len(), 33);
        assert!(close(arc.points[16], Vector3::new(10.0, 0.0, 0.0)));
        assert!(close(arc.points[8], Vector3::new(5.0, -5.0, 0.0)));
        assert_eq!(interpreter.state.extent.bounds[0], Some((0.0, 10.0)));
        let bounds_y = interpreter.state.extent.bounds[1].unwrap();
        assert!((bounds_y.0 + 5.0).abs() < 1e-9 && (bounds_y.1 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_radius_arc_matches_offset_arc() {
        let (_, by_radius) = run(&["G2 X10 Y0 R5"]);
        let (_, by_offset) = run(&["G2 X10 Y0 I5"]);
        let (Segment::Arc(_, a), Segment::Arc(_, b)) = (&by_radius.0[0], &by_offset.0[0]) else { panic!("expected arcs") };
        assert!(close(a.center, b.center));
        assert!(a.points.iter().zip(b.points.iter()).all(|(a, b)| close(*a, *b)));
    }

    #[test]
    fn test_negative_radius_takes_long_arc() {
        let (_, recorder) = run(&["G2 X5 Y5 R-5"]);
        let Segment::Arc(_, arc) = &recorder.0[0] else { panic!("expected an arc") };
        assert!(close(arc.center, Vector3::new(0.0, 5.0, 0.0)));
    }

    #[test]
    fn test_arc_without_center_is_invalid() {
        let (interpreter, recorder) = run(&["G2 X10"]);
        assert!(recorder.0.is_empty());
        assert_eq!(interpreter.state.invalid_lines.get(&1), Some(&vec!["G2".to_string()]));
    }

    #[test]
    fn test_inches_and_incremental() {
        let (interpreter, _) = run(&["G20 G91", "G1 X1 F10", "X1"]);
        assert!((interpreter.position.pos[0] - 50.8).abs() < 1e-9);
        assert!((interpreter.feedrate - 254.0).abs() < 1e-9);
    }

    #[test]
    fn test_dwell_adds_time_only() {
        let (interpreter, recorder) = run(&["G4 P2.5"]);
        assert!(recorder.0.is_empty());
        assert_eq!(interpreter.state.total_time, 2.5);
        assert_eq!(interpreter.modal.motion, MotionMode::Rapid);
    }

    #[test]
    fn test_work_offsets() {
        let (interpreter, recorder) = run(&["G10 L2 P2 X10", "G55 G0 X0", "G53 G0 X0", "G92 X5", "G0 X6"]);
        assert_eq!(interpreter.modal.wcs, 1);
        assert_eq!(recorder.0.len(), 3);
        // G55 X0 lands on machine X10 so work X stays 0.
        assert!(close(match &recorder.0[0] { Segment::Line(_, _, end) => *end, _ => panic!() }, Vector3::new(0.0, 0.0, 0.0)));
        // G53 X0 is machine zero, work X -10.
        assert!(close(match &recorder.0[1] { Segment::Line(_, _, end) => *end, _ => panic!() }, Vector3::new(-10.0, 0.0, 0.0)));
        assert!((interpreter.position.mpos[0] - 1.0).abs() < 1e-9);
        assert!((interpreter.position.pos[0] - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_return_home_through_intermediate() {
        let (interpreter, recorder) = run(&["G0 X10 Y10", "G28.1", "G0 X0 Y0 Z5", "G28 Z10"]);
        assert_eq!(recorder.0.len(), 4);
        assert_eq!(interpreter.position.mpos[..3], [0.0, 0.0, 0.0]);
        assert_eq!(interpreter.state.rapid_moves, 4);
    }

    #[test]
    fn test_feed_is_clamped() {
        let (interpreter, _) = run(&["G1 X1 F100000"]);
        assert_eq!(interpreter.feedrate, 5000.0);
        let (interpreter, _) = run(&["G1 X1 F0"]);
        assert_eq!(interpreter.feedrate, 1.0);
    }

    #[test]
    fn test_unsupported_and_invalid_are_recorded() {
        let (interpreter, recorder) = run(&["G1 X1.2.3 Y2 F100", "G5 M98", "G64 X1"]);
        assert_eq!(recorder.0.len(), 2);
        assert_eq!(interpreter.state.invalid_lines.get(&1), Some(&vec!["X1.2.3".to_string()]));
        let unsupported: Vec<_> = interpreter.state.unsupported.iter().cloned().collect();
        assert_eq!(unsupported, vec!["G5", "G64", "M98"]);
        assert_eq!(interpreter.state.extent.bounds[0], Some((0.0, 1.0)));
    }

    #[test]
    fn test_usage_sets() {
        let (interpreter, _) = run(&["T2 M6", "S1000 M3", "G1 X5 F300", "S12000", "T1", "G1 X6 F300"]);
        assert_eq!(interpreter.state.tools.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(interpreter.state.spindle_speeds.iter().map(|s| s.0).collect::<Vec<_>>(), vec![1000.0, 12000.0]);
        assert_eq!(interpreter.state.feedrates.len(), 1);
        assert_eq!(interpreter.modal.spindle, SpindleMode::Clockwise);
        assert_eq!(interpreter.modal.tool, 1);
    }

    #[test]
    fn test_program_end_resets_modes() {
        let (interpreter, _) = run(&["G91 G18 G55 M3 M8", "M30"]);
        assert_eq!(interpreter.modal.program, ProgramMode::Ended);
        assert_eq!(interpreter.modal.distance, DistanceMode::Absolute);
        assert_eq!(interpreter.modal.plane, Plane::XY);
        assert_eq!(interpreter.modal.wcs, 0);
        assert_eq!(interpreter.modal.spindle, SpindleMode::Off);
        assert_eq!(interpreter.modal.coolant, CoolantMode::Off);
    }

    #[test]
    fn test_rotary_wrap_emits_curve() {
        let mut interpreter = Interpreter::new(InterpreterConfig {
            rotary_wrap: Some(RotaryAxis::A),
            curve_points: 4,
            ..Default::default()
        });
        let mut recorder = SegmentRecorder::default();
        interpreter.interpret("G0 Y10", &mut recorder);
        let line = interpreter.interpret("G1 A90 F1000", &mut recorder);
        assert!(line.motions[0].use_curve);
        let Segment::Curve(mode, points) = &recorder.0[1] else { panic!("expected a curve") };
        assert_eq!(*mode, MotionMode::Linear);
        assert_eq!(points.len(), 5);
        assert!(close(points[0], Vector3::new(0.0, 10.0, 0.0)));
        assert!(close(points[4], Vector3::new(0.0, 0.0, 10.0)));
        assert!(interpreter.state.total_time > 0.0);
    }

    #[test]
    fn test_inverse_time_duration() {
        let (interpreter, _) = run(&["G93 G1 X10 F2"]);
        assert!((interpreter.state.total_time - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_words_seen() {
        let (interpreter, _) = run(&["G0 X1", "M5"]);
        let expected = letter_bit('G') | letter_bit('X') | letter_bit('M');
        assert_eq!(interpreter.state.words_seen, expected);
    }
}
