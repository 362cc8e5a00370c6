use serde::{Deserialize, Serialize};

use crate::{
    changelog::{tagged_changes, ChangeLog, LoggedChange},
    config::InterpreterConfig,
    measure::AxisBounds,
    state::{ModalState, AXIS_COUNT, AXIS_LETTERS},
    vm::{GeometrySink, Interpreter, Motion, NullSink, VmState},
};

/// What one line did, enough to rebuild its statistics and geometry without the text.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LineData {
    /// Usually zero or one; G28/G30 through an intermediate point yield two.
    pub motions: Vec<Motion>,
    /// Seconds.
    pub dwell: Option<f64>,
    pub tool: Option<u32>,
    pub spindle: Option<f64>,
    pub invalid: Vec<String>,
    pub unsupported: Vec<String>,
    pub words: u32,
}
impl LineData {
    pub fn is_invalid(&self) -> bool {
        !self.invalid.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidLine {
    pub line: usize,
    pub words: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramSummary {
    pub total_lines: usize,
    /// Seconds.
    pub total_time: f64,
    pub bounds: Vec<AxisBounds>,
    pub moved_axes: Vec<char>,
    pub feedrates: Vec<f64>,
    pub spindle_speeds: Vec<f64>,
    pub tools: Vec<u32>,
    pub invalid_lines: Vec<InvalidLine>,
    pub unsupported: Vec<String>,
    pub rapid_moves: usize,
    pub feed_moves: usize,
    pub arc_moves: usize,
}
impl From<&VmState> for ProgramSummary {
    fn from(state: &VmState) -> Self {
        ProgramSummary {
            total_lines: state.total_lines,
            total_time: state.total_time,
            bounds: state.extent.axis_bounds(),
            moved_axes: (0..AXIS_COUNT).filter(|axis| state.moved[*axis]).map(|axis| AXIS_LETTERS[axis]).collect(),
            feedrates: state.feedrates.iter().map(|feed| feed.0).collect(),
            spindle_speeds: state.spindle_speeds.iter().map(|speed| speed.0).collect(),
            tools: state.tools.iter().copied().collect(),
            invalid_lines: state.invalid_lines.iter().map(|(line, words)| InvalidLine { line: *line, words: words.clone() }).collect(),
            unsupported: state.unsupported.iter().cloned().collect(),
            rapid_moves: state.rapid_moves,
            feed_moves: state.feed_moves,
            arc_moves: state.arc_moves,
        }
    }
}

/// A program interpreted once, kept so it can be replayed cheaply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedProgram {
    pub lines: Vec<LineData>,
    pub modal_log: ChangeLog<ModalState>,
    pub feedrate_log: ChangeLog<f64>,
    pub summary: ProgramSummary,
}
impl ParsedProgram {
    /// `progress` receives the completed percentage each time it increases.
    pub fn parse<P: FnMut(u8)>(text: &str, config: &InterpreterConfig, sink: &mut dyn GeometrySink, mut progress: P) -> Self {
        let total = text.lines().count();
        let mut interpreter = Interpreter::new(config.clone());
        let mut program = ParsedProgram {
            lines: Vec::with_capacity(total),
            ..Default::default()
        };
        let mut reported = 0u8;
        for (index, line) in text.lines().enumerate() {
            let data = interpreter.interpret(line, sink);
            program.modal_log.record(&interpreter.modal);
            program.feedrate_log.record(&interpreter.feedrate);
            program.lines.push(data);
            let percent = ((index + 1) * 100 / total.max(1)) as u8;
            if percent > reported {
                reported = percent;
                progress(percent);
            }
        }
        program.summary = ProgramSummary::from(&interpreter.into_state());
        program
    }

    pub fn parse_quiet(text: &str, config: &InterpreterConfig) -> Self {
        Self::parse(text, config, &mut NullSink, |_| ())
    }

    /// Rebuilds the interpreter statistics from the stored lines and logs, emitting the same geometry.
    pub fn replay(&self, config: &InterpreterConfig, sink: &mut dyn GeometrySink) -> VmState {
        let mut state = VmState::default();
        let mut spindle_speed = 0.0;
        let steps = self.lines.iter().zip(self.modal_log.values()).zip(self.feedrate_log.values());
        for (index, ((line, modal), feedrate)) in steps.enumerate() {
            if let Some(speed) = line.spindle {
                spindle_speed = speed;
            }
            state.apply_line(config, index + 1, modal, *feedrate, spindle_speed, line, sink);
        }
        state
    }

    pub fn changes(&self) -> Vec<LoggedChange> {
        tagged_changes(&self.modal_log, &self.feedrate_log)
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::vm::test::SegmentRecorder;

    const PROGRAM: &str = "%
(facing pass)
G21 G90 G17
G0 Z5
T1 M6
S10000 M3
G0 X0 Y0
G1 Z-1 F200
G1 X40 F800
G2 X40 Y20 R10
G1 X0
G3 X0 Y0 I0 J-10
G91 G1 X5 Y5
G90 G4 P0.5
G1 X1.2.3 Y4
G0 Z5
M30
%";

    #[test]
    fn test_logs_cover_every_line() {
        let program = ParsedProgram::parse_quiet(PROGRAM, &InterpreterConfig::default());
        let lines = PROGRAM.lines().count();
        assert_eq!(program.lines.len(), lines);
        assert_eq!(program.modal_log.total(), lines);
        assert_eq!(program.feedrate_log.total(), lines);
        assert_eq!(program.summary.total_lines, lines);
        assert_eq!(program.summary.feedrates, vec![200.0, 800.0]);
        assert_eq!(program.summary.tools, vec![1]);
        assert_eq!(program.summary.invalid_lines, vec![InvalidLine { line: 15, words: vec!["X1.2.3".into()] }]);
        assert_eq!(program.summary.arc_moves, 2);
    }

    #[test]
    fn test_replay_matches_fresh_parse() {
        let config = InterpreterConfig::default();
        let mut fresh = SegmentRecorder::default();
        let program = ParsedProgram::parse(PROGRAM, &config, &mut fresh, |_| ());
        let mut replayed = SegmentRecorder::default();
        let state = program.replay(&config, &mut replayed);
        assert_eq!(ProgramSummary::from(&state), program.summary);
        assert_eq!(fresh.0, replayed.0);
    }

    #[test]
    fn test_replay_with_other_settings() {
        let program = ParsedProgram::parse_quiet(PROGRAM, &InterpreterConfig::default());
        let coarse = InterpreterConfig { arc_points: 4, ..Default::default() };
        let mut recorder = SegmentRecorder::default();
        program.replay(&coarse, &mut recorder);
        let arc_sizes: Vec<_> = recorder.0.iter().filter_map(|segment| match segment {
            crate::vm::test::Segment::Arc(_, arc) => Some(arc.points.len()),
            _ => None,
        }).collect();
        assert_eq!(arc_sizes, vec![5, 5]);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let text = (0..250).map(|i| format!("G1 X{} F100\n", i)).collect::<String>();
        let mut seen = Vec::new();
        ParsedProgram::parse(&text, &InterpreterConfig::default(), &mut NullSink, |percent| seen.push(percent));
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn test_empty_program() {
        let program = ParsedProgram::parse_quiet("", &InterpreterConfig::default());
        assert!(program.lines.is_empty());
        assert_eq!(program.modal_log.total(), 0);
        assert_eq!(program.summary.total_time, 0.0);
    }

    fn program_line() -> impl Strategy<Value = String> {
        prop_oneof![
            proptest::sample::select(vec!["G90", "G91", "G20", "G21"]).prop_map(String::from),
            Just("M3 S8000".to_string()),
            Just("G4 P0.25".to_string()),
            Just("G1 X1.2.3".to_string()),
            (-50i32..50, -50i32..50).prop_map(|(x, y)| format!("G0 X{} Y{}", x, y)),
            (-50i32..50, 1u32..3000).prop_map(|(z, f)| format!("G1 Z{} F{}", z, f)),
            (1i32..20).prop_map(|i| format!("G2 I{}", i)),
            (1i32..20, 1i32..20).prop_map(|(x, r)| format!("G3 X{} R{}", x, r)),
        ]
    }

    proptest! {
        #[test]
        fn replay_reproduces_state(lines in proptest::collection::vec(program_line(), 0..60)) {
            let text = lines.join("\n");
            let config = InterpreterConfig::default();
            let mut interpreter = Interpreter::new(config.clone());
            for line in text.lines() {
                interpreter.interpret(line, &mut NullSink);
            }
            let program = ParsedProgram::parse_quiet(&text, &config);
            prop_assert_eq!(program.modal_log.total(), program.lines.len());
            prop_assert_eq!(program.feedrate_log.total(), program.lines.len());
            prop_assert_eq!(program.replay(&config, &mut NullSink), interpreter.into_state());
        }
    }
}
