use std::time::{Duration, Instant};

use common::protocol::{SenderStatus, Workflow};
use gcode::tokenize::strip_comments;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderState {
    Idle,
    Running,
    Paused,
}

/// Streams a loaded program one line at a time; the machine loop decides when a line may go out.
#[derive(Debug)]
pub struct ProgramSender {
    name: Option<String>,
    lines: Vec<String>,
    sent: usize,
    received: usize,
    state: SenderState,
    finished: bool,
    started: Option<Instant>,
    elapsed: Duration,
}
impl Default for ProgramSender {
    fn default() -> Self {
        ProgramSender {
            name: None,
            lines: Vec::new(),
            sent: 0,
            received: 0,
            state: SenderState::Idle,
            finished: false,
            started: None,
            elapsed: Duration::ZERO,
        }
    }
}
impl ProgramSender {
    pub fn load(&mut self, name: String, content: &str) {
        *self = ProgramSender {
            name: Some(name),
            lines: content
                .lines()
                .map(|line| strip_comments(line).trim().to_string())
                .filter(|line| !line.is_empty() && line != "%")
                .collect(),
            ..Default::default()
        };
    }
    pub fn unload(&mut self) {
        *self = ProgramSender::default();
    }
    pub fn is_loaded(&self) -> bool {
        self.name.is_some()
    }
    pub fn start(&mut self) -> bool {
        if !self.is_loaded() {
            return false;
        }
        self.sent = 0;
        self.received = 0;
        self.finished = false;
        self.elapsed = Duration::ZERO;
        self.started = Some(Instant::now());
        self.state = SenderState::Running;
        true
    }
    pub fn pause(&mut self) {
        if self.state == SenderState::Running {
            self.state = SenderState::Paused;
        }
    }
    pub fn resume(&mut self) {
        if self.state == SenderState::Paused {
            self.state = SenderState::Running;
        }
    }
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed = started.elapsed();
        }
        self.state = SenderState::Idle;
    }
    pub fn next_line(&mut self) -> Option<String> {
        if self.state != SenderState::Running {
            return None;
        }
        let line = self.lines.get(self.sent)?.clone();
        self.sent += 1;
        Some(line)
    }
    pub fn has_next_line(&self) -> bool {
        self.state == SenderState::Running && self.sent < self.lines.len()
    }
    /// Records one acknowledged program line. Returns true when that was the last one.
    pub fn ack(&mut self) -> bool {
        if self.received >= self.sent {
            return false;
        }
        self.received += 1;
        if self.received == self.lines.len() && self.state != SenderState::Idle {
            self.finished = true;
            self.stop();
            return true;
        }
        false
    }
    pub fn workflow(&self) -> Workflow {
        match self.state {
            SenderState::Idle => Workflow::Idle,
            SenderState::Running => Workflow::Running,
            SenderState::Paused => Workflow::Paused,
        }
    }
    pub fn status(&self) -> SenderStatus {
        SenderStatus {
            name: self.name.clone(),
            total: self.lines.len(),
            sent: self.sent,
            received: self.received,
            hold: self.state == SenderState::Paused,
            finished: self.finished,
            elapsed_ms: self.started.map_or(self.elapsed, |started| started.elapsed()).as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_skips_comments_and_blank_lines() {
        let mut sender = ProgramSender::default();
        sender.load("part.nc".into(), "%\n(header)\nG21 ; mm\n\nG0 X1\n%\n");
        assert!(sender.start());
        assert_eq!(sender.next_line().as_deref(), Some("G21"));
        assert_eq!(sender.next_line().as_deref(), Some("G0 X1"));
        assert_eq!(sender.next_line(), None);
        assert!(!sender.ack());
        assert!(sender.ack());
        let status = sender.status();
        assert!(status.finished);
        assert_eq!((status.total, status.sent, status.received), (2, 2, 2));
        assert_eq!(sender.workflow(), Workflow::Idle);
    }

    #[test]
    fn test_pause_blocks_lines() {
        let mut sender = ProgramSender::default();
        assert!(!sender.start());
        sender.load("a".into(), "G0 X1\nG0 X2");
        sender.start();
        sender.pause();
        assert_eq!(sender.workflow(), Workflow::Paused);
        assert!(!sender.has_next_line());
        assert_eq!(sender.next_line(), None);
        sender.resume();
        assert_eq!(sender.next_line().as_deref(), Some("G0 X1"));
        sender.stop();
        assert_eq!(sender.next_line(), None);
        // A late acknowledgement after stop is still counted, but does not finish.
        assert!(!sender.ack());
        assert!(!sender.status().finished);
    }
}
