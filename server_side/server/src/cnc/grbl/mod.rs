pub mod commands;
pub mod machine;
pub mod messages;
pub mod parser;
pub mod sender;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

use self::{
    commands::{parse_command, GrblCommand},
    machine::{MachineRequest, MachineThread},
};
use super::{
    connection::Transport,
    controller::{Controller, ControllerError, ControllerEvent, ControllerOptions},
    machine_writer::BufferCountingWriter,
};

pub struct GrblController {
    requests: mpsc::UnboundedSender<MachineRequest>,
    task: JoinHandle<()>,
    /// Longest line, without its newline, that fits the firmware's receive buffer.
    max_line: usize,
}
impl GrblController {
    pub fn spawn(transport: Transport, options: ControllerOptions, events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        let (requests, receiver) = mpsc::unbounded_channel();
        let max_line = usize::from(options.rx_buffer_size).saturating_sub(1);
        let writer = BufferCountingWriter::new(transport.writer, options.rx_buffer_size);
        let thread = MachineThread::new(writer, events);
        let task = tokio::spawn(thread.run(transport.reader, receiver, options));
        GrblController { requests, task, max_line }
    }
    fn send(&self, request: MachineRequest) -> Result<(), ControllerError> {
        self.requests.send(request).map_err(|_| ControllerError::Closed)
    }
    fn check_lengths<'a>(&self, command: &str, lines: impl IntoIterator<Item = &'a str>) -> Result<(), ControllerError> {
        match lines.into_iter().find(|line| line.len() > self.max_line) {
            Some(line) => Err(ControllerError::BadArgument {
                command: command.to_string(),
                message: format!("line of {} bytes exceeds the {} byte receive buffer", line.len(), self.max_line + 1),
            }),
            None => Ok(()),
        }
    }
    fn send_lines(&self, command: &str, data: &str, context: &Value) -> Result<(), ControllerError> {
        let lines: Vec<&str> = data.lines().filter(|line| !line.trim().is_empty()).collect();
        self.check_lengths(command, lines.iter().copied())?;
        for line in lines {
            self.send(MachineRequest::Line { data: line.to_string(), context: context.clone() })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for GrblController {
    async fn command(&self, name: &str, args: &[Value]) -> Result<(), ControllerError> {
        let request = match parse_command(name, args)? {
            GrblCommand::Lines(lines) => {
                self.check_lengths(name, lines.iter().map(String::as_str))?;
                for data in lines {
                    self.send(MachineRequest::Line { data, context: Value::Null })?;
                }
                return Ok(());
            }
            GrblCommand::Realtime(byte) => MachineRequest::Realtime { bytes: vec![byte], context: Value::Null },
            GrblCommand::Reset => MachineRequest::Reset,
            GrblCommand::StartProgram => MachineRequest::Start,
            GrblCommand::PauseProgram => MachineRequest::Pause,
            GrblCommand::ResumeProgram => MachineRequest::Resume,
            GrblCommand::StopProgram => MachineRequest::Stop,
        };
        self.send(request)
    }
    async fn write(&self, data: String, context: Value) -> Result<(), ControllerError> {
        if data.ends_with('\n') {
            self.send_lines("write", &data, &context)
        } else if !data.is_empty() {
            self.send(MachineRequest::Realtime { bytes: data.into_bytes(), context })
        } else {
            Ok(())
        }
    }
    async fn writeln(&self, data: String, context: Value) -> Result<(), ControllerError> {
        self.send_lines("writeln", &data, &context)
    }
    async fn load_program(&self, name: String, content: Arc<str>) -> Result<(), ControllerError> {
        self.send(MachineRequest::Load { name, content })
    }
    async fn unload_program(&self) -> Result<(), ControllerError> {
        self.send(MachineRequest::Unload)
    }
    async fn shutdown(self: Box<Self>) {
        let GrblController { requests, task, .. } = *self;
        drop(requests);
        if let Err(error) = task.await {
            tracing::warn!("Controller task ended badly: {}", error);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use common::grbl::GrblState;
    use machine_mock::recording_machine;
    use serde_json::json;
    use tokio::{io::{duplex, split}, task::JoinHandle, time::timeout};

    use super::*;
    use crate::cnc::controller::ControllerKind;

    fn options() -> ControllerOptions {
        ControllerOptions { status_interval: Duration::from_millis(20), rx_buffer_size: 128 }
    }

    fn start() -> (Box<dyn Controller>, mpsc::UnboundedReceiver<ControllerEvent>, JoinHandle<Vec<String>>) {
        let (host, machine) = duplex(4096);
        let (machine_read, machine_write) = split(machine);
        let (host_read, host_write) = split(host);
        let mock = tokio::spawn(recording_machine(machine_read, machine_write));
        let (events, receiver) = mpsc::unbounded_channel();
        let controller = ControllerKind::Grbl.connect(Transport::new(host_read, host_write), options(), events);
        (controller, receiver, mock)
    }

    async fn wait_for<F: Fn(&ControllerEvent) -> bool>(events: &mut mpsc::UnboundedReceiver<ControllerEvent>, predicate: F) -> ControllerEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("controller stopped");
                if predicate(&event) {
                    return event;
                }
            }
        }).await.expect("timed out waiting for controller event")
    }

    #[tokio::test]
    async fn test_gcode_lines_reach_firmware() {
        let (controller, mut events, mock) = start();
        controller.command("gcode", &[json!("G21\nG0 X1")]).await.unwrap();
        controller.writeln("G1 X2 F100".to_string(), json!({"from": "test"})).await.unwrap();
        let written = wait_for(&mut events, |event| matches!(event, ControllerEvent::Write { data, .. } if data == "G1 X2 F100")).await;
        assert_eq!(written, ControllerEvent::Write { data: "G1 X2 F100".to_string(), context: json!({"from": "test"}) });
        controller.shutdown().await;
        assert_eq!(mock.await.unwrap(), vec!["G21", "G0 X1", "G1 X2 F100"]);
    }

    #[tokio::test]
    async fn test_status_reports() {
        let (controller, mut events, _mock) = start();
        let ControllerEvent::State(report) = wait_for(&mut events, |event| matches!(event, ControllerEvent::State(_))).await else { unreachable!() };
        assert_eq!(report.state, GrblState::Idle);
        assert_eq!(report.machine_position, vec![0.0, 1.0, 3.0]);
        assert_eq!(report.work_position(), vec![-5.0, 6.25, -14.0]);
        assert_eq!(report.buffer, Some((15, 128)));
        controller.command("feedhold", &[]).await.unwrap();
        wait_for(&mut events, |event| matches!(event, ControllerEvent::State(report) if report.state == GrblState::Hold(0))).await;
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_streams_program() {
        let (controller, mut events, mock) = start();
        let program = "%\n(square)\nG21 G90\nG1 X10 F500\nG1 Y10\nG1 X0\nG1 Y0 ; back\n%\n";
        controller.load_program("square.nc".to_string(), Arc::from(program)).await.unwrap();
        controller.command("gcode:start", &[]).await.unwrap();
        let ControllerEvent::Sender(status) = wait_for(&mut events, |event| matches!(event, ControllerEvent::Sender(status) if status.finished)).await else { unreachable!() };
        assert_eq!((status.total, status.sent, status.received), (5, 5, 5));
        controller.shutdown().await;
        assert_eq!(mock.await.unwrap(), vec!["G21 G90", "G1 X10 F500", "G1 Y10", "G1 X0", "G1 Y0"]);
    }

    #[tokio::test]
    async fn test_start_without_program() {
        let (controller, mut events, _mock) = start();
        controller.command("gcode:start", &[]).await.unwrap();
        wait_for(&mut events, |event| matches!(event, ControllerEvent::Error(_))).await;
        assert!(matches!(controller.command("coolant:mist", &[]).await, Err(ControllerError::UnknownCommand(_))));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_lines_longer_than_rx_buffer() {
        let (controller, mut events, mock) = start();
        let long = "G".repeat(70000);
        assert!(matches!(controller.writeln(long.clone(), Value::Null).await, Err(ControllerError::BadArgument { .. })));
        assert!(matches!(controller.command("gcode", &[json!(format!("G0 X1\n{}", long))]).await, Err(ControllerError::BadArgument { .. })));
        // Exactly fills the buffer once the newline is added.
        let longest = format!("G1 X{}", "1".repeat(123));
        controller.writeln(longest.clone(), Value::Null).await.unwrap();
        controller.writeln("G0 X2".to_string(), Value::Null).await.unwrap();
        wait_for(&mut events, |event| matches!(event, ControllerEvent::Write { data, .. } if data == "G0 X2")).await;
        controller.shutdown().await;
        assert_eq!(mock.await.unwrap(), vec![longest, "G0 X2".to_string()]);
    }

    #[tokio::test]
    async fn test_device_disconnect() {
        let (host, machine) = duplex(64);
        drop(machine);
        let (host_read, host_write) = split(host);
        let (events, mut receiver) = mpsc::unbounded_channel();
        let controller = ControllerKind::Grbl.connect(Transport::new(host_read, host_write), options(), events);
        let closed = wait_for(&mut receiver, |event| matches!(event, ControllerEvent::Closed(_))).await;
        assert!(matches!(closed, ControllerEvent::Closed(Some(_))));
        assert!(matches!(controller.writeln("G0 X1".to_string(), Value::Null).await, Err(ControllerError::Closed)));
        controller.shutdown().await;
    }
}
