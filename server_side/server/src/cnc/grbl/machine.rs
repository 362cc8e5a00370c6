use std::{collections::VecDeque, sync::Arc};

use common::protocol::Workflow;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::{
    io::AsyncRead,
    select,
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use super::{
    commands::{CYCLE_START, FEED_HOLD, SOFT_RESET, STATUS_REPORT},
    messages::{GrblMessage, GrblResidualStatus},
    parser::parse_grbl_line,
    sender::ProgramSender,
};
use crate::cnc::{
    controller::{ControllerEvent, ControllerOptions},
    machine_writer::MachineWriter,
};

#[derive(Debug)]
pub enum MachineRequest {
    Line { data: String, context: Value },
    Realtime { bytes: Vec<u8>, context: Value },
    Reset,
    Load { name: String, content: Arc<str> },
    Unload,
    Start,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Program,
}
struct PendingLine {
    origin: Origin,
    context: Value,
    sent: bool,
}

pub struct MachineThread<Write: MachineWriter> {
    writer: Write,
    events: mpsc::UnboundedSender<ControllerEvent>,
    /// Lines handed to the writer and not yet answered, oldest first.
    pending: VecDeque<PendingLine>,
    queued: VecDeque<(String, Value)>,
    sender: ProgramSender,
    residual: GrblResidualStatus,
    /// Set once the firmware has shown it is listening.
    ready: bool,
}
impl<Write: MachineWriter> MachineThread<Write> {
    pub fn new(writer: Write, events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        MachineThread {
            writer,
            events,
            pending: VecDeque::new(),
            queued: VecDeque::new(),
            sender: ProgramSender::default(),
            residual: GrblResidualStatus::default(),
            ready: false,
        }
    }
    fn emit(&self, event: ControllerEvent) {
        // The receiver only goes away when the session is shutting us down.
        drop(self.events.send(event));
    }
    fn emit_sender(&self) {
        self.emit(ControllerEvent::Workflow(self.sender.workflow()));
        self.emit(ControllerEvent::Sender(self.sender.status()));
    }
    fn log_sent(&mut self, bytes: Vec<u8>) {
        let Some(pending) = self.pending.iter_mut().find(|pending| !pending.sent) else { return };
        pending.sent = true;
        let context = match pending.origin {
            Origin::Client => pending.context.clone(),
            Origin::Program => json!({ "source": "sender" }),
        };
        let data = String::from_utf8_lossy(&bytes).trim_end().to_string();
        self.emit(ControllerEvent::Write { data, context });
    }
    async fn send_realtime(&mut self, bytes: Vec<u8>, context: Value) -> std::io::Result<()> {
        let bytes = self.writer.write_immediate(bytes).await?;
        if bytes != [STATUS_REPORT] {
            self.emit(ControllerEvent::Write { data: String::from_utf8_lossy(&bytes).into_owned(), context });
        }
        Ok(())
    }
    fn has_line_to_send(&self) -> bool {
        self.ready && (!self.queued.is_empty() || self.sender.has_next_line())
    }
    async fn send_next_line(&mut self) -> std::io::Result<()> {
        // Client lines go first, so a jog or override typed mid-job is not stuck behind the program.
        let (line, origin, context) = match self.queued.pop_front() {
            Some((line, context)) => (line, Origin::Client, context),
            None => match self.sender.next_line() {
                Some(line) => (line, Origin::Program, Value::Null),
                None => return Ok(()),
            },
        };
        self.pending.push_back(PendingLine { origin, context, sent: false });
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if let Some(bytes) = self.writer.enqueue_line(bytes).await? {
            self.log_sent(bytes);
        }
        Ok(())
    }
    fn forget_in_flight(&mut self) {
        self.writer.clear_waiting();
        self.pending.clear();
    }
    async fn receive_line(&mut self, line: String) -> std::io::Result<()> {
        let message = parse_grbl_line(&line);
        if !matches!(message, GrblMessage::StatusEvent(_)) {
            self.emit(ControllerEvent::Read(line.clone()));
        }
        if message.is_line_response() {
            if let Some(bytes) = self.writer.pop_received_line().await? {
                self.log_sent(bytes);
            }
            if let Some(pending) = self.pending.pop_front() {
                if pending.origin == Origin::Program && self.sender.ack() {
                    info!("Program finished");
                    self.emit_sender();
                }
            } else {
                debug!("Response without a pending line: {:?}", line);
            }
        }
        match message {
            GrblMessage::StatusEvent(status) => {
                self.ready = true;
                let report = status.to_report_with_residual(&mut self.residual);
                self.emit(ControllerEvent::State(report));
            }
            GrblMessage::GrblGreeting => {
                info!("Firmware greeting: {}", line);
                if self.ready {
                    // The firmware reset on its own; nothing in flight will be answered.
                    warn!("Unexpected firmware reset");
                    self.forget_in_flight();
                    if self.sender.workflow() != Workflow::Idle {
                        self.sender.stop();
                        self.emit_sender();
                    }
                }
                self.ready = true;
            }
            GrblMessage::GrblError(code) => {
                let text = GrblMessage::get_error_text(code);
                warn!("Grbl error {}: {}", code, text);
                self.emit(ControllerEvent::Error(format!("error:{} {}", code, text)));
            }
            GrblMessage::GrblAlarm(code) => {
                let message = GrblMessage::get_alarm_text(code).into_owned();
                warn!("Grbl alarm {}: {}", code, message);
                if self.sender.workflow() != Workflow::Idle {
                    self.sender.stop();
                    self.emit_sender();
                }
                self.emit(ControllerEvent::Alarm { code, message });
            }
            GrblMessage::Unrecognized(line) => debug!("Unrecognized line from firmware: {:?}", line),
            GrblMessage::GrblOk | GrblMessage::Feedback(_) | GrblMessage::ProbeEvent(_) => (),
        }
        Ok(())
    }
    async fn handle_request(&mut self, request: MachineRequest) -> std::io::Result<()> {
        match request {
            MachineRequest::Line { data, context } => self.queued.push_back((data, context)),
            MachineRequest::Realtime { bytes, context } => {
                if bytes == [SOFT_RESET] {
                    return self.reset().await;
                }
                self.send_realtime(bytes, context).await?;
            }
            MachineRequest::Reset => self.reset().await?,
            MachineRequest::Load { name, content } => {
                self.sender.load(name, &content);
                self.emit_sender();
            }
            MachineRequest::Unload => {
                self.sender.unload();
                self.emit_sender();
            }
            MachineRequest::Start => {
                if self.sender.start() {
                    self.emit_sender();
                } else {
                    self.emit(ControllerEvent::Error("No program is loaded".to_string()));
                }
            }
            MachineRequest::Pause => {
                self.send_realtime(vec![FEED_HOLD], Value::Null).await?;
                self.sender.pause();
                self.emit_sender();
            }
            MachineRequest::Resume => {
                self.send_realtime(vec![CYCLE_START], Value::Null).await?;
                self.sender.resume();
                self.emit_sender();
            }
            MachineRequest::Stop => {
                self.sender.stop();
                self.emit_sender();
                self.reset().await?;
            }
        }
        Ok(())
    }
    async fn reset(&mut self) -> std::io::Result<()> {
        self.send_realtime(vec![SOFT_RESET], Value::Null).await?;
        self.forget_in_flight();
        self.queued.clear();
        if self.sender.workflow() != Workflow::Idle {
            self.sender.stop();
            self.emit_sender();
        }
        // Wait for the greeting before sending more lines.
        self.ready = false;
        Ok(())
    }
    async fn poll_status(&mut self) -> std::io::Result<()> {
        self.writer.write_immediate(vec![STATUS_REPORT]).await?;
        if self.sender.workflow() != Workflow::Idle {
            self.emit(ControllerEvent::Sender(self.sender.status()));
        }
        Ok(())
    }

    /// Runs until the transport closes or every request sender is dropped.
    pub async fn run<Read: AsyncRead + Unpin>(mut self, reader: Read, mut requests: mpsc::UnboundedReceiver<MachineRequest>, options: ControllerOptions) {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(4096));
        let mut status_interval = interval(options.status_interval);
        status_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reason = loop {
            let result = select! {
                biased;
                line = lines.next() => match line {
                    Some(Ok(line)) => self.receive_line(line).await,
                    Some(Err(error)) => break Some(format!("read failed: {}", error)),
                    None => break Some("connection closed by device".to_string()),
                },
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break None,
                },
                _ = std::future::ready(()), if self.has_line_to_send() && self.writer.can_enqueue_line() => {
                    self.send_next_line().await
                },
                _ = status_interval.tick() => self.poll_status().await,
            };
            if let Err(error) = result {
                break Some(format!("write failed: {}", error));
            }
        };
        // Refuse further requests before announcing the close.
        drop(requests);
        if let Some(reason) = &reason {
            warn!("Controller stopped: {}", reason);
        }
        self.emit(ControllerEvent::Closed(reason));
    }
}
