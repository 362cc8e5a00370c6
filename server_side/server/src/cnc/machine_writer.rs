use std::mem::MaybeUninit;

use async_trait::async_trait;
use ringbuf::{ring_buffer::RbBase, LocalRb, Rb};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Size of the serial receive buffer on stock Grbl firmware.
pub const GRBL_RX_BUFFER: u16 = 128;
const MAX_LINES_IN_FLIGHT: usize = 16;

/*
    Writes line-oriented commands so that the bytes in flight never exceed what the firmware
can buffer. Every line costs its length until the firmware answers it with `ok` or `error:N`.
Realtime bytes bypass the accounting.
*/
#[async_trait]
pub trait MachineWriter: Send {
    async fn write_immediate(&mut self, bytes: Vec<u8>) -> std::io::Result<Vec<u8>>;
    /// Forget every line in flight or queued. Used once the firmware has reset.
    fn clear_waiting(&mut self);
    fn can_enqueue_line(&self) -> bool;
    /// Returns the bytes if they went out now; otherwise they wait for buffer space.
    async fn enqueue_line(&mut self, bytes: Vec<u8>) -> std::io::Result<Option<Vec<u8>>>;
    /// Called once per acknowledgement. May release the queued line.
    async fn pop_received_line(&mut self) -> std::io::Result<Option<Vec<u8>>>;
    fn lines_in_flight(&self) -> usize;
}

pub struct BufferCountingWriter<Write> {
    write: Write,
    max_waiting_size: usize,
    waiting_size: usize,
    waiting_lines: LocalRb<usize, [MaybeUninit<usize>; MAX_LINES_IN_FLIGHT]>,
    next_line: Option<Vec<u8>>,
}
#[async_trait]
impl<Write: AsyncWrite + Unpin + Send> MachineWriter for BufferCountingWriter<Write> {
    async fn write_immediate(&mut self, bytes: Vec<u8>) -> std::io::Result<Vec<u8>> {
        self.write.write_all(&bytes).await?;
        self.write.flush().await?;
        Ok(bytes)
    }
    fn clear_waiting(&mut self) {
        self.waiting_lines.clear();
        self.next_line = None;
        self.waiting_size = 0;
    }
    fn can_enqueue_line(&self) -> bool {
        self.next_line.is_none()
    }
    async fn enqueue_line(&mut self, bytes: Vec<u8>) -> std::io::Result<Option<Vec<u8>>> {
        if let Some(queued) = self.next_line.replace(bytes) {
            // Callers check can_enqueue_line first; keep the older line rather than lose it.
            self.next_line = Some(queued);
            return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "a line is already waiting for buffer space"));
        }
        self.flush_next_line().await
    }
    async fn pop_received_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if let Some(received_length) = self.waiting_lines.pop() {
            self.waiting_size -= received_length;
        }
        self.flush_next_line().await
    }
    fn lines_in_flight(&self) -> usize {
        self.waiting_lines.len()
    }
}

fn make_fixed_rb<T, const N: usize>() -> LocalRb<T, [MaybeUninit<T>; N]> {
    unsafe {
        LocalRb::from_raw_parts(MaybeUninit::uninit().assume_init(), 0, 0)
    }
}
impl<Write> BufferCountingWriter<Write>
where
    Write: AsyncWrite + Unpin + Send
{
    pub fn new(write: Write, max_waiting_size: u16) -> Self {
        BufferCountingWriter {
            write,
            max_waiting_size: max_waiting_size as usize,
            waiting_size: 0,
            waiting_lines: make_fixed_rb(),
            next_line: None,
        }
    }
    fn has_room_for(&self, length: usize) -> bool {
        if self.waiting_lines.is_full() {
            return false;
        }
        // A line longer than the whole buffer can only go out alone.
        self.waiting_size == 0 || self.waiting_size + length <= self.max_waiting_size
    }
    async fn flush_next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let length = match &self.next_line {
            Some(line) => line.len(),
            None => return Ok(None),
        };
        if !self.has_room_for(length) {
            return Ok(None);
        }
        let Some(line) = self.next_line.take() else { return Ok(None) };
        if self.waiting_lines.push(length).is_err() {
            self.next_line = Some(line);
            return Ok(None);
        }
        self.waiting_size += length;
        self.write_immediate(line).await.map(Some)
    }
}
