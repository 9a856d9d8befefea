use std::collections::VecDeque;

use crate::{
    distributed::{Envelope, Frame, Message, MAX_FRAME_LEN},
    errors::{Error, Result},
};

/// Collects the bytes of one incoming frame, possibly across many non-blocking reads.
/// The buffer never asks for more bytes than the current frame has, so nothing of the next frame
/// is consumed early.
#[derive(Debug)]
pub struct RxBuffer {
    pub expected_size: usize,
    pub buf: Vec<u8>,
    pub already_read: usize,
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RxBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0; Envelope::PROTO_LEN],
            expected_size: Envelope::PROTO_LEN,
            already_read: 0,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.buf.resize(Envelope::PROTO_LEN, 0);
        self.expected_size = Envelope::PROTO_LEN;
        self.already_read = 0;
    }

    pub fn buf_mut_unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.already_read..]
    }

    pub fn decode_and_reset(&mut self) -> Result<Message> {
        let out: Envelope = bincode::deserialize(&self.buf)?;
        self.reset();
        Ok(out.into_message())
    }

    pub fn decode_header(&mut self) -> Result<()> {
        let message_size: u64 = bincode::deserialize(&self.buf[..Envelope::PROTO_LEN])?;
        if message_size > MAX_FRAME_LEN || message_size <= Envelope::PROTO_LEN as u64 {
            return Err(Error::Protocol(format!(
                "announced frame size of {message_size} bytes is out of bounds"
            )));
        }
        self.expected_size = message_size
            .try_into()
            .map_err(|_e| Error::ArchitectureError)?;
        self.buf.resize(self.expected_size, 0);
        Ok(())
    }

    pub fn is_finished_reading_header(&self) -> bool {
        self.expected_size == Envelope::PROTO_LEN && self.already_read == Envelope::PROTO_LEN
    }

    pub fn is_finished(&self) -> bool {
        self.expected_size > Envelope::PROTO_LEN && self.already_read == self.expected_size
    }

    pub fn update_bytes_read(&mut self, bytes_read: usize) {
        self.already_read += bytes_read;
    }
}

/// Outgoing frames of one connection, sent in order
#[derive(Debug, Default)]
pub struct TxBuffer {
    bytes_sent: usize,
    frames: VecDeque<Vec<u8>>,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) -> Result<usize> {
        let frame = Envelope::new(message).encode()?;
        let len = frame.len();
        self.frames.push_back(frame);
        Ok(len)
    }

    pub fn update_bytes_sent(&mut self, bytes_sent: usize) {
        self.bytes_sent += bytes_sent;
        if let Some(frame) = self.frames.front() {
            if self.bytes_sent >= frame.len() {
                self.frames.pop_front();
                self.bytes_sent = 0;
            }
        }
    }

    /// Is everything sent?
    pub fn is_ready(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn buf_unsent(&self) -> &[u8] {
        self.frames
            .front()
            .map_or(&[][..], |frame| &frame[self.bytes_sent..])
    }
}
