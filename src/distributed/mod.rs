pub mod comm_buffers;
pub mod dispatcher;
pub mod worker;

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::{
    distributed::comm_buffers::RxBuffer,
    errors::{Error, Result},
    queue::cache::Fingerprint,
    task::TaskId,
};

/// Frames larger than this are refused
pub const MAX_FRAME_LEN: u64 = 1 << 30;

pub trait Frame {
    const PROTO_LEN: usize = 8;

    fn encode(&mut self) -> Result<Vec<u8>>;
}

/// An input as the worker should see it in the sandbox of a task
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub remote_name: String,
    /// Set for inputs the worker keeps in its cache
    pub cache_key: Option<Fingerprint>,
}

/// Everything master and workers say to each other
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // Worker -> master
    Handshake {
        hostname: String,
        capacity: u32,
    },
    Started {
        task_id: TaskId,
    },
    TaskResult {
        task_id: TaskId,
        exit_code: i32,
        output: Vec<u8>,
    },
    FileData {
        task_id: TaskId,
        remote_name: String,
        data: Option<Vec<u8>>,
    },
    Cancelled {
        task_id: TaskId,
    },

    // Master -> worker
    Put {
        task_id: TaskId,
        remote_name: String,
        cache_key: Option<Fingerprint>,
        data: Vec<u8>,
    },
    Run {
        task_id: TaskId,
        command: String,
        inputs: Vec<StagedFile>,
        outputs: Vec<String>,
    },
    Get {
        task_id: TaskId,
        remote_name: String,
    },
    Cancel {
        task_id: TaskId,
    },
    Release {
        task_id: TaskId,
    },
    Exit,

    // Both directions
    Heartbeat,
}

impl Message {
    /// Name of the variant, for log messages
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::Started { .. } => "started",
            Message::TaskResult { .. } => "result",
            Message::FileData { .. } => "file data",
            Message::Cancelled { .. } => "cancelled",
            Message::Put { .. } => "put",
            Message::Run { .. } => "run",
            Message::Get { .. } => "get",
            Message::Cancel { .. } => "cancel",
            Message::Release { .. } => "release",
            Message::Exit => "exit",
            Message::Heartbeat => "heartbeat",
        }
    }
}

/// A message wrapped for sending. The first eight bytes carry the size of the whole frame.
#[derive(Serialize, Deserialize, Debug)]
pub struct Envelope {
    encoded_size: u64,
    message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            encoded_size: 0,
            message,
        }
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

impl Frame for Envelope {
    fn encode(&mut self) -> Result<Vec<u8>> {
        let encoded_size = bincode::serialized_size(&self)?;
        if encoded_size > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "message of {encoded_size} bytes exceeds the frame limit"
            )));
        }
        self.encoded_size = encoded_size;
        Ok(bincode::serialize(&self)?)
    }
}

/// Size of the frame a `Put` of `data_len` bytes takes, computed without the data at hand
pub fn put_frame_len(
    task_id: TaskId,
    remote_name: &str,
    cache_key: Option<Fingerprint>,
    data_len: usize,
) -> Result<u64> {
    let envelope = Envelope::new(Message::Put {
        task_id,
        remote_name: remote_name.to_string(),
        cache_key,
        data: Vec::new(),
    });
    Ok(bincode::serialized_size(&envelope)? + data_len as u64)
}

/// Encodes and writes a message in a blocking way
pub fn send_message<W>(connection: &mut W, message: Message) -> Result<()>
where
    W: Write,
{
    let frame = Envelope::new(message).encode()?;
    connection.write_all(&frame)?;
    connection.flush()?;
    Ok(())
}

/// Reads a message completely from the connection in a blocking way and decodes it eventually
pub fn receive_message<R>(connection: &mut R) -> Result<Message>
where
    R: Read,
{
    let mut buffer = RxBuffer::new();

    // Read and decode first bytes in which the message size is stored
    if connection.read_exact(buffer.buf_mut_unfilled()).is_err() {
        // Apparently, the other side has dropped the connection
        return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "Connection aborted").into());
    }
    buffer.update_bytes_read(Envelope::PROTO_LEN);

    // Enlarge buffer to fit the entire message
    buffer.decode_header()?;

    // Read (blocking) and decode message
    let remaining = buffer.buf_mut_unfilled().len();
    connection.read_exact(buffer.buf_mut_unfilled())?;
    buffer.update_bytes_read(remaining);
    buffer.decode_and_reset()
}
