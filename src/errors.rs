use core::fmt;
use std::{error, io, result};

use crate::{
    queue::WorkerId,
    task::{TaskId, TaskState},
};

/// Internally, we only use this Error type and a newtype wrapper around `std::result::Result<T, E>`
/// where `E` is fixed. Failures of individual tasks (lost workers, failed transfers, non-zero exit
/// codes) are not reported through this type. They are attached to the task itself and surface
/// from `Queue::wait()`.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    InvalidTask(String),
    BindFailure { port: u16, source: io::Error },
    UnknownTask(TaskId),
    UnknownWorker(WorkerId),
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
    Protocol(String),
    ArchitectureError,
}

impl fmt::Display for Error {
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {err}"),
            Error::InvalidTask(reason) => write!(f, "Invalid task: {reason}"),
            Error::BindFailure { port, source } => {
                write!(f, "Could not listen on port {port}: {source}")
            }
            Error::UnknownTask(id) => write!(f, "There is no task with ID {id}"),
            Error::UnknownWorker(id) => write!(f, "There is no worker with ID {id}"),
            Error::InvalidTransition { task, from, to } => write!(
                f,
                "Task {task} can not change its state from \"{from}\" to \"{to}\""
            ),
            Error::Protocol(reason) => write!(f, "Protocol violation: {reason}"),
            Error::ArchitectureError => write!(
                f,
                "The announced message size does not fit into the address space of this machine"
            ),
        }
    }
}

impl From<io::Error> for Error {
    #[cold]
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    #[cold]
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(e) => Error::Io(e),
            other => Error::Protocol(format!("Invalid encoding ({other})")),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::BindFailure { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
