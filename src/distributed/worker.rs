use std::{
    collections::HashMap,
    env,
    fs,
    io::{self, Read},
    net::{Shutdown, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use log::{debug, info, trace, warn};

use crate::{
    distributed::{receive_message, send_message, Message, StagedFile},
    errors::{Error, Result},
    queue::cache::Fingerprint,
    task::TaskId,
};

/// A command in flight
struct RunningTask {
    child: Child,
    cancelled: bool,
}

type RunningTasks = Arc<Mutex<HashMap<TaskId, RunningTask>>>;

/// Executes tasks on behalf of a queue. Each task runs in `sh -c` inside its own sandbox
/// directory below the working directory; cacheable inputs are kept in `<workdir>/cache` for the
/// lifetime of the connection.
pub struct Worker {
    connection: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    workdir: PathBuf,
    hostname: String,
    capacity: u32,
    running: RunningTasks,
}

impl Worker {
    pub fn connect<P>(host: &str, port: u16, capacity: u32, workdir: P) -> Result<Self>
    where
        P: Into<PathBuf>,
    {
        let connection = TcpStream::connect((host, port))?;
        // Not fatal, only slower
        let _ = connection.set_nodelay(true);
        let writer = Arc::new(Mutex::new(connection.try_clone()?));

        let workdir = workdir.into();
        fs::create_dir_all(workdir.join("cache"))?;

        let hostname = env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.is_empty())
            .map_or_else(|| connection.local_addr().map(|addr| addr.ip().to_string()), Ok)?;

        Ok(Self {
            connection,
            writer,
            workdir,
            hostname,
            capacity: capacity.max(1),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Name the worker introduces itself with
    pub fn with_hostname<T>(mut self, hostname: T) -> Self
    where
        T: Into<String>,
    {
        self.hostname = hostname.into();
        self
    }

    /// Serves the queue until it says goodbye or goes away
    pub fn run(&mut self) -> Result<()> {
        self.send(Message::Handshake {
            hostname: self.hostname.clone(),
            capacity: self.capacity,
        })?;
        info!(
            "Connected to {} with {} slot(s)",
            self.connection.peer_addr()?,
            self.capacity
        );

        loop {
            let message = match receive_message(&mut self.connection) {
                Ok(message) => message,
                Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!("The queue has dropped the connection, shutting down gracefully");
                    break;
                }
                Err(e) => return Err(e),
            };
            trace!("Received {}", message.kind());

            match message {
                Message::Put {
                    task_id,
                    remote_name,
                    cache_key,
                    data,
                } => self.store_input(task_id, &remote_name, cache_key, &data)?,
                Message::Run {
                    task_id,
                    command,
                    inputs,
                    outputs: _,
                } => self.start(task_id, &command, &inputs)?,
                Message::Get {
                    task_id,
                    remote_name,
                } => {
                    let data = fs::read(self.sandbox(task_id).join(&remote_name)).ok();
                    self.send(Message::FileData {
                        task_id,
                        remote_name,
                        data,
                    })?;
                }
                Message::Cancel { task_id } => self.cancel(task_id),
                Message::Release { task_id } => {
                    let sandbox = self.sandbox(task_id);
                    if sandbox.exists() {
                        fs::remove_dir_all(sandbox)?;
                    }
                }
                Message::Heartbeat => self.send(Message::Heartbeat)?,
                Message::Exit => {
                    info!("The queue asked us to exit");
                    break;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "the queue may not send \"{}\"",
                        other.kind()
                    )))
                }
            }
        }

        self.kill_all();
        let _ = self.connection.shutdown(Shutdown::Both);
        Ok(())
    }

    fn sandbox(&self, task_id: TaskId) -> PathBuf {
        self.workdir.join(format!("t.{task_id}"))
    }

    fn cached(&self, fingerprint: Fingerprint) -> PathBuf {
        self.workdir.join("cache").join(fingerprint.to_string())
    }

    fn send(&self, message: Message) -> Result<()> {
        send(&self.writer, message)
    }

    fn store_input(
        &self,
        task_id: TaskId,
        remote_name: &str,
        cache_key: Option<Fingerprint>,
        data: &[u8],
    ) -> Result<()> {
        let path = match cache_key {
            Some(fingerprint) => self.cached(fingerprint),
            None => self.sandbox(task_id).join(remote_name),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        debug!("Stored {} bytes as {}", data.len(), path.display());
        Ok(())
    }

    /// Copies cached inputs into the sandbox and starts the command. Failures to set up the task
    /// are reported as a failed execution.
    fn start(&self, task_id: TaskId, command: &str, inputs: &[StagedFile]) -> Result<()> {
        let sandbox = self.sandbox(task_id);
        let child = inputs
            .iter()
            .filter_map(|input| {
                input
                    .cache_key
                    .map(|fingerprint| (self.cached(fingerprint), sandbox.join(&input.remote_name)))
            })
            .try_for_each(|(cached, target)| materialize(&cached, &target))
            .and_then(|()| {
                fs::create_dir_all(&sandbox)?;
                Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(&sandbox)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .spawn()
            });

        self.send(Message::Started { task_id })?;
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Could not start task {}: {}", task_id, e);
                return self.send(Message::TaskResult {
                    task_id,
                    exit_code: 127,
                    output: e.to_string().into_bytes(),
                });
            }
        };
        debug!("Task {} started: {}", task_id, command);

        let stdout = child.stdout.take();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                task_id,
                RunningTask {
                    child,
                    cancelled: false,
                },
            );

        let running = Arc::clone(&self.running);
        let writer = Arc::clone(&self.writer);
        thread::Builder::new()
            .name(format!("workq-task-{task_id}"))
            .spawn(move || {
                if let Err(e) = finish(task_id, stdout, &running, &writer) {
                    warn!("Could not report task {}: {}", task_id, e);
                }
            })?;
        Ok(())
    }

    fn cancel(&self, task_id: TaskId) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = running.get_mut(&task_id) {
            task.cancelled = true;
            if let Err(e) = task.child.kill() {
                warn!("Could not kill task {}: {}", task_id, e);
            }
        }
    }

    fn kill_all(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        for task in running.values_mut() {
            task.cancelled = true;
            let _ = task.child.kill();
        }
    }
}

/// Waits for a command to finish and reports its outcome
fn finish<R>(
    task_id: TaskId,
    stdout: Option<R>,
    running: &RunningTasks,
    writer: &Mutex<TcpStream>,
) -> Result<()>
where
    R: Read,
{
    let mut output = Vec::new();
    if let Some(mut stdout) = stdout {
        // A killed command closes its end, too
        let _ = stdout.read_to_end(&mut output);
    }

    let task = running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&task_id);
    let Some(mut task) = task else {
        return Ok(());
    };
    let status = task.child.wait()?;

    if task.cancelled {
        debug!("Task {} cancelled", task_id);
        return send(writer, Message::Cancelled { task_id });
    }
    // Killed by a signal
    let exit_code = status.code().unwrap_or(128);
    debug!("Task {} exited with status {}", task_id, exit_code);
    send(
        writer,
        Message::TaskResult {
            task_id,
            exit_code,
            output,
        },
    )
}

fn send(writer: &Mutex<TcpStream>, message: Message) -> Result<()> {
    let mut connection = writer.lock().unwrap_or_else(PoisonError::into_inner);
    send_message(&mut *connection, message)
}

/// Gives a sandbox its own copy of a cached file. The cache entry must not change when a task
/// writes to its inputs.
fn materialize(cached: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if target.exists() {
        fs::remove_file(target)?;
    }
    fs::copy(cached, target).map(|_bytes| ())
}
