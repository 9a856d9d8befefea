use std::{
    fs,
    io::{self, ErrorKind::WouldBlock, Read, Write},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use slab::Slab;

use crate::{
    distributed::{
        comm_buffers::{RxBuffer, TxBuffer},
        put_frame_len, Message, MAX_FRAME_LEN,
    },
    errors::{Error, Result},
    queue::{
        cache::{Fingerprint, FingerprintMemo, Residency},
        core::{Assignment, PreparedInput},
        workers::{ConnectionId, WorkerId},
        Shared,
    },
    task::{FileSource, FileSpec, TaskId},
};

// Token numbering starts with '1' because of weird behaviour with Token(0) on BSDs
pub(crate) const LISTENER: Token = Token(1);
pub(crate) const WAKER: Token = Token(2);
const FIRST_LINK: usize = 3;

/// Housekeeping (liveness, keepalive, fast abort) runs at least this often
const TICK: Duration = Duration::from_millis(500);

enum TransportState {
    // The message has been successfully transferred
    Finished,
    // This operation would block
    Stalled,
    // An error has occurred
    Error(Error),
}

/// A worker connection
struct Link {
    stream: TcpStream,
    address: SocketAddr,
    rx: RxBuffer,
    tx: TxBuffer,
    /// Set once the handshake has been received
    worker: Option<WorkerId>,
    opened_at: Instant,
    last_ping: Instant,
}

impl Link {
    fn new(stream: TcpStream, address: SocketAddr) -> Self {
        Self {
            stream,
            address,
            rx: RxBuffer::new(),
            tx: TxBuffer::new(),
            worker: None,
            opened_at: Instant::now(),
            last_ping: Instant::now(),
        }
    }

    fn read_rx_buffer(&mut self) -> TransportState {
        // After we have finished reading the header, the buffer gets enlarged and remaining
        // bytes from the message body will be read to the buffer in subsequent iterations
        loop {
            match self.stream.read(self.rx.buf_mut_unfilled()) {
                Ok(0) => {
                    return TransportState::Error(
                        io::Error::new(io::ErrorKind::ConnectionAborted, "Connection aborted")
                            .into(),
                    );
                }
                Ok(bytes_read) => {
                    self.rx.update_bytes_read(bytes_read);
                }
                // When errors are returned, it's guaranteed that nothing was read during this
                // iteration, so we don't need to check here if we're perhaps finished
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    // Retry...
                }
                Err(ref e) if e.kind() == WouldBlock => {
                    // The underlying OS socket is empty, wait for another event to occur
                    return TransportState::Stalled;
                }
                Err(e) => {
                    return TransportState::Error(e.into());
                }
            }

            if self.rx.is_finished_reading_header() {
                if let Err(e) = self.rx.decode_header() {
                    return TransportState::Error(e);
                }
            } else if self.rx.is_finished() {
                return TransportState::Finished;
            }
        }
    }

    fn write_tx_buffer(&mut self) -> TransportState {
        while !self.tx.is_ready() {
            match self.stream.write(self.tx.buf_unsent()) {
                Ok(0) => {
                    return TransportState::Error(
                        io::Error::new(io::ErrorKind::ConnectionAborted, "Connection aborted")
                            .into(),
                    );
                }
                Ok(bytes_sent) => {
                    self.tx.update_bytes_sent(bytes_sent);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    // Retry...
                }
                Err(ref e) if e.kind() == WouldBlock => {
                    // The OS send buffer is full, continue once the socket is writable again
                    return TransportState::Stalled;
                }
                Err(e) => {
                    return TransportState::Error(e.into());
                }
            }
        }
        // The contents of the buffer have been sent successfully
        TransportState::Finished
    }
}

/// The protocol side of a queue. Runs on its own thread, multiplexes all worker connections
/// with `mio`, and carries out what the shared `Core` decides.
pub(crate) struct Dispatcher {
    poll: Poll,
    listener: TcpListener,
    links: Slab<Link>,
    shared: Arc<Shared>,
    memo: FingerprintMemo,
}

impl Dispatcher {
    pub fn new(poll: Poll, mut listener: TcpListener, shared: Arc<Shared>) -> Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            poll,
            listener,
            links: Slab::new(),
            shared,
            memo: FingerprintMemo::new(),
        })
    }

    /// Serves workers until the queue shuts down
    pub fn run(mut self) {
        if let Err(e) = self.event_loop() {
            error!("The dispatcher stopped unexpectedly: {}", e);
        }
        self.shut_down();
    }

    fn event_loop(&mut self) -> Result<()> {
        // Create storage for events
        let mut events = Events::with_capacity(1024);

        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    // Workers of the world, register!
                    LISTENER => self.accept(),
                    // The application has changed something
                    WAKER => {}
                    Token(token) => {
                        let key = token - FIRST_LINK;
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.receive(key);
                        }
                        if event.is_writable() {
                            self.flush(key);
                        }
                    }
                }
            }

            if self.shared.lock().shutting_down {
                return Ok(());
            }
            self.pump();
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, address)) => {
                    let key = self.links.vacant_key();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(key + FIRST_LINK),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!("Could not register connection from {}: {}", address, e);
                        continue;
                    }
                    // Not fatal, only slower
                    let _ = stream.set_nodelay(true);
                    self.links.insert(Link::new(stream, address));
                    self.shared.lock().workers.connection_opened();
                    debug!("Connection established ({})", address);
                }
                Err(ref e) if e.kind() == WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Could not accept connection: {}", e);
                    return;
                }
            }
        }
    }

    /// Reads and handles everything the worker has sent so far
    fn receive(&mut self, key: ConnectionId) {
        loop {
            let Some(link) = self.links.get_mut(key) else {
                return;
            };
            match link.read_rx_buffer() {
                TransportState::Finished => {
                    let outcome = link
                        .rx
                        .decode_and_reset()
                        .and_then(|message| self.handle_message(key, message));
                    if let Err(e) = outcome {
                        self.drop_link(key, &e.to_string());
                        return;
                    }
                }
                TransportState::Stalled => return,
                TransportState::Error(e) => {
                    self.drop_link(key, &e.to_string());
                    return;
                }
            }
        }
    }

    /// Errors returned from here are fatal to the connection. Messages that merely refer to
    /// tasks the worker no longer owns are logged and ignored.
    fn handle_message(&mut self, key: ConnectionId, message: Message) -> Result<()> {
        let link = self
            .links
            .get_mut(key)
            .ok_or_else(|| Error::Protocol(format!("unknown connection {key}")))?;
        trace!("Received {} from {}", message.kind(), link.address);

        let Some(worker) = link.worker else {
            return match message {
                Message::Handshake { hostname, capacity } => {
                    let worker =
                        self.shared
                            .lock()
                            .handshake(key, hostname, link.address, capacity)?;
                    link.worker = Some(worker);
                    Ok(())
                }
                other => Err(Error::Protocol(format!(
                    "expected a handshake, got \"{}\"",
                    other.kind()
                ))),
            };
        };

        self.shared.lock().heard_from(worker);
        let outcome = match message {
            Message::Started { task_id } => self.shared.lock().task_started(worker, task_id),
            Message::TaskResult {
                task_id,
                exit_code,
                output,
            } => self
                .shared
                .lock()
                .task_result(worker, task_id, exit_code, output),
            Message::FileData {
                task_id,
                remote_name,
                data,
            } => self.store_output(worker, task_id, &remote_name, data),
            Message::Cancelled { task_id } => self.shared.lock().task_cancelled(worker, task_id),
            Message::Heartbeat => Ok(()),
            other => {
                return Err(Error::Protocol(format!(
                    "workers may not send \"{}\"",
                    other.kind()
                )))
            }
        };
        if let Err(e) = outcome {
            warn!("Ignoring message from worker #{}: {}", worker, e);
        }
        Ok(())
    }

    /// Writes a pulled output file to its local path. The file system is touched without
    /// holding the lock.
    fn store_output(
        &mut self,
        worker: WorkerId,
        task_id: TaskId,
        remote_name: &str,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        let destination = self
            .shared
            .lock()
            .output_destination(worker, task_id, remote_name)?;
        let outcome = match data {
            Some(data) => fs::write(&destination, &data)
                .map(|()| data.len() as u64)
                .map_err(|e| format!("could not write {}: {}", destination.display(), e)),
            None => Err("the file does not exist on the worker".to_string()),
        };
        self.shared
            .lock()
            .output_stored(worker, task_id, remote_name, outcome)
    }

    fn flush(&mut self, key: ConnectionId) {
        let Some(link) = self.links.get_mut(key) else {
            return;
        };
        if let TransportState::Error(e) = link.write_tx_buffer() {
            self.drop_link(key, &e.to_string());
        }
    }

    /// Closes a connection. If a worker was attached to it, the worker is removed.
    fn drop_link(&mut self, key: ConnectionId, reason: &str) {
        let Some(mut link) = self.links.try_remove(key) else {
            return;
        };
        // The socket is closed when `link` goes out of scope anyway
        let _ = self.poll.registry().deregister(&mut link.stream);

        let mut core = self.shared.lock();
        match link.worker {
            Some(worker) => core.disconnect(worker, reason),
            None => {
                core.workers.connection_closed();
                debug!("Connection {} closed before handshake: {}", link.address, reason);
            }
        }
        core.forget_connection(key);
    }

    /// Everything that happens between two rounds of events: dropping unresponsive workers,
    /// keepalive pings, scheduling, and sending what the core has queued up
    fn pump(&mut self) {
        let now = Instant::now();
        let (lost, quiet, liveness_window, keepalive_interval) = {
            let mut core = self.shared.lock();
            if core.forget_fingerprints_if_idle() {
                self.memo.clear();
            }
            (
                core.lost_workers(now),
                core.quiet_workers(now),
                core.config.liveness_window,
                core.config.keepalive_interval,
            )
        };

        let mute = self
            .links
            .iter()
            .filter(|(_, link)| {
                link.worker.is_none()
                    && now.saturating_duration_since(link.opened_at) > liveness_window
            })
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in mute {
            self.drop_link(key, "no handshake in time");
        }

        for (worker, reason) in lost {
            match self.link_of(worker) {
                Some(key) => self.drop_link(key, &reason),
                None => self.shared.lock().disconnect(worker, &reason),
            }
        }

        for key in quiet {
            if let Some(link) = self.links.get_mut(key) {
                if now.saturating_duration_since(link.last_ping) > keepalive_interval {
                    link.last_ping = now;
                    if let Err(e) = link.tx.push(Message::Heartbeat) {
                        warn!("Could not queue keepalive: {}", e);
                    }
                }
            }
        }

        let assignments = self.shared.lock().schedule();
        for assignment in &assignments {
            self.dispatch(assignment);
        }

        let (outbox, retiring) = {
            let mut core = self.shared.lock();
            (core.drain_outbox(), core.drain_retiring())
        };
        let mut broken = Vec::new();
        for (key, message) in outbox {
            if let Some(link) = self.links.get_mut(key) {
                trace!("Sending {} to {}", message.kind(), link.address);
                if let Err(e) = link.tx.push(message) {
                    broken.push((key, e.to_string()));
                }
            }
        }
        for (key, reason) in broken {
            self.drop_link(key, &reason);
        }

        let pending = self
            .links
            .iter()
            .filter(|(_, link)| !link.tx.is_ready())
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in pending {
            self.flush(key);
        }

        for key in retiring {
            self.drop_link(key, "told to exit");
        }

        // Wake up the application in case some tasks have finished
        self.shared.notify();
    }

    fn link_of(&self, worker: WorkerId) -> Option<ConnectionId> {
        self.links
            .iter()
            .find(|(_, link)| link.worker == Some(worker))
            .map(|(key, _)| key)
    }

    /// Reads the inputs of an assignment and hands them to the core for sending
    fn dispatch(&mut self, assignment: &Assignment) {
        let prepared = self.prepare_inputs(assignment);
        let mut core = self.shared.lock();
        let outcome = match prepared {
            Ok(inputs) => core.stage(assignment, inputs),
            Err(reason) => core.transfer_failed(assignment.worker, assignment.task_id, reason),
        };
        if let Err(e) = outcome {
            debug!("Task {} was not dispatched: {}", assignment.task_id, e);
        }
    }

    /// Fingerprints cacheable inputs, and loads the contents of every input the worker does not
    /// hold yet. Local files are only read outside of the lock.
    fn prepare_inputs(
        &mut self,
        assignment: &Assignment,
    ) -> std::result::Result<Vec<PreparedInput>, String> {
        let mut prepared = Vec::with_capacity(assignment.inputs.len());
        for spec in &assignment.inputs {
            let mut spec = spec.clone();
            let data = match (&spec.source, spec.is_cacheable()) {
                (FileSource::Buffer(data), cacheable) => {
                    spec.fingerprint = cacheable.then(|| Fingerprint::of_bytes(data));
                    Some(data.clone())
                }
                (FileSource::Path(path), true) => {
                    let (fingerprint, data) = self
                        .memo
                        .fingerprint(path)
                        .map_err(|e| format!("could not read {}: {}", path.display(), e))?;
                    spec.fingerprint = Some(fingerprint);
                    data
                }
                (FileSource::Path(_), false) => {
                    spec.fingerprint = None;
                    None
                }
            };
            prepared.push(PreparedInput { spec, data });
        }

        let plan = self
            .shared
            .lock()
            .plan_transfers(assignment.worker, prepared.iter().map(|input| &input.spec));

        for (input, residency) in prepared.iter_mut().zip(plan) {
            if residency == Residency::Cached {
                input.data = None;
                continue;
            }
            if input.data.is_none() {
                if let FileSource::Path(path) = &input.spec.source {
                    input.data = Some(
                        fs::read(path)
                            .map_err(|e| format!("could not read {}: {}", path.display(), e))?,
                    );
                }
            }
            if let Some(data) = &input.data {
                ensure_sendable(assignment.task_id, &input.spec, data.len())?;
            }
        }
        Ok(prepared)
    }

    /// Tells all workers to exit and closes every connection. Best effort.
    fn shut_down(&mut self) {
        let connections = self.shared.lock().shut_down();
        for key in connections {
            if let Some(link) = self.links.get_mut(key) {
                let _ = link.tx.push(Message::Exit);
                let _ = link.write_tx_buffer();
            }
        }
        for mut link in self.links.drain() {
            let _ = self.poll.registry().deregister(&mut link.stream);
        }
        self.shared.notify();
        info!("Dispatcher shut down");
    }
}

/// Refuses inputs whose `Put` would not fit into a single frame
fn ensure_sendable(task_id: TaskId, spec: &FileSpec, len: usize) -> std::result::Result<(), String> {
    let cache_key = spec.fingerprint.filter(|_| spec.is_cacheable());
    let frame_len =
        put_frame_len(task_id, &spec.remote_name, cache_key, len).map_err(|e| e.to_string())?;
    if frame_len > MAX_FRAME_LEN {
        return Err(format!(
            "\"{}\" is too large to be sent in one piece",
            spec.remote_name
        ));
    }
    Ok(())
}
