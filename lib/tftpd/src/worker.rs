//! Per-transaction worker. Each worker owns one OS thread, one wakeup
//! signal, and at most one in-flight transfer: the transaction socket,
//! the open file, and the file lock all live here until termination.
//!
//! Two orthogonal state machines drive the thread: activity
//! (Inactive/Active/Terminating) for the thread lifecycle, and the
//! transaction state for the lock-step protocol itself. Both are
//! manipulated only through compare-and-swap.

use crate::datagram::{Datagram, DatagramFactory};
use crate::file::{EolMode, FileReader, FileWriter};
use crate::logging;
use crate::message::{self, ErrorCode, Mode, OpCode, Request, WireError};
use crate::ring::SpscRing;
use crate::security::{FileSecurity, PathError};
use crate::signal::Signal;
use crate::socket::UdpEndpoint;
use crate::support::NetError;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_RETRIES: u32 = 4;

const POLL_SLICE_MS: u32 = 50;
const IDLE_WAIT: Duration = Duration::from_secs(1);
const SETUP_WAIT: Duration = Duration::from_millis(20);
const STOP_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Activity {
    Inactive = 0,
    Active = 1,
    Terminating = 2,
}

impl Activity {
    #[inline]
    fn from_u8(raw: u8) -> Activity {
        match raw {
            1 => Activity::Active,
            2 => Activity::Terminating,
            _ => Activity::Inactive,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransactionState {
    Inactive = 0,
    WaitingForRequest = 1,
    SettingUpRequest = 2,
    ProcessingRequest = 3,
    WaitingForData = 4,
    WaitingForAck = 5,
    Terminating = 6,
}

impl TransactionState {
    #[inline]
    fn from_u8(raw: u8) -> TransactionState {
        match raw {
            1 => TransactionState::WaitingForRequest,
            2 => TransactionState::SettingUpRequest,
            3 => TransactionState::ProcessingRequest,
            4 => TransactionState::WaitingForData,
            5 => TransactionState::WaitingForAck,
            6 => TransactionState::Terminating,
            _ => TransactionState::Inactive,
        }
    }
}

/// Worker-internal error taxonomy. `Ok(())` plays the no-error role, and
/// a wrong block number never reaches this enum: the data path answers
/// it with a duplicate ACK and the ack path folds it into the resend
/// loop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum TxError {
    InvalidState,
    InvalidOpcode,
    Timeout,
    InvalidMessageSize,
    InvalidMessageFormat,
    InvalidMode,
    NoSuchFile,
    AccessForbidden,
    FileLocked,
    UnsafePath,
    ClientError,
    CriticalServerError,
    ShuttingDown,
}

/// What goes on the wire for each abort reason; `None` means the peer
/// gets no reply (it errored first).
fn wire_error(err: TxError) -> Option<(ErrorCode, &'static str)> {
    match err {
        TxError::InvalidState
        | TxError::InvalidOpcode
        | TxError::InvalidMessageSize
        | TxError::InvalidMessageFormat
        | TxError::InvalidMode => Some((
            ErrorCode::IllegalOperation,
            ErrorCode::IllegalOperation.default_message(),
        )),
        TxError::NoSuchFile => Some((
            ErrorCode::FileNotFound,
            ErrorCode::FileNotFound.default_message(),
        )),
        TxError::AccessForbidden | TxError::UnsafePath => Some((
            ErrorCode::AccessViolation,
            ErrorCode::AccessViolation.default_message(),
        )),
        TxError::FileLocked => Some((ErrorCode::Undefined, "temporarily unavailable")),
        TxError::Timeout => Some((ErrorCode::Undefined, "transaction timed out")),
        TxError::CriticalServerError => Some((ErrorCode::Undefined, "critical server error")),
        TxError::ShuttingDown => Some((ErrorCode::Undefined, "Server shut down")),
        TxError::ClientError => None,
    }
}

fn path_error(err: PathError) -> TxError {
    match err {
        PathError::InvalidFormat => TxError::NoSuchFile,
        PathError::EscapesRoot => TxError::UnsafePath,
        PathError::CantCreateFile | PathError::AccessForbidden | PathError::Permissions => {
            TxError::AccessForbidden
        }
        PathError::NoSuchFile | PathError::IsDirectory => TxError::NoSuchFile,
    }
}

/// Posted on the worker's ring when a transaction ends so the dispatcher
/// can unbind the transaction socket and free the record.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Termination {
    pub client_tid: u16,
    pub server_tid: u16,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct WorkerConfig {
    pub index: usize,
    pub block_size: usize,
    pub timeout: Duration,
    pub retries: u32,
}

struct TransactionCtx {
    client_host: IpAddr,
    client_tid: u16,
    server_tid: u16,
    last_ack: u16,
    operation: Option<OpCode>,
    ascii: bool,
    path: PathBuf,
    locked: bool,
    writer: Option<FileWriter>,
    reader: Option<FileReader>,
    socket: Option<Arc<UdpEndpoint>>,
}

impl TransactionCtx {
    fn new() -> TransactionCtx {
        TransactionCtx {
            client_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            client_tid: 0,
            server_tid: 0,
            last_ack: 0,
            operation: None,
            ascii: false,
            path: PathBuf::new(),
            locked: false,
            writer: None,
            reader: None,
            socket: None,
        }
    }

    fn reset(&mut self) {
        *self = TransactionCtx::new();
    }

    #[inline]
    fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.client_host, self.client_tid)
    }
}

pub(crate) struct WorkerShared {
    config: WorkerConfig,
    activity: AtomicU8,
    state: AtomicU8,
    signal: Signal,
    ctx: Mutex<TransactionCtx>,
    security: Arc<FileSecurity>,
    factory: Weak<DatagramFactory>,
    terminations: Arc<SpscRing<Termination>>,
    log: logging::Logger,
}

pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Creates the worker and starts its thread.
    pub fn start(
        config: WorkerConfig,
        security: Arc<FileSecurity>,
        factory: Weak<DatagramFactory>,
        terminations: Arc<SpscRing<Termination>>,
        log: &logging::Logger,
    ) -> Worker {
        let index = config.index;
        let shared = Arc::new(WorkerShared {
            config,
            activity: AtomicU8::new(Activity::Inactive as u8),
            state: AtomicU8::new(TransactionState::Inactive as u8),
            signal: Signal::new(),
            ctx: Mutex::new(TransactionCtx::new()),
            security,
            factory,
            terminations,
            log: log.new(logging::o!("worker" => index)),
        });

        if !shared.cas_activity(Activity::Inactive, Activity::Active) {
            logging::error!(shared.log, "worker started twice"; "context" => "start");
            return Worker {
                shared,
                thread: None,
            };
        }

        let runner = shared.clone();
        let thread = thread::spawn(move || runner.run());

        Worker {
            shared,
            thread: Some(thread),
        }
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    /// Handle for the dispatcher, which assigns transactions without
    /// owning the worker.
    #[inline]
    pub fn shared(&self) -> Arc<WorkerShared> {
        self.shared.clone()
    }

    #[inline]
    pub fn assign_transaction(&self, request: &Datagram, socket: Arc<UdpEndpoint>) -> bool {
        self.shared.assign_transaction(request, socket)
    }

    /// Flags the thread for termination and wakes it; returns without
    /// waiting.
    pub fn request_stop(&self) {
        if self.shared.cas_activity(Activity::Active, Activity::Terminating) {
            self.shared.signal.emit();
        }
    }

    /// Stops the thread and joins it.
    pub fn stop(&mut self) {
        self.request_stop();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        self.shared.signal.reset();
    }
}

impl WorkerShared {
    #[inline]
    fn activity(&self) -> Activity {
        Activity::from_u8(self.activity.load(Ordering::Acquire))
    }

    #[inline]
    fn cas_activity(&self, expected: Activity, desired: Activity) -> bool {
        self.activity
            .compare_exchange(
                expected as u8,
                desired as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    fn transaction_state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn store_state(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    fn cas_state(&self, expected: TransactionState, desired: TransactionState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                desired as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.transaction_state() != TransactionState::WaitingForRequest
    }

    /// Called on the dispatcher thread. Snapshots the transaction
    /// identity, processes the initial request synchronously, and wakes
    /// the worker thread for the data/ack phases. Returns false when the
    /// worker could not take the transaction at all.
    pub fn assign_transaction(&self, request: &Datagram, socket: Arc<UdpEndpoint>) -> bool {
        let client_tid = request.source().port();
        let server_tid = socket.local_port();

        if !self.cas_state(
            TransactionState::WaitingForRequest,
            TransactionState::SettingUpRequest,
        ) {
            logging::error!(self.log, "assignment refused";
                            "context" => "assign",
                            "client_tid" => client_tid,
                            "server_tid" => server_tid,
                            "state" => ?self.transaction_state());
            return false;
        }

        let mut ctx = self.ctx.lock().unwrap();
        ctx.reset();
        ctx.client_host = request.source().ip();
        ctx.client_tid = client_tid;
        ctx.server_tid = server_tid;
        ctx.socket = Some(socket);

        if !self.cas_state(
            TransactionState::SettingUpRequest,
            TransactionState::ProcessingRequest,
        ) {
            logging::crit!(self.log, "transaction state changed under setup"; "context" => "assign");
        }

        logging::debug!(self.log, "transaction assigned";
                        "context" => "assign",
                        "client" => %ctx.client_addr(),
                        "server_tid" => server_tid);

        match self.process_request(&mut ctx, request) {
            Ok(()) => self.signal.emit(),
            Err(err) => self.abort(&mut ctx, err),
        }

        true
    }

    fn run(&self) {
        logging::debug!(self.log, "worker thread running"; "context" => "run");
        self.store_state(TransactionState::WaitingForRequest);

        while self.activity() == Activity::Active {
            while self.activity() == Activity::Active
                && self.transaction_state() == TransactionState::WaitingForRequest
            {
                self.signal.wait_timeout(IDLE_WAIT);
            }

            self.process_activity_change();
            self.process_transaction_state();
        }

        self.store_state(TransactionState::Inactive);
        self.activity
            .store(Activity::Inactive as u8, Ordering::Release);

        logging::debug!(self.log, "worker thread exited"; "context" => "run");
    }

    fn process_activity_change(&self) {
        match self.activity() {
            Activity::Active | Activity::Inactive => return,
            Activity::Terminating => {}
        }

        logging::info!(self.log, "processing stop request"; "context" => "stop");

        // Let a dispatcher-side assignment finish before tearing down.
        while matches!(
            self.transaction_state(),
            TransactionState::SettingUpRequest | TransactionState::ProcessingRequest
        ) {
            self.signal.wait_timeout(STOP_WAIT);
        }

        if self.transaction_state() != TransactionState::WaitingForRequest {
            let mut ctx = self.ctx.lock().unwrap();
            self.abort(&mut ctx, TxError::ShuttingDown);
        }

        self.store_state(TransactionState::Terminating);
    }

    fn process_transaction_state(&self) {
        match self.transaction_state() {
            TransactionState::Inactive
            | TransactionState::WaitingForRequest
            | TransactionState::Terminating => {}
            TransactionState::SettingUpRequest | TransactionState::ProcessingRequest => {
                self.signal.wait_timeout(SETUP_WAIT);
            }
            TransactionState::WaitingForData => self.process_waiting_for_data(),
            TransactionState::WaitingForAck => self.process_waiting_for_ack(),
        }
    }


    fn process_request(&self, ctx: &mut TransactionCtx, request: &Datagram) -> Result<(), TxError> {
        if self.transaction_state() != TransactionState::ProcessingRequest {
            return Err(TxError::InvalidState);
        }

        let data = request.data();
        if data.len() < message::MIN_REQUEST_SIZE {
            return Err(TxError::InvalidMessageSize);
        }

        let parsed = match Request::parse(data) {
            Ok(parsed) => parsed,
            Err(WireError::UnknownOpcode(_)) | Err(WireError::UnexpectedOpcode(_)) => {
                return Err(TxError::InvalidOpcode)
            }
            Err(_) => return Err(TxError::InvalidMessageFormat),
        };

        ctx.path = self.security.absolute_from_root(parsed.filename);

        logging::info!(self.log, "request";
                       "context" => "request",
                       "op" => parsed.op.as_str(),
                       "file" => parsed.filename,
                       "mode" => parsed.mode.as_str(),
                       "client" => %ctx.client_addr());

        let validation = match parsed.op {
            OpCode::Rrq => self.security.is_valid_for_read(&ctx.path),
            _ => self.security.is_valid_for_write(&ctx.path),
        };
        validation.map_err(path_error)?;

        if parsed.mode == Mode::Mail {
            return Err(TxError::InvalidMode);
        }

        ctx.operation = Some(parsed.op);
        ctx.ascii = parsed.mode == Mode::Netascii;

        ctx.locked = match parsed.op {
            OpCode::Rrq => self.security.lock_read(&ctx.path),
            _ => self.security.lock_write(&ctx.path),
        };
        if !ctx.locked {
            return Err(TxError::FileLocked);
        }

        match parsed.op {
            OpCode::Wrq => {
                let eol = if ctx.ascii {
                    EolMode::ForceNative
                } else {
                    EolMode::None
                };

                let writer = FileWriter::create(&ctx.path, self.config.block_size, eol)
                    .map_err(|_| TxError::AccessForbidden)?;
                ctx.writer = Some(writer);

                self.store_state(TransactionState::WaitingForData);
                self.send_ack(ctx, 0)?;
            }
            _ => {
                let reader =
                    FileReader::open(&ctx.path).map_err(|_| TxError::AccessForbidden)?;
                ctx.reader = Some(reader);
                ctx.last_ack = 0;

                self.store_state(TransactionState::WaitingForAck);
            }
        }

        Ok(())
    }


    fn process_waiting_for_data(&self) {
        let mut ctx = self.ctx.lock().unwrap();

        let factory = match self.factory.upgrade() {
            Some(factory) => factory,
            None => {
                logging::error!(self.log, "datagram factory gone"; "context" => "data");
                return;
            }
        };

        let socket = match ctx.socket.clone() {
            Some(socket) => socket,
            None => {
                self.abort(&mut ctx, TxError::InvalidState);
                return;
            }
        };

        let mut ready = false;
        let begin = Instant::now();
        while begin.elapsed() < self.config.timeout && self.activity() == Activity::Active {
            match socket.poll(POLL_SLICE_MS) {
                Ok(true) => {
                    ready = true;
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    logging::error!(self.log, "poll failed";
                                    "context" => "data", "error" => ?err);
                    self.abort(&mut ctx, TxError::CriticalServerError);
                    return;
                }
            }
        }

        if self.activity() != Activity::Active {
            return;
        }

        let result = if ready {
            match socket.receive(&factory) {
                Ok(datagram) => self.process_data_message(&mut ctx, &datagram),
                Err(err) => {
                    logging::error!(self.log, "receive failed";
                                    "context" => "data", "error" => ?err);
                    Err(TxError::Timeout)
                }
            }
        } else {
            Err(TxError::Timeout)
        };

        if let Err(err) = result {
            self.abort(&mut ctx, err);
        }
    }

    fn process_data_message(
        &self,
        ctx: &mut TransactionCtx,
        datagram: &Datagram,
    ) -> Result<(), TxError> {
        let data = datagram.data();

        let op = match message::peek_opcode(data) {
            Ok(op) => op,
            Err(WireError::Truncated) => return Err(TxError::InvalidMessageSize),
            Err(_) => return Err(TxError::InvalidOpcode),
        };

        match op {
            OpCode::Data => {}
            OpCode::Error => {
                if let Ok((code, text)) = message::parse_error(data) {
                    logging::info!(self.log, "client aborted transfer";
                                   "context" => "data", "code" => code, "message" => text);
                }
                return Err(TxError::ClientError);
            }
            _ => return Err(TxError::InvalidOpcode),
        }

        let (block, payload) =
            message::parse_data(data).map_err(|_| TxError::InvalidMessageSize)?;
        if payload.len() > self.config.block_size {
            return Err(TxError::InvalidMessageSize);
        }

        let expected = ctx.last_ack.wrapping_add(1);
        if block != expected {
            // Retransmit or stray block: repeat the last ACK, stay put,
            // and let the peer catch up. Nothing is written twice.
            logging::debug!(self.log, "duplicate or out-of-order block";
                            "context" => "data",
                            "block" => block,
                            "expected" => expected);
            let last_ack = ctx.last_ack;
            return self.send_ack(ctx, last_ack);
        }

        let writer = ctx.writer.as_mut().ok_or(TxError::InvalidState)?;
        writer
            .write_block(payload)
            .map_err(|_| TxError::CriticalServerError)?;

        let final_block = payload.len() < self.config.block_size;
        self.send_ack(ctx, block)?;

        logging::trace!(self.log, "block written";
                        "context" => "data",
                        "block" => block,
                        "bytes" => payload.len(),
                        "final" => final_block);

        if final_block {
            let writer = ctx.writer.take().ok_or(TxError::InvalidState)?;
            writer.finalize().map_err(|_| TxError::CriticalServerError)?;
            self.terminate(ctx);
        }

        Ok(())
    }


    fn process_waiting_for_ack(&self) {
        let mut ctx = self.ctx.lock().unwrap();

        let block = ctx.last_ack.wrapping_add(1);
        let (datagram, read) = match self.build_data_block(&mut ctx, block) {
            Ok(built) => built,
            Err(err) => {
                self.abort(&mut ctx, err);
                return;
            }
        };

        let mut attempt = 0u32;
        while self.activity() == Activity::Active {
            if let Err(err) = self.send(&ctx, &datagram) {
                self.abort(&mut ctx, err);
                return;
            }

            match self.wait_for_ack(&mut ctx, block) {
                Ok(true) => {
                    ctx.last_ack = block;

                    logging::trace!(self.log, "block acknowledged";
                                    "context" => "ack",
                                    "block" => block,
                                    "bytes" => read);

                    if read < self.config.block_size {
                        self.terminate(&mut ctx);
                    }
                    return;
                }
                Ok(false) => {
                    // Shutdown noticed mid-wait; the activity handler
                    // sends the final error.
                    return;
                }
                Err(TxError::Timeout) => {
                    if attempt < self.config.retries {
                        attempt += 1;
                        logging::debug!(self.log, "resending block";
                                        "context" => "ack",
                                        "block" => block,
                                        "attempt" => attempt);
                        continue;
                    }
                    self.abort(&mut ctx, TxError::Timeout);
                    return;
                }
                Err(err) => {
                    self.abort(&mut ctx, err);
                    return;
                }
            }
        }
    }

    fn build_data_block(
        &self,
        ctx: &mut TransactionCtx,
        block: u16,
    ) -> Result<(Datagram, usize), TxError> {
        let factory = self.factory.upgrade().ok_or(TxError::ShuttingDown)?;

        let mut assembly = factory.start_assembly();
        if !assembly.is_valid() {
            return Err(TxError::CriticalServerError);
        }

        let header = message::encode_data_header(assembly.data_mut(), block)
            .map_err(|_| TxError::CriticalServerError)?;

        let block_size = self.config.block_size;
        let reader = ctx.reader.as_mut().ok_or(TxError::InvalidState)?;
        let read = reader
            .read_block(&mut assembly.data_mut()[header..header + block_size])
            .map_err(|_| TxError::CriticalServerError)?;

        assembly
            .set_data_size(header + read)
            .set_destination(ctx.client_addr());

        let datagram = assembly.finalize().ok_or(TxError::CriticalServerError)?;
        Ok((datagram, read))
    }

    /// Ok(true) when the expected ACK arrived, Ok(false) when shutdown
    /// interrupted the wait. A stale ACK block number reads as a timeout
    /// so the caller's resend loop covers the lost-ACK case.
    fn wait_for_ack(&self, ctx: &mut TransactionCtx, expected: u16) -> Result<bool, TxError> {
        let factory = self.factory.upgrade().ok_or(TxError::ShuttingDown)?;
        let socket = ctx.socket.clone().ok_or(TxError::InvalidState)?;

        let mut ready = false;
        let begin = Instant::now();
        while begin.elapsed() < self.config.timeout && self.activity() == Activity::Active {
            match socket.poll(POLL_SLICE_MS) {
                Ok(true) => {
                    ready = true;
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    logging::error!(self.log, "poll failed";
                                    "context" => "ack", "error" => ?err);
                    return Err(TxError::CriticalServerError);
                }
            }
        }

        if self.activity() != Activity::Active {
            return Ok(false);
        }

        if !ready {
            return Err(TxError::Timeout);
        }

        let datagram = match socket.receive(&factory) {
            Ok(datagram) => datagram,
            Err(NetError::WouldBlock) => return Err(TxError::Timeout),
            Err(err) => {
                logging::error!(self.log, "receive failed";
                                "context" => "ack", "error" => ?err);
                return Err(TxError::Timeout);
            }
        };

        let data = datagram.data();
        let op = message::peek_opcode(data).map_err(|_| TxError::InvalidMessageFormat)?;

        match op {
            OpCode::Ack => {
                let block = message::parse_ack(data).map_err(|_| TxError::InvalidMessageFormat)?;
                if block != expected {
                    logging::debug!(self.log, "stale ack";
                                    "context" => "ack",
                                    "block" => block,
                                    "expected" => expected);
                    return Err(TxError::Timeout);
                }
                Ok(true)
            }
            OpCode::Error => {
                if let Ok((code, text)) = message::parse_error(data) {
                    logging::info!(self.log, "client aborted transfer";
                                   "context" => "ack", "code" => code, "message" => text);
                }
                Err(TxError::ClientError)
            }
            _ => Err(TxError::InvalidOpcode),
        }
    }


    fn send_ack(&self, ctx: &mut TransactionCtx, block: u16) -> Result<(), TxError> {
        let datagram = self.build_message(ctx, |buffer| message::encode_ack(buffer, block))?;
        self.send(ctx, &datagram)?;
        ctx.last_ack = block;

        logging::trace!(self.log, "ack sent"; "context" => "send", "block" => block);
        Ok(())
    }

    fn build_message<F>(&self, ctx: &TransactionCtx, write: F) -> Result<Datagram, TxError>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let factory = self.factory.upgrade().ok_or(TxError::ShuttingDown)?;

        let mut assembly = factory.start_assembly();
        if !assembly.is_valid() {
            return Err(TxError::CriticalServerError);
        }

        let size = write(assembly.data_mut()).map_err(|_| TxError::CriticalServerError)?;
        assembly
            .set_data_size(size)
            .set_destination(ctx.client_addr());

        assembly.finalize().ok_or(TxError::CriticalServerError)
    }

    fn send(&self, ctx: &TransactionCtx, datagram: &Datagram) -> Result<(), TxError> {
        let socket = ctx.socket.as_ref().ok_or(TxError::InvalidState)?;

        if !socket.is_bound() {
            return Err(TxError::CriticalServerError);
        }

        socket
            .send(datagram)
            .map_err(|_| TxError::CriticalServerError)?;
        Ok(())
    }

    /// Aborts the current transaction, telling the peer why unless the
    /// peer errored first.
    fn abort(&self, ctx: &mut TransactionCtx, err: TxError) {
        logging::info!(self.log, "aborting transaction";
                       "context" => "abort",
                       "error" => ?err,
                       "client" => %ctx.client_addr());

        if let Some((code, text)) = wire_error(err) {
            // Best effort; the peer may already be gone.
            if let Ok(datagram) =
                self.build_message(ctx, |buffer| message::encode_error(buffer, code, text))
            {
                let _ = self.send(ctx, &datagram);
            }
        }

        self.terminate(ctx);
    }

    /// Releases every per-transaction resource, notifies the dispatcher,
    /// and returns to the idle state.
    fn terminate(&self, ctx: &mut TransactionCtx) {
        logging::debug!(self.log, "terminating transaction";
                        "context" => "terminate",
                        "client" => %ctx.client_addr(),
                        "server_tid" => ctx.server_tid);

        // An unfinalized writer removes its temp file here.
        ctx.writer = None;
        ctx.reader = None;
        ctx.socket = None;

        if ctx.locked {
            match ctx.operation {
                Some(OpCode::Rrq) => {
                    self.security.unlock_read(&ctx.path);
                }
                Some(_) => {
                    self.security.unlock_write(&ctx.path);
                }
                None => {}
            }
            ctx.locked = false;
        }

        let termination = Termination {
            client_tid: ctx.client_tid,
            server_tid: ctx.server_tid,
        };
        if self.terminations.push(termination).is_err() {
            logging::error!(self.log, "termination ring full"; "context" => "terminate");
        }

        self.store_state(TransactionState::WaitingForRequest);
    }
}
