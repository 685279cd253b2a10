//! The server: configuration, lifecycle, and the control-port dispatch
//! loop. One dispatcher thread receives requests on the well-known port,
//! admits them against the transaction record table, binds a transaction
//! socket to an ephemeral port (the server TID) and hands the request to
//! an idle worker. Workers report finished transactions through their
//! termination rings, drained at the top of every dispatch iteration.

use crate::datagram::{Datagram, DatagramFactory};
use crate::logging;
use crate::message::{self, ErrorCode, OpCode};
use crate::ring::SpscRing;
use crate::security::{FileSecurity, Policy};
use crate::socket::UdpEndpoint;
use crate::support::{NetError, ServerError};
use crate::worker::{Termination, Worker, WorkerConfig, WorkerShared, DEFAULT_RETRIES, DEFAULT_TIMEOUT};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CONTROL_POLL_MS: u32 = 100;
const TRANSITION_WAIT: Duration = Duration::from_millis(100);
const ALLOCATION_BACKOFF: Duration = Duration::from_millis(100);
const TERMINATION_RING_SIZE: usize = 4;
const POOL_BUFFERS_PER_WORKER: usize = 8;

/// One in-flight transfer slot, keyed by `(clientTID, serverTID)`. The
/// record table lives on the dispatcher thread; workers reach it only
/// through their termination rings.
struct TransactionRecord {
    socket_id: usize,
    client_tid: u16,
    server_tid: u16,
    is_active: bool,
}

impl TransactionRecord {
    fn new() -> TransactionRecord {
        TransactionRecord {
            socket_id: 0,
            client_tid: 0,
            server_tid: 0,
            is_active: false,
        }
    }
}

pub struct Server {
    port: u16,
    host: String,
    root: PathBuf,
    timeout: Duration,
    thread_count: usize,
    block_size: usize,
    pool_size: usize,
    retries: u32,
    log: logging::Logger,

    running: Arc<AtomicBool>,
    starting: AtomicBool,
    stopping: Arc<AtomicBool>,
    runtime: Mutex<Option<Runtime>>,
}

struct Runtime {
    control: Arc<UdpEndpoint>,
    sockets: Vec<Arc<UdpEndpoint>>,
    /// Keeps the buffer pools alive until every worker has joined;
    /// workers only hold weak references.
    _factory: Arc<DatagramFactory>,
    workers: Vec<Worker>,
    dispatch: Option<thread::JoinHandle<()>>,
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Server {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        Server {
            port: message::DEFAULT_PORT,
            host: "0.0.0.0".to_string(),
            root: PathBuf::new(),
            timeout: DEFAULT_TIMEOUT,
            thread_count: 1,
            block_size: message::DEFAULT_BLOCK_SIZE,
            pool_size: 0,
            retries: DEFAULT_RETRIES,
            log,
            running: Arc::new(AtomicBool::new(false)),
            starting: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
            runtime: Mutex::new(None),
        }
    }


    pub fn set_port(&mut self, port: u16) -> &mut Server {
        self.port = port;
        self
    }

    pub fn set_host(&mut self, host: &str) -> &mut Server {
        self.host = host.to_string();
        self
    }

    pub fn set_root_directory<P: Into<PathBuf>>(&mut self, root: P) -> &mut Server {
        self.root = root.into();
        self
    }

    /// Per-block wait before a transfer is abandoned.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Server {
        self.timeout = timeout;
        self
    }

    /// Number of worker threads, and with it the maximum number of
    /// concurrent transfers.
    pub fn set_thread_count(&mut self, count: usize) -> &mut Server {
        self.thread_count = count.max(1);
        self
    }

    pub fn set_block_size(&mut self, size: usize) -> &mut Server {
        self.block_size = size;
        self
    }

    /// Datagram pool size; 0 derives it from the worker count.
    pub fn set_pool_size(&mut self, size: usize) -> &mut Server {
        self.pool_size = size;
        self
    }

    pub fn set_retries(&mut self, retries: u32) -> &mut Server {
        self.retries = retries;
        self
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The bound control port; useful when configured with port 0.
    pub fn local_port(&self) -> Option<u16> {
        let runtime = self.runtime.lock().unwrap();
        runtime.as_ref().map(|runtime| runtime.control.local_port())
    }


    /// Idempotent; a concurrent stop is waited out first.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.is_running() || self.starting.load(Ordering::Acquire) {
            logging::info!(self.log, "server is already running"; "context" => "start");
            return Ok(());
        }

        while self.stopping.load(Ordering::Acquire) {
            logging::info!(self.log, "waiting for stop to finish"; "context" => "start");
            thread::sleep(TRANSITION_WAIT);
        }

        if self.starting.swap(true, Ordering::AcqRel) {
            logging::info!(self.log, "server is already starting"; "context" => "start");
            return Ok(());
        }

        let result = self.start_inner();
        self.starting.store(false, Ordering::Release);

        if let Err(ref err) = result {
            logging::error!(self.log, "start failed"; "context" => "start", "error" => ?err);
        }

        result
    }

    fn start_inner(&self) -> Result<(), ServerError> {
        if self.root.as_os_str().is_empty() {
            return Err(ServerError::RootNotSet);
        }
        if !self.root.exists() {
            return Err(ServerError::RootMissing(self.root.clone()));
        }
        if !self.root.is_dir() {
            return Err(ServerError::RootNotADirectory(self.root.clone()));
        }

        let security = Arc::new(
            FileSecurity::new(self.root.clone())
                .creation_policy(Policy::Allow)
                .overwrite_policy(Policy::Allow),
        );

        let pool_size = if self.pool_size > 0 {
            self.pool_size
        } else {
            self.thread_count * POOL_BUFFERS_PER_WORKER
        };
        let factory = DatagramFactory::new(pool_size);

        let control = Arc::new(UdpEndpoint::new(&self.log));
        control.bind(&self.host, self.port)?;

        let mut sockets = Vec::with_capacity(self.thread_count);
        let mut workers = Vec::with_capacity(self.thread_count);
        let mut shareds = Vec::with_capacity(self.thread_count);
        let mut rings = Vec::with_capacity(self.thread_count);

        for index in 0..self.thread_count {
            sockets.push(Arc::new(UdpEndpoint::new(&self.log)));

            let ring = Arc::new(SpscRing::new(TERMINATION_RING_SIZE));
            let worker = Worker::start(
                WorkerConfig {
                    index,
                    block_size: self.block_size,
                    timeout: self.timeout,
                    retries: self.retries,
                },
                security.clone(),
                Arc::downgrade(&factory),
                ring.clone(),
                &self.log,
            );

            shareds.push(worker.shared());
            workers.push(worker);
            rings.push(ring);
        }

        let records = (0..self.thread_count)
            .map(|_| TransactionRecord::new())
            .collect();

        let dispatcher = Dispatcher {
            host: self.host.clone(),
            control: control.clone(),
            sockets: sockets.clone(),
            factory: factory.clone(),
            workers: shareds,
            rings,
            records,
            running: self.running.clone(),
            stopping: self.stopping.clone(),
            log: self.log.new(logging::o!()),
        };
        let dispatch = thread::spawn(move || dispatcher.run());

        let mut runtime = self.runtime.lock().unwrap();
        *runtime = Some(Runtime {
            control,
            sockets,
            _factory: factory,
            workers,
            dispatch: Some(dispatch),
        });

        logging::info!(self.log, "server started";
                       "context" => "start",
                       "root" => %self.root.display(),
                       "workers" => self.thread_count);
        Ok(())
    }

    /// Idempotent; joins the dispatcher and every worker, then unbinds
    /// all sockets and releases the pools.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            logging::info!(self.log, "server is already stopping"; "context" => "stop");
            return;
        }

        while self.starting.load(Ordering::Acquire) {
            logging::info!(self.log, "waiting for start to finish"; "context" => "stop");
            thread::sleep(TRANSITION_WAIT);
        }

        let runtime = self.runtime.lock().unwrap().take();
        if let Some(mut runtime) = runtime {
            if let Some(dispatch) = runtime.dispatch.take() {
                let _ = dispatch.join();
            }

            for worker in &runtime.workers {
                worker.request_stop();
            }
            for worker in &mut runtime.workers {
                worker.stop();
            }

            for socket in &runtime.sockets {
                let _ = socket.unbind();
            }
            let _ = runtime.control.unbind();

            logging::info!(self.log, "server stopped"; "context" => "stop");
        }

        self.stopping.store(false, Ordering::Release);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the dispatch thread owns. Records are plain data here;
/// nothing else touches them.
struct Dispatcher {
    host: String,
    control: Arc<UdpEndpoint>,
    sockets: Vec<Arc<UdpEndpoint>>,
    factory: Arc<DatagramFactory>,
    workers: Vec<Arc<WorkerShared>>,
    rings: Vec<Arc<SpscRing<Termination>>>,
    records: Vec<TransactionRecord>,
    running: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Dispatcher {
    fn run(mut self) {
        self.running.store(true, Ordering::Release);
        logging::info!(self.log, "dispatcher running";
                       "context" => "dispatch",
                       "port" => self.control.local_port());

        while !self.stopping.load(Ordering::Acquire) {
            self.drain_terminations();

            match self.control.poll(CONTROL_POLL_MS) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    logging::error!(self.log, "control poll failed";
                                    "context" => "dispatch", "error" => ?err);
                    thread::sleep(ALLOCATION_BACKOFF);
                    continue;
                }
            }

            let datagram = match self.control.receive(&self.factory) {
                Ok(datagram) => datagram,
                Err(NetError::NoBuffers) => {
                    logging::error!(self.log, "out of datagram buffers, backing off";
                                    "context" => "dispatch");
                    thread::sleep(ALLOCATION_BACKOFF);
                    continue;
                }
                Err(NetError::WouldBlock) => continue,
                Err(err) => {
                    logging::error!(self.log, "control receive failed";
                                    "context" => "dispatch", "error" => ?err);
                    continue;
                }
            };

            self.process_datagram(&datagram);
        }

        self.drain_terminations();
        self.running.store(false, Ordering::Release);
        logging::info!(self.log, "dispatcher exited"; "context" => "dispatch");
    }

    /// A malformed datagram never takes the dispatcher down; it is
    /// logged and dropped.
    fn process_datagram(&mut self, datagram: &Datagram) {
        let op = match message::peek_opcode(datagram.data()) {
            Ok(op) => op,
            Err(err) => {
                logging::info!(self.log, "ignoring malformed datagram";
                               "context" => "dispatch",
                               "source" => %datagram.source(),
                               "error" => ?err);
                return;
            }
        };

        logging::debug!(self.log, "control receive";
                        "context" => "dispatch",
                        "op" => op.as_str(),
                        "source" => %datagram.source());

        match op {
            OpCode::Rrq | OpCode::Wrq => self.admit(datagram),
            OpCode::Ack => {
                // ACKs belong on a transaction socket; a stray one here
                // means a confused or late peer.
                match message::parse_ack(datagram.data()) {
                    Ok(block) => {
                        logging::info!(self.log, "ignoring stray ack";
                                       "context" => "dispatch", "block" => block);
                    }
                    Err(_) => {
                        logging::info!(self.log, "ignoring malformed ack"; "context" => "dispatch");
                    }
                }
            }
            _ => {
                logging::info!(self.log, "ignoring unexpected message";
                               "context" => "dispatch", "op" => op.as_str());
            }
        }
    }

    fn admit(&mut self, request: &Datagram) {
        let record_id = match self.free_record() {
            Some(record_id) => record_id,
            None => {
                logging::info!(self.log, "rejecting request, all transfer slots busy";
                               "context" => "admit",
                               "source" => %request.source());
                self.reject(request);
                return;
            }
        };

        let socket_id = match self.free_socket() {
            Some(socket_id) => socket_id,
            None => {
                logging::error!(self.log, "free record but no free socket";
                                "context" => "admit");
                self.reject(request);
                return;
            }
        };

        let socket = self.sockets[socket_id].clone();
        if let Err(err) = socket.bind(&self.host, 0) {
            logging::error!(self.log, "transaction socket bind failed";
                            "context" => "admit", "error" => ?err);
            self.reject(request);
            return;
        }

        let client_tid = request.source().port();
        let server_tid = socket.local_port();

        let worker = match self.workers.iter().find(|worker| !worker.is_busy()) {
            Some(worker) => worker,
            None => {
                logging::error!(self.log, "no idle worker for transaction";
                                "context" => "admit",
                                "client_tid" => client_tid,
                                "server_tid" => server_tid);
                let _ = socket.unbind();
                self.reject(request);
                return;
            }
        };

        {
            let record = &mut self.records[record_id];
            record.socket_id = socket_id;
            record.client_tid = client_tid;
            record.server_tid = server_tid;
            record.is_active = true;
        }

        if !worker.assign_transaction(request, socket) {
            // The worker slipped into another state between the scan and
            // the handoff; roll the admission back.
            self.records[record_id].is_active = false;
            let _ = self.sockets[socket_id].unbind();
            logging::error!(self.log, "assignment rolled back";
                            "context" => "admit",
                            "client_tid" => client_tid,
                            "server_tid" => server_tid);
        }
    }

    fn free_record(&self) -> Option<usize> {
        self.records.iter().position(|record| !record.is_active)
    }

    fn free_socket(&self) -> Option<usize> {
        self.sockets.iter().position(|socket| !socket.is_bound())
    }

    /// Control-port rejection when no transfer slot is free.
    fn reject(&self, request: &Datagram) {
        let mut buffer = [0u8; 64];
        let size = match message::encode_error(
            &mut buffer,
            ErrorCode::Undefined,
            "no free transfer slots",
        ) {
            Ok(size) => size,
            Err(_) => return,
        };

        match self.factory.build_response(&buffer[..size], request) {
            Some(response) => {
                if let Err(err) = self.control.send(&response) {
                    logging::error!(self.log, "rejection send failed";
                                    "context" => "admit", "error" => ?err);
                }
            }
            None => {
                logging::error!(self.log, "out of buffers for rejection"; "context" => "admit");
            }
        }
    }

    /// Workers post `(clientTID, serverTID)` when they finish; freeing
    /// the record and unbinding the socket both happen here so the
    /// admission view stays consistent.
    fn drain_terminations(&mut self) {
        for ring in &self.rings {
            while let Some(termination) = ring.pop() {
                let found = self.records.iter().position(|record| {
                    record.is_active
                        && record.client_tid == termination.client_tid
                        && record.server_tid == termination.server_tid
                });

                match found {
                    Some(index) => {
                        let socket_id = self.records[index].socket_id;
                        let _ = self.sockets[socket_id].unbind();
                        self.records[index].is_active = false;

                        logging::debug!(self.log, "transaction record freed";
                                        "context" => "dispatch",
                                        "client_tid" => termination.client_tid,
                                        "server_tid" => termination.server_tid);
                    }
                    None => {
                        logging::error!(self.log, "termination for unknown transaction";
                                        "context" => "dispatch",
                                        "client_tid" => termination.client_tid,
                                        "server_tid" => termination.server_tid);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Mode;
    use std::fs;
    use std::net::{SocketAddr, UdpSocket};
    use std::path::Path;

    struct TestServer {
        server: Server,
        root: tempfile::TempDir,
    }

    impl TestServer {
        fn start(thread_count: usize, timeout: Duration) -> TestServer {
            let root = tempfile::tempdir().unwrap();

            let mut server = Server::new(None);
            server
                .set_port(0)
                .set_host("127.0.0.1")
                .set_root_directory(root.path())
                .set_thread_count(thread_count)
                .set_timeout(timeout)
                .set_retries(1);
            server.start().unwrap();

            TestServer { server, root }
        }

        fn control_addr(&self) -> SocketAddr {
            let port = self.server.local_port().unwrap();
            SocketAddr::new("127.0.0.1".parse().unwrap(), port)
        }

        fn path(&self, name: &str) -> std::path::PathBuf {
            self.root.path().join(name)
        }
    }

    fn client() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        socket
    }

    fn send_request(socket: &UdpSocket, to: SocketAddr, op: OpCode, filename: &str, mode: Mode) {
        let mut buffer = [0u8; 128];
        let size = message::encode_request(&mut buffer, op, filename, mode).unwrap();
        socket.send_to(&buffer[..size], to).unwrap();
    }

    fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buffer = [0u8; 1024];
        let (count, from) = socket.recv_from(&mut buffer).unwrap();
        (buffer[..count].to_vec(), from)
    }

    fn send_data(socket: &UdpSocket, to: SocketAddr, block: u16, payload: &[u8]) {
        let mut buffer = vec![0u8; 4 + payload.len()];
        let header = message::encode_data_header(&mut buffer, block).unwrap();
        buffer[header..].copy_from_slice(payload);
        socket.send_to(&buffer, to).unwrap();
    }

    fn send_ack(socket: &UdpSocket, to: SocketAddr, block: u16) {
        let mut buffer = [0u8; 4];
        let size = message::encode_ack(&mut buffer, block).unwrap();
        socket.send_to(&buffer[..size], to).unwrap();
    }

    fn wait_for_file(path: &Path) -> Vec<u8> {
        for _ in 0..100 {
            if path.exists() {
                return fs::read(path).unwrap();
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("file {:?} never appeared", path);
    }

    #[test]
    fn test_happy_read() {
        let rig = TestServer::start(2, Duration::from_secs(1));
        fs::write(rig.path("hello.txt"), b"hello\n").unwrap();

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Rrq,
            "hello.txt",
            Mode::Octet,
        );

        let (bytes, from) = recv(&client);
        // The reply comes from a fresh ephemeral port, not the control port.
        assert_ne!(from, rig.control_addr());

        let (block, payload) = message::parse_data(&bytes).unwrap();
        assert_eq!(block, 1);
        assert_eq!(payload, b"hello\n");

        send_ack(&client, from, 1);

        // The transfer ended (6 < 512), so the slot frees up and the
        // same file can be fetched again.
        thread::sleep(Duration::from_millis(300));
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Rrq,
            "hello.txt",
            Mode::Octet,
        );
        let (bytes, from) = recv(&client);
        let (block, payload) = message::parse_data(&bytes).unwrap();
        assert_eq!(block, 1);
        assert_eq!(payload, b"hello\n");
        send_ack(&client, from, 1);

        rig.server.stop();
    }

    #[test]
    fn test_happy_write() {
        let rig = TestServer::start(2, Duration::from_secs(1));

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Wrq,
            "out.bin",
            Mode::Octet,
        );

        let (bytes, server) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 0);

        send_data(&client, server, 1, &[0xAB; 512]);
        let (bytes, _) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 1);

        send_data(&client, server, 2, &[0xCD; 10]);
        let (bytes, _) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 2);

        let contents = wait_for_file(&rig.path("out.bin"));
        assert_eq!(contents.len(), 522);
        assert!(contents[..512].iter().all(|&b| b == 0xAB));
        assert!(contents[512..].iter().all(|&b| b == 0xCD));

        rig.server.stop();
    }

    #[test]
    fn test_path_escape_gets_access_violation() {
        let rig = TestServer::start(1, Duration::from_secs(1));

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Rrq,
            "../outside.txt",
            Mode::Octet,
        );

        let (bytes, _) = recv(&client);
        let (code, text) = message::parse_error(&bytes).unwrap();
        assert_eq!(code, ErrorCode::AccessViolation as u16);
        assert_eq!(text, "Access violation");

        rig.server.stop();
    }

    #[test]
    fn test_write_timeout_leaves_no_file() {
        let rig = TestServer::start(1, Duration::from_millis(300));

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Wrq,
            "out.bin",
            Mode::Octet,
        );

        let (bytes, _) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 0);

        // Send nothing; the server must give up on its own.
        let (bytes, _) = recv(&client);
        let (code, text) = message::parse_error(&bytes).unwrap();
        assert_eq!(code, ErrorCode::Undefined as u16);
        assert_eq!(text, "transaction timed out");

        thread::sleep(Duration::from_millis(100));
        assert!(!rig.path("out.bin").exists());

        rig.server.stop();
    }

    #[test]
    fn test_duplicate_data_is_acked_once_more_not_written_twice() {
        let rig = TestServer::start(1, Duration::from_secs(1));

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Wrq,
            "dup.bin",
            Mode::Octet,
        );

        let (bytes, server) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 0);

        send_data(&client, server, 1, &[0x11; 512]);
        let (bytes, _) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 1);

        // Pretend the first ACK was lost and retransmit block 1.
        send_data(&client, server, 1, &[0x11; 512]);
        let (bytes, _) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 1);

        send_data(&client, server, 2, &[0x22; 5]);
        let (bytes, _) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 2);

        let contents = wait_for_file(&rig.path("dup.bin"));
        assert_eq!(contents.len(), 517);

        rig.server.stop();
    }

    #[test]
    fn test_admission_rejected_when_all_slots_busy() {
        let rig = TestServer::start(1, Duration::from_secs(2));

        // Occupy the only slot with a write that never finishes.
        let holder = client();
        send_request(
            &holder,
            rig.control_addr(),
            OpCode::Wrq,
            "held.bin",
            Mode::Octet,
        );
        let (bytes, _) = recv(&holder);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 0);

        let latecomer = client();
        send_request(
            &latecomer,
            rig.control_addr(),
            OpCode::Rrq,
            "held.bin",
            Mode::Octet,
        );

        let (bytes, from) = recv(&latecomer);
        // Admission rejections come from the control port itself.
        assert_eq!(from, rig.control_addr());
        let (code, text) = message::parse_error(&bytes).unwrap();
        assert_eq!(code, ErrorCode::Undefined as u16);
        assert_eq!(text, "no free transfer slots");

        rig.server.stop();
    }

    #[cfg(unix)]
    #[test]
    fn test_netascii_write_passes_crlf_and_keeps_native_lf() {
        let rig = TestServer::start(1, Duration::from_secs(1));

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Wrq,
            "text.txt",
            Mode::Netascii,
        );

        let (bytes, server) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 0);

        send_data(&client, server, 1, b"a\nb\r\nc\n");
        let (bytes, _) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 1);

        let contents = wait_for_file(&rig.path("text.txt"));
        assert_eq!(contents, b"a\nb\r\nc\n");

        rig.server.stop();
    }

    #[test]
    fn test_nonexistent_file_read_gets_file_not_found() {
        let rig = TestServer::start(1, Duration::from_secs(1));

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Rrq,
            "missing.bin",
            Mode::Octet,
        );

        let (bytes, _) = recv(&client);
        let (code, text) = message::parse_error(&bytes).unwrap();
        assert_eq!(code, ErrorCode::FileNotFound as u16);
        assert_eq!(text, "File not found");

        rig.server.stop();
    }

    #[test]
    fn test_stray_ack_on_control_port_is_ignored() {
        let rig = TestServer::start(1, Duration::from_secs(1));

        let client = client();
        send_ack(&client, rig.control_addr(), 7);

        // The server stays healthy and still serves requests.
        fs::write(rig.path("alive.txt"), b"ok").unwrap();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Rrq,
            "alive.txt",
            Mode::Octet,
        );

        let (bytes, from) = recv(&client);
        let (block, payload) = message::parse_data(&bytes).unwrap();
        assert_eq!(block, 1);
        assert_eq!(payload, b"ok");
        send_ack(&client, from, 1);

        rig.server.stop();
    }

    #[test]
    fn test_multi_block_read() {
        let rig = TestServer::start(1, Duration::from_secs(1));

        let mut content = vec![0x5A; 512];
        content.extend_from_slice(&[0xA5; 100]);
        fs::write(rig.path("big.bin"), &content).unwrap();

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Rrq,
            "big.bin",
            Mode::Octet,
        );

        let (bytes, server) = recv(&client);
        let (block, payload) = message::parse_data(&bytes).unwrap();
        assert_eq!(block, 1);
        assert_eq!(payload.len(), 512);
        send_ack(&client, server, 1);

        let (bytes, _) = recv(&client);
        let (block, payload) = message::parse_data(&bytes).unwrap();
        assert_eq!(block, 2);
        assert_eq!(payload, &[0xA5; 100][..]);
        send_ack(&client, server, 2);

        rig.server.stop();
    }

    #[test]
    fn test_lost_ack_triggers_data_retransmit() {
        let rig = TestServer::start(1, Duration::from_millis(300));

        fs::write(rig.path("retry.bin"), b"payload").unwrap();

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Rrq,
            "retry.bin",
            Mode::Octet,
        );

        // Withhold the ACK; the same block must arrive again.
        let (first, server) = recv(&client);
        let (second, _) = recv(&client);
        assert_eq!(first, second);

        let (block, payload) = message::parse_data(&second).unwrap();
        assert_eq!(block, 1);
        assert_eq!(payload, b"payload");

        send_ack(&client, server, 1);

        rig.server.stop();
    }

    #[test]
    fn test_wrong_opcode_mid_write_is_illegal_operation() {
        let rig = TestServer::start(1, Duration::from_secs(1));

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Wrq,
            "out.bin",
            Mode::Octet,
        );

        let (bytes, server) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 0);

        // An ACK has no business on the write path.
        send_ack(&client, server, 0);

        let (bytes, _) = recv(&client);
        let (code, _) = message::parse_error(&bytes).unwrap();
        assert_eq!(code, ErrorCode::IllegalOperation as u16);

        thread::sleep(Duration::from_millis(100));
        assert!(!rig.path("out.bin").exists());

        rig.server.stop();
    }

    #[test]
    fn test_client_error_aborts_write_without_reply() {
        let rig = TestServer::start(1, Duration::from_millis(300));

        let client = client();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Wrq,
            "aborted.bin",
            Mode::Octet,
        );

        let (bytes, server) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 0);

        send_data(&client, server, 1, &[0x42; 512]);
        let (bytes, _) = recv(&client);
        assert_eq!(message::parse_ack(&bytes).unwrap(), 1);

        // The client gives up; the server must not answer the ERROR.
        let mut buffer = [0u8; 64];
        let size =
            message::encode_error(&mut buffer, ErrorCode::Undefined, "user cancelled").unwrap();
        client.send_to(&buffer[..size], server).unwrap();

        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut scratch = [0u8; 64];
        assert!(client.recv_from(&mut scratch).is_err());

        // No partial file survives the abort.
        assert!(!rig.path("aborted.bin").exists());

        rig.server.stop();
    }

    #[test]
    fn test_oack_and_short_datagrams_are_ignored() {
        let rig = TestServer::start(1, Duration::from_secs(1));

        let client = client();
        // A truncated datagram and an OACK, neither of which may faze
        // the dispatcher.
        client.send_to(&[0x01], rig.control_addr()).unwrap();
        client
            .send_to(&[0x00, 0x06, 0x00], rig.control_addr())
            .unwrap();

        fs::write(rig.path("still-up.txt"), b"yes").unwrap();
        send_request(
            &client,
            rig.control_addr(),
            OpCode::Rrq,
            "still-up.txt",
            Mode::Octet,
        );

        let (bytes, from) = recv(&client);
        let (block, payload) = message::parse_data(&bytes).unwrap();
        assert_eq!(block, 1);
        assert_eq!(payload, b"yes");
        send_ack(&client, from, 1);

        rig.server.stop();
    }

    #[test]
    fn test_start_stop_cycle() {
        let root = tempfile::tempdir().unwrap();

        let mut server = Server::new(None);
        server
            .set_port(0)
            .set_host("127.0.0.1")
            .set_root_directory(root.path());

        server.start().unwrap();
        let first_port = server.local_port().unwrap();
        assert!(first_port != 0);

        server.stop();
        assert!(server.local_port().is_none());

        // Starting again binds a fresh control socket.
        server.start().unwrap();
        assert!(server.local_port().is_some());
        server.stop();
    }

    #[test]
    fn test_start_without_root_fails() {
        let server = Server::new(None);
        match server.start() {
            Err(ServerError::RootNotSet) => {}
            other => panic!("unexpected start result: {:?}", other),
        }
    }
}
