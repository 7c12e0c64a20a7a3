//! Readiness-driven I/O loop multiplexing many connections on one thread.
//!
//! Each registered [`Service`] owns a non-blocking socket. The loop waits on
//! `mio::Poll`, turns readiness into [`LoopEvent`]s and hands them to the
//! service. Other threads talk to the loop through a command queue and a
//! `mio::Waker`: registering a service, asking for a write on its behalf, or
//! removing it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::{PgError, PgResult};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// What happened to a service's channel.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// The non-blocking connect finished.
    Connected,
    Readable,
    Writable,
    /// The socket reported an error.
    Failed(PgError),
    /// Another thread asked the loop to look at this service.
    Notified,
    /// A timer scheduled through [`LoopContext::schedule`] expired.
    Timer,
}

/// Access to loop facilities during a dispatch.
pub struct LoopContext<'a> {
    token: Token,
    now: Instant,
    timers: &'a mut BinaryHeap<Reverse<(Instant, Token)>>,
}

impl LoopContext<'_> {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Deliver [`LoopEvent::Timer`] to this service after `delay`.
    pub fn schedule(&mut self, delay: Duration) {
        self.timers.push(Reverse((self.now + delay, self.token)));
    }
}

/// A connection-like object driven by the loop.
pub trait Service: Send {
    /// The socket to watch. `None` only while the service is tearing down.
    fn source(&mut self) -> Option<&mut TcpStream>;

    /// Readiness the service currently wants.
    fn interest(&self) -> Interest;

    /// Whether the socket is still completing its non-blocking connect.
    fn is_connecting(&self) -> bool;

    fn dispatch(&mut self, event: LoopEvent, cx: &mut LoopContext<'_>) -> PgResult<()>;

    /// Called with errors returned from (or panics inside) `dispatch`.
    fn on_error(&mut self, err: PgError, cx: &mut LoopContext<'_>);

    /// Once true the service is deregistered and dropped.
    fn is_finished(&self) -> bool;
}

/// Snapshot of loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub registrations: u64,
    pub active_services: usize,
    pub events_dispatched: u64,
    pub errors_handled: u64,
    /// Distinct registrations that received at least one dispatch.
    pub serviced_connections: u64,
}

enum Command {
    Register(Token, Box<dyn Service>),
    Notify(Token),
    Deregister(Token),
}

struct Shared {
    name: String,
    waker: Waker,
    poll: Mutex<Option<Poll>>,
    commands: Mutex<VecDeque<Command>>,
    stopping: AtomicBool,
    next_token: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
    registrations: AtomicU64,
    active: AtomicUsize,
    events: AtomicU64,
    errors: AtomicU64,
    serviced: AtomicU64,
}

impl Shared {
    fn push(&self, command: Command) {
        self.commands.lock().push_back(command);
        if let Err(e) = self.waker.wake() {
            warn!(loop_name = %self.name, error = %e, "failed to wake event loop");
        }
    }
}

/// Shared handle to an I/O loop. Clones refer to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new(name: &str) -> PgResult<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                waker,
                poll: Mutex::new(Some(poll)),
                commands: Mutex::new(VecDeque::new()),
                stopping: AtomicBool::new(false),
                next_token: AtomicUsize::new(0),
                thread: Mutex::new(None),
                registrations: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                events: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                serviced: AtomicU64::new(0),
            }),
        })
    }

    /// Create a loop and start it on its own thread.
    pub fn start(name: &str) -> PgResult<Self> {
        let event_loop = Self::new(name)?;
        event_loop.spawn()?;
        Ok(event_loop)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Build a service around `channel` and hand it to the loop thread.
    pub fn register<S, F>(&self, channel: TcpStream, factory: F) -> PgResult<LoopHandle>
    where
        S: Service + 'static,
        F: FnOnce(TcpStream) -> S,
    {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(PgError::ConnectionClosed);
        }
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let service = factory(channel);
        self.shared.push(Command::Register(token, Box::new(service)));
        Ok(LoopHandle {
            token,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Run on a named background thread.
    pub fn spawn(&self) -> PgResult<()> {
        let event_loop = self.clone();
        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || {
                if let Err(e) = event_loop.run() {
                    error!(loop_name = %event_loop.shared.name, error = %e, "event loop terminated");
                }
            })?;
        *self.shared.thread.lock() = Some(handle);
        Ok(())
    }

    /// Ask the loop to exit. Callable from any thread.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!(loop_name = %self.shared.name, error = %e, "failed to wake event loop");
        }
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LoopStats {
        let s = &self.shared;
        LoopStats {
            registrations: s.registrations.load(Ordering::Relaxed),
            active_services: s.active.load(Ordering::Relaxed),
            events_dispatched: s.events.load(Ordering::Relaxed),
            errors_handled: s.errors.load(Ordering::Relaxed),
            serviced_connections: s.serviced.load(Ordering::Relaxed),
        }
    }

    /// Process readiness on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) -> PgResult<()> {
        let mut poll = self
            .shared
            .poll
            .lock()
            .take()
            .ok_or_else(|| PgError::Config("event loop is already running".to_string()))?;

        info!(loop_name = %self.shared.name, "event loop started");
        let result = Driver::new(&self.shared).run(&mut poll);
        info!(loop_name = %self.shared.name, "event loop stopped");
        result
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A registered service's link back to its loop.
#[derive(Clone)]
pub struct LoopHandle {
    token: Token,
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Wake the loop and dispatch [`LoopEvent::Notified`] to the service,
    /// which typically queues output and asks for write interest.
    pub fn request_write(&self) {
        self.shared.push(Command::Notify(self.token));
    }

    /// Drop the service without further dispatches.
    pub fn deregister(&self) {
        self.shared.push(Command::Deregister(self.token));
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("loop", &self.shared.name)
            .field("token", &self.token.0)
            .finish()
    }
}

// ============================================================================
// Loop internals
// ============================================================================

struct Registered {
    service: Box<dyn Service>,
    interest: Interest,
    serviced: bool,
}

/// State owned by the loop thread for one run.
struct Driver<'a> {
    shared: &'a Shared,
    services: HashMap<Token, Registered>,
    timers: BinaryHeap<Reverse<(Instant, Token)>>,
}

impl<'a> Driver<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            services: HashMap::new(),
            timers: BinaryHeap::new(),
        }
    }

    fn run(&mut self, poll: &mut Poll) -> PgResult<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        let result = loop {
            if self.shared.stopping.load(Ordering::Acquire) {
                break Ok(());
            }

            self.drain_commands(poll.registry());

            let timeout = self
                .timers
                .peek()
                .map(|Reverse((at, _))| at.saturating_duration_since(Instant::now()));

            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break Err(PgError::from(e));
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.handle_readiness(poll.registry(), event);
            }

            self.expire_timers(poll.registry());
        };

        self.shutdown(poll.registry());
        result
    }

    fn drain_commands(&mut self, registry: &Registry) {
        let commands: Vec<Command> = self.shared.commands.lock().drain(..).collect();
        let mut notified = HashSet::new();
        let mut notify_order = Vec::new();

        for command in commands {
            match command {
                Command::Register(token, service) => self.add(registry, token, service),
                Command::Notify(token) => {
                    if notified.insert(token) {
                        notify_order.push(token);
                    }
                }
                Command::Deregister(token) => self.remove(registry, token),
            }
        }

        for token in notify_order {
            self.dispatch(registry, token, LoopEvent::Notified);
        }
    }

    fn add(&mut self, registry: &Registry, token: Token, mut service: Box<dyn Service>) {
        self.shared.registrations.fetch_add(1, Ordering::Relaxed);
        let interest = service.interest();

        let registered = match service.source() {
            Some(source) => registry.register(source, token, interest),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "service has no socket")),
        };

        if let Err(e) = registered {
            warn!(loop_name = %self.shared.name, token = token.0, error = %e, "registration failed");
            self.shared.errors.fetch_add(1, Ordering::Relaxed);
            let mut cx = LoopContext {
                token,
                now: Instant::now(),
                timers: &mut self.timers,
            };
            service.on_error(PgError::from(e), &mut cx);
            return;
        }

        debug!(loop_name = %self.shared.name, token = token.0, "service registered");
        self.shared.active.fetch_add(1, Ordering::Relaxed);
        self.services.insert(
            token,
            Registered {
                service,
                interest,
                serviced: false,
            },
        );
        // Services may have queued work (or timers) before registration
        self.dispatch(registry, token, LoopEvent::Notified);
    }

    fn remove(&mut self, registry: &Registry, token: Token) {
        if let Some(mut reg) = self.services.remove(&token) {
            if let Some(source) = reg.service.source() {
                let _ = registry.deregister(source);
            }
            self.shared.active.fetch_sub(1, Ordering::Relaxed);
            debug!(loop_name = %self.shared.name, token = token.0, "service removed");
        }
    }

    fn handle_readiness(&mut self, registry: &Registry, event: &Event) {
        let token = event.token();
        let Some(reg) = self.services.get_mut(&token) else {
            trace!(token = token.0, "readiness for unknown token");
            return;
        };

        if reg.service.is_connecting() {
            let status = match reg.service.source() {
                Some(sock) => connect_status(sock),
                None => Ok(false),
            };
            match status {
                Ok(true) => self.dispatch(registry, token, LoopEvent::Connected),
                Ok(false) => return,
                Err(e) => {
                    self.dispatch(registry, token, LoopEvent::Failed(PgError::Connect(e.to_string())));
                    return;
                }
            }
        }

        if event.is_error() {
            let cause = self
                .services
                .get_mut(&token)
                .and_then(|reg| reg.service.source())
                .and_then(|sock| sock.take_error().ok().flatten())
                .map(PgError::from)
                .unwrap_or_else(|| PgError::from(io::Error::from(io::ErrorKind::ConnectionReset)));
            self.dispatch(registry, token, LoopEvent::Failed(cause));
            return;
        }

        if event.is_readable() || event.is_read_closed() {
            self.dispatch(registry, token, LoopEvent::Readable);
        }
        if event.is_writable() {
            self.dispatch(registry, token, LoopEvent::Writable);
        }
    }

    fn expire_timers(&mut self, registry: &Registry) {
        let now = Instant::now();
        while let Some(Reverse((at, token))) = self.timers.peek().copied() {
            if at > now {
                break;
            }
            self.timers.pop();
            self.dispatch(registry, token, LoopEvent::Timer);
        }
    }

    fn dispatch(&mut self, registry: &Registry, token: Token, event: LoopEvent) {
        let Some(reg) = self.services.get_mut(&token) else {
            return;
        };

        if !reg.serviced {
            reg.serviced = true;
            self.shared.serviced.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.events.fetch_add(1, Ordering::Relaxed);

        let mut cx = LoopContext {
            token,
            now: Instant::now(),
            timers: &mut self.timers,
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| reg.service.dispatch(event, &mut cx)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(PgError::Protocol(format!(
                "service panicked: {}",
                panic_message(&*panic)
            ))),
        };

        if let Some(err) = failure {
            self.shared.errors.fetch_add(1, Ordering::Relaxed);
            debug!(loop_name = %self.shared.name, token = token.0, error = %err, "service error");
            let handled = catch_unwind(AssertUnwindSafe(|| reg.service.on_error(err, &mut cx)));
            if handled.is_err() {
                error!(loop_name = %self.shared.name, token = token.0, "error handler panicked");
                self.remove(registry, token);
                return;
            }
        }

        self.reconcile(registry, token);
    }

    /// Apply interest changes and drop finished services.
    fn reconcile(&mut self, registry: &Registry, token: Token) {
        let Some(reg) = self.services.get_mut(&token) else {
            return;
        };

        if reg.service.is_finished() {
            self.remove(registry, token);
            return;
        }

        let wanted = reg.service.interest();
        if wanted != reg.interest {
            let result = match reg.service.source() {
                Some(source) => registry.reregister(source, token, wanted),
                None => Ok(()),
            };
            match result {
                Ok(()) => reg.interest = wanted,
                Err(e) => {
                    warn!(token = token.0, error = %e, "reregister failed");
                    let mut cx = LoopContext {
                        token,
                        now: Instant::now(),
                        timers: &mut self.timers,
                    };
                    reg.service.on_error(PgError::from(e), &mut cx);
                    if reg.service.is_finished() {
                        self.remove(registry, token);
                    }
                }
            }
        }
    }

    fn shutdown(&mut self, registry: &Registry) {
        let tokens: Vec<Token> = self.services.keys().copied().collect();
        for token in tokens {
            if let Some(reg) = self.services.get_mut(&token) {
                let mut cx = LoopContext {
                    token,
                    now: Instant::now(),
                    timers: &mut self.timers,
                };
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    reg.service.on_error(PgError::ConnectionClosed, &mut cx)
                }));
            }
            self.remove(registry, token);
        }

        // Services registered after the last drain never ran
        let pending: Vec<Command> = self.shared.commands.lock().drain(..).collect();
        for command in pending {
            if let Command::Register(token, mut service) = command {
                let mut cx = LoopContext {
                    token,
                    now: Instant::now(),
                    timers: &mut self.timers,
                };
                service.on_error(PgError::ConnectionClosed, &mut cx);
            }
        }
    }
}

/// Whether a non-blocking connect has finished, or why it failed.
fn connect_status(sock: &TcpStream) -> io::Result<bool> {
    if let Some(e) = sock.take_error()? {
        return Err(e);
    }
    match sock.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    /// Echo client: writes a greeting once connected and reports what it reads.
    struct Recorder {
        sock: TcpStream,
        connecting: bool,
        greeting: Option<Vec<u8>>,
        events: mpsc::Sender<String>,
        panic_on_notify: bool,
        finished: bool,
    }

    impl Service for Recorder {
        fn source(&mut self) -> Option<&mut TcpStream> {
            Some(&mut self.sock)
        }

        fn interest(&self) -> Interest {
            if self.connecting || self.greeting.is_some() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            }
        }

        fn is_connecting(&self) -> bool {
            self.connecting
        }

        fn dispatch(&mut self, event: LoopEvent, cx: &mut LoopContext<'_>) -> PgResult<()> {
            match event {
                LoopEvent::Connected => {
                    self.connecting = false;
                    let _ = self.events.send("connected".into());
                }
                LoopEvent::Writable => {
                    if let Some(greeting) = self.greeting.take() {
                        self.sock.write_all(&greeting)?;
                    }
                }
                LoopEvent::Readable => {
                    let mut buf = [0u8; 64];
                    loop {
                        match self.sock.read(&mut buf) {
                            Ok(0) => {
                                self.finished = true;
                                break;
                            }
                            Ok(n) => {
                                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                                let _ = self.events.send(format!("read:{}", text));
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                LoopEvent::Notified => {
                    if self.panic_on_notify {
                        self.panic_on_notify = false;
                        panic!("boom");
                    }
                    cx.schedule(Duration::from_millis(5));
                }
                LoopEvent::Timer => {
                    let _ = self.events.send("timer".into());
                }
                LoopEvent::Failed(e) => return Err(e),
            }
            Ok(())
        }

        fn on_error(&mut self, err: PgError, _cx: &mut LoopContext<'_>) {
            let _ = self.events.send(format!("error:{}", err));
        }

        fn is_finished(&self) -> bool {
            self.finished
        }
    }

    fn recorder(
        event_loop: &EventLoop,
        addr: std::net::SocketAddr,
        panic_on_notify: bool,
    ) -> (LoopHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let sock = TcpStream::connect(addr).unwrap();
        let handle = event_loop
            .register(sock, |sock| Recorder {
                sock,
                connecting: true,
                greeting: Some(b"ping".to_vec()),
                events: tx,
                panic_on_notify,
                finished: false,
            })
            .unwrap();
        (handle, rx)
    }

    fn wait_for(rx: &mpsc::Receiver<String>, wanted: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(msg) = rx.recv_timeout(Duration::from_millis(100)) {
                if msg.starts_with(wanted) {
                    return;
                }
            }
        }
        panic!("did not observe {}", wanted);
    }

    #[test]
    fn test_connect_write_read_and_timer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let event_loop = EventLoop::start("test-loop").unwrap();

        let (handle, rx) = recorder(&event_loop, addr, false);
        let (mut server, _) = listener.accept().unwrap();

        wait_for(&rx, "connected");
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        wait_for(&rx, "read:pong");

        handle.request_write();
        wait_for(&rx, "timer");

        event_loop.stop();
        let stats = event_loop.stats();
        assert_eq!(stats.registrations, 1);
        assert_eq!(stats.serviced_connections, 1);
        assert!(stats.events_dispatched >= 3);
    }

    #[test]
    fn test_panic_is_routed_to_on_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let event_loop = EventLoop::start("panic-loop").unwrap();

        let (_handle, rx) = recorder(&event_loop, addr, true);
        let (mut server, _) = listener.accept().unwrap();

        wait_for(&rx, "error:Protocol error: service panicked: boom");

        // The loop keeps running after the panic
        server.write_all(b"still here").unwrap();
        wait_for(&rx, "read:still here");

        event_loop.stop();
        assert!(event_loop.stats().errors_handled >= 1);
    }

    #[test]
    fn test_stop_notifies_services() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let event_loop = EventLoop::start("stop-loop").unwrap();

        let (_handle, rx) = recorder(&event_loop, addr, false);
        let _server = listener.accept().unwrap();
        wait_for(&rx, "connected");

        event_loop.stop();
        wait_for(&rx, "error:Connection is closed");
        assert!(event_loop.register(TcpStream::connect(addr).unwrap(), |sock| Recorder {
            sock,
            connecting: true,
            greeting: None,
            events: mpsc::channel().0,
            panic_on_notify: false,
            finished: false,
        })
        .is_err());
    }

    #[test]
    fn test_run_twice_concurrently_rejected() {
        let event_loop = EventLoop::new("double").unwrap();
        let _poll = event_loop.shared.poll.lock().take();
        assert!(matches!(event_loop.run(), Err(PgError::Config(_))));
    }
}
