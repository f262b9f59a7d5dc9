//! TCP connection manager
//!
//! Accepts sensor connections up to a fixed budget, runs one handler thread per
//! connection and inserts the end-of-stream marker once every handler is done.
//!
//! Each handler cycles through three fields per reading:
//!
//! ```text
//! AwaitId -> ReadValue -> ReadTimestamp -> insert, back to AwaitId
//!    \___________\______________\______ closed  -> ClosedConnection event
//!                                 \____ timeout -> Timeout event
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::buffer::SharedBuffer;
use crate::error::GatewayError;
use crate::event::{Event, EventKind, EventSender};
use crate::metrics;
use crate::reading::Reading;
use crate::transport::{RecvOutcome, SensorListener, SensorStream};

/// Sleep between accept polls while no sensor is connecting
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How a connection handler ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Closed,
    TimedOut,
}

/// What one handler did before it terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    /// Id from the first reading; `None` if the peer never sent one
    pub sensor_id: Option<u16>,
    pub readings: u64,
    pub outcome: ConnectionOutcome,
}

/// Totals over every handler of one run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub connections: usize,
    pub closed: usize,
    pub timed_out: usize,
    pub readings: u64,
}

impl ConnectionSummary {
    /// Fold one handler result in, passing a fatal error through
    fn record(
        &mut self,
        result: Result<ConnectionReport, GatewayError>,
    ) -> Result<(), GatewayError> {
        let report = result.inspect_err(|e| error!(error = %e, "Connection handler failed"))?;
        self.connections += 1;
        self.readings += report.readings;
        match report.outcome {
            ConnectionOutcome::Closed => self.closed += 1,
            ConnectionOutcome::TimedOut => self.timed_out += 1,
        }
        Ok(())
    }
}

/// Live connection counters shared with the health server
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    accepted: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionStats {
    pub fn new(max_connections: usize) -> Self {
        Self {
            accepted: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// True while the connection budget still allows new sensors
    pub fn is_accepting(&self) -> bool {
        self.accepted() < self.max_connections
    }

    fn on_accept(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::inc_connections_accepted();
    }

    fn on_exit(&self, reason: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics::connection_terminated(reason);
    }
}

/// Reads readings from one sensor connection into the shared buffer
pub struct ConnectionHandler {
    stream: SensorStream,
    buffer: Arc<SharedBuffer>,
    events: EventSender,
    timeout: Duration,
    sensor_id: Option<u16>,
    readings: u64,
}

impl ConnectionHandler {
    pub fn new(
        stream: SensorStream,
        buffer: Arc<SharedBuffer>,
        events: EventSender,
        timeout: Duration,
    ) -> Self {
        Self {
            stream,
            buffer,
            events,
            timeout,
            sensor_id: None,
            readings: 0,
        }
    }

    /// Run until the peer closes or times out.
    /// Returns an error only for transport failures other than close/timeout.
    pub fn run(mut self) -> Result<ConnectionReport, GatewayError> {
        let peer = self.stream.peer_addr();
        debug!(%peer, "Connection handler started");

        let outcome = loop {
            let id = match self.read_field::<2>()? {
                Ok(bytes) => u16::from_le_bytes(bytes),
                Err(end) => break end,
            };
            if self.sensor_id.is_none() {
                self.sensor_id = Some(id);
                self.events.send(Event::sensor(EventKind::NewConnection, id));
                info!(%peer, sensor_id = id, "Sensor node connected");
            }

            let value = match self.read_field::<8>()? {
                Ok(bytes) => f64::from_le_bytes(bytes),
                Err(end) => break end,
            };
            let timestamp = match self.read_field::<8>()? {
                Ok(bytes) => i64::from_le_bytes(bytes),
                Err(end) => break end,
            };

            let reading = Reading::new(id, value, timestamp);
            if reading.is_sentinel() {
                warn!(%peer, "Dropping reading with reserved sensor id 0");
                continue;
            }
            debug!(sensor_id = id, value, timestamp, "Reading received");
            self.buffer.insert(reading)?;
            self.readings += 1;
            metrics::inc_readings_ingested();
        };

        let id = self.sensor_id.unwrap_or(0);
        match outcome {
            ConnectionOutcome::Closed => {
                info!(%peer, sensor_id = id, readings = self.readings, "Peer closed connection");
                self.events.send(Event::sensor(EventKind::ClosedConnection, id));
            }
            ConnectionOutcome::TimedOut => {
                info!(%peer, sensor_id = id, readings = self.readings, "Peer timed out");
                self.events.send(Event::sensor(EventKind::Timeout, id));
            }
        }

        self.stream.close();
        Ok(ConnectionReport {
            sensor_id: self.sensor_id,
            readings: self.readings,
            outcome,
        })
    }

    /// Read one fixed-width field. The inner `Err` carries a terminal state.
    fn read_field<const N: usize>(
        &mut self,
    ) -> Result<Result<[u8; N], ConnectionOutcome>, GatewayError> {
        let mut buf = [0u8; N];
        let field = match self.stream.recv_exact(&mut buf, self.timeout)? {
            RecvOutcome::Complete => Ok(buf),
            RecvOutcome::Closed => Err(ConnectionOutcome::Closed),
            RecvOutcome::TimedOut => Err(ConnectionOutcome::TimedOut),
        };
        Ok(field)
    }
}

/// Accept loop with a fixed connection budget
pub struct ConnectionManager {
    listener: SensorListener,
    buffer: Arc<SharedBuffer>,
    events: EventSender,
    timeout: Duration,
    stats: ConnectionStats,
}

impl ConnectionManager {
    pub fn new(
        listener: SensorListener,
        buffer: Arc<SharedBuffer>,
        events: EventSender,
        stats: ConnectionStats,
        timeout: Duration,
    ) -> Self {
        Self {
            listener,
            buffer,
            events,
            timeout,
            stats,
        }
    }

    /// Handle to the live counters (for the health server)
    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// Serve exactly `max_connections` connections, then close the listener and
    /// insert the end-of-stream marker once every handler has finished.
    ///
    /// A handler transport error, accept error or spawn failure is fatal: the
    /// manager stops accepting at once, abandons the handlers still running,
    /// inserts the marker so the consumers can drain, and returns that error.
    pub fn run(self) -> Result<ConnectionSummary, GatewayError> {
        let max = self.stats.max_connections();
        info!(max_connections = max, "Connection manager started");

        self.listener.set_nonblocking(true)?;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut summary = ConnectionSummary::default();
        let mut spawned = 0usize;
        let mut finished = 0usize;
        let mut first_error: Option<GatewayError> = None;

        while spawned < max && first_error.is_none() {
            while let Ok(result) = done_rx.try_recv() {
                finished += 1;
                if let Err(e) = summary.record(result) {
                    first_error = Some(e);
                    break;
                }
            }
            if first_error.is_some() {
                break;
            }

            let stream = match self.listener.try_accept() {
                Ok(Some(stream)) => stream,
                Ok(None) => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    first_error = Some(e.into());
                    break;
                }
            };
            debug!(peer = %stream.peer_addr(), "Incoming sensor connection");
            self.stats.on_accept();

            let handler = ConnectionHandler::new(
                stream,
                Arc::clone(&self.buffer),
                self.events.clone(),
                self.timeout,
            );
            let stats = self.stats.clone();
            let tx = done_tx.clone();
            let spawned_thread = thread::Builder::new()
                .name(format!("conn-{}", spawned))
                .spawn(move || {
                    let result = handler.run();
                    let reason = match &result {
                        Ok(report) if report.outcome == ConnectionOutcome::Closed => "closed",
                        Ok(_) => "timeout",
                        Err(_) => "error",
                    };
                    stats.on_exit(reason);
                    let _ = tx.send(result);
                });

            match spawned_thread {
                Ok(_) => spawned += 1,
                Err(e) => {
                    error!(error = %e, "Failed to spawn connection handler");
                    self.stats.on_exit("error");
                    first_error = Some(GatewayError::Spawn("connection handler", e));
                }
            }
        }

        // Only handler threads hold senders now; a closed channel means one panicked
        drop(done_tx);

        if first_error.is_none() {
            info!(connections = spawned, "Connection budget reached, waiting for handlers");
        }
        while first_error.is_none() && finished < spawned {
            match done_rx.blocking_recv() {
                Some(result) => {
                    finished += 1;
                    if let Err(e) = summary.record(result) {
                        first_error = Some(e);
                    }
                }
                None => {
                    error!("Connection handler panicked");
                    first_error = Some(GatewayError::ThreadPanicked("connection handler"));
                }
            }
        }

        drop(self.listener);
        info!("Server is shutting down, listener closed");

        if first_error.is_some() && finished < spawned {
            warn!(
                abandoned = spawned - finished,
                "Fatal connection error, not waiting for remaining handlers"
            );
        }
        self.buffer.insert_sentinel()?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Cursor;
    use crate::event::{self, EventReceiver};
    use crate::error::TransportError;
    use crate::transport::SensorClient;
    use std::net::SocketAddr;
    use std::thread::JoinHandle;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn start(max: usize) -> (
        SocketAddr,
        Arc<SharedBuffer>,
        EventReceiver,
        ConnectionStats,
        JoinHandle<Result<ConnectionSummary, GatewayError>>,
    ) {
        let listener = SensorListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let buffer = Arc::new(SharedBuffer::new());
        let (tx, rx) = event::channel();
        let manager = ConnectionManager::new(
            listener,
            Arc::clone(&buffer),
            tx,
            ConnectionStats::new(max),
            TIMEOUT,
        );
        let stats = manager.stats();
        let handle = thread::spawn(move || manager.run());
        (addr, buffer, rx, stats, handle)
    }

    fn drain_events(rx: &mut EventReceiver) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn drain_buffer(buffer: &SharedBuffer) -> Vec<Reading> {
        let mut cursor = Cursor::new();
        let mut out = Vec::new();
        while let Some(r) = buffer.read(&mut cursor).unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_readings_inserted_then_closed() {
        let (addr, buffer, mut rx, stats, handle) = start(1);

        let mut client = SensorClient::connect(addr).unwrap();
        client.send_reading(&Reading::new(15, 21.5, 1000)).unwrap();
        client.send_reading(&Reading::new(15, 22.0, 1001)).unwrap();
        client.close().unwrap();

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.connections, 1);
        assert_eq!(summary.closed, 1);
        assert_eq!(summary.readings, 2);
        assert_eq!(stats.accepted(), 1);
        assert_eq!(stats.active(), 0);
        assert!(!stats.is_accepting());

        let readings = drain_buffer(&buffer);
        assert_eq!(
            readings,
            vec![
                Reading::new(15, 21.5, 1000),
                Reading::new(15, 22.0, 1001),
                Reading::SENTINEL
            ]
        );

        let events = drain_events(&mut rx);
        assert_eq!(
            events,
            vec![
                Event::sensor(EventKind::NewConnection, 15),
                Event::sensor(EventKind::ClosedConnection, 15),
            ]
        );
    }

    #[test]
    fn test_partial_reading_times_out() {
        let (addr, buffer, mut rx, _stats, handle) = start(1);

        let mut client = SensorClient::connect(addr).unwrap();
        client.send(&42u16.to_le_bytes()).unwrap();
        client.send(&19.5f64.to_le_bytes()).unwrap();
        // No timestamp: the handler must give up after the field timeout

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.readings, 0);

        assert_eq!(drain_buffer(&buffer), vec![Reading::SENTINEL]);
        assert_eq!(
            drain_events(&mut rx),
            vec![
                Event::sensor(EventKind::NewConnection, 42),
                Event::sensor(EventKind::Timeout, 42),
            ]
        );
        drop(client);
    }

    #[test]
    fn test_new_connection_event_emitted_once() {
        let (addr, _buffer, mut rx, _stats, handle) = start(1);

        let mut client = SensorClient::connect(addr).unwrap();
        for ts in 0..5 {
            client.send_reading(&Reading::new(8, 15.0, ts)).unwrap();
        }
        client.close().unwrap();
        handle.join().unwrap().unwrap();

        let events = drain_events(&mut rx);
        let opened = events
            .iter()
            .filter(|e| e.kind == EventKind::NewConnection)
            .count();
        assert_eq!(opened, 1);
    }

    #[test]
    fn test_sentinel_waits_for_all_handlers() {
        let (addr, buffer, _rx, _stats, handle) = start(2);

        let mut fast = SensorClient::connect(addr).unwrap();
        let mut slow = SensorClient::connect(addr).unwrap();

        fast.send_reading(&Reading::new(1, 10.0, 1)).unwrap();
        fast.close().unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(!buffer.is_terminated(), "marker must wait for the slow handler");

        slow.send_reading(&Reading::new(2, 20.0, 2)).unwrap();
        slow.close().unwrap();

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.connections, 2);

        let readings = drain_buffer(&buffer);
        assert_eq!(readings.len(), 3);
        assert!(readings[2].is_sentinel());
        assert_eq!(readings.iter().filter(|r| r.is_sentinel()).count(), 1);
    }

    #[test]
    fn test_reserved_id_is_dropped() {
        let (addr, buffer, _rx, _stats, handle) = start(1);

        let mut client = SensorClient::connect(addr).unwrap();
        client.send_reading(&Reading::new(0, 0.0, 0)).unwrap();
        client.send_reading(&Reading::new(5, 11.0, 3)).unwrap();
        client.close().unwrap();

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.readings, 1);
        assert_eq!(
            drain_buffer(&buffer),
            vec![Reading::new(5, 11.0, 3), Reading::SENTINEL]
        );
    }

    #[test]
    fn test_close_before_first_reading() {
        let (addr, buffer, mut rx, _stats, handle) = start(1);

        let client = SensorClient::connect(addr).unwrap();
        client.close().unwrap();

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.closed, 1);
        assert_eq!(drain_buffer(&buffer), vec![Reading::SENTINEL]);
        assert_eq!(
            drain_events(&mut rx),
            vec![Event::sensor(EventKind::ClosedConnection, 0)]
        );
    }

    #[test]
    fn test_reset_is_fatal_without_waiting_for_budget() {
        let (addr, buffer, mut rx, stats, handle) = start(2);

        let mut client = SensorClient::connect(addr).unwrap();
        client.send(&9u16.to_le_bytes()).unwrap();
        client.abort().unwrap();

        // The second connection never arrives
        let deadline = Instant::now() + Duration::from_secs(3);
        while !handle.is_finished() {
            assert!(Instant::now() < deadline, "manager still waiting for connections");
            thread::sleep(Duration::from_millis(10));
        }

        let result = handle.join().unwrap();
        assert!(matches!(
            result,
            Err(GatewayError::Transport(TransportError::Receive(_)))
        ));
        assert_eq!(stats.accepted(), 1);
        assert_eq!(stats.active(), 0);
        assert!(buffer.is_terminated());
        assert_eq!(drain_buffer(&buffer), vec![Reading::SENTINEL]);
        assert_eq!(
            drain_events(&mut rx),
            vec![Event::sensor(EventKind::NewConnection, 9)]
        );
    }

    #[test]
    fn test_reset_does_not_wait_for_busy_handlers() {
        use std::sync::atomic::AtomicBool;

        let (addr, buffer, _rx, _stats, handle) = start(3);

        // Streams readings until told to stop, so its handler never ends by itself
        let stop = Arc::new(AtomicBool::new(false));
        let mut busy = SensorClient::connect(addr).unwrap();
        let busy_stop = Arc::clone(&stop);
        let sender = thread::spawn(move || {
            let mut ts = 0;
            while !busy_stop.load(Ordering::Relaxed) {
                if busy.send_reading(&Reading::new(3, 18.0, ts)).is_err() {
                    break;
                }
                ts += 1;
                thread::sleep(Duration::from_millis(20));
            }
        });

        thread::sleep(Duration::from_millis(100));
        let mut failing = SensorClient::connect(addr).unwrap();
        failing.send(&4u16.to_le_bytes()).unwrap();
        failing.abort().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while !handle.is_finished() {
            assert!(Instant::now() < deadline, "manager waited on a busy handler");
            thread::sleep(Duration::from_millis(10));
        }
        stop.store(true, Ordering::Relaxed);
        sender.join().unwrap();

        assert!(matches!(
            handle.join().unwrap(),
            Err(GatewayError::Transport(TransportError::Receive(_)))
        ));
        assert!(buffer.is_terminated());
    }
}
