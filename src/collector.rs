//! Periodic collect-and-send loop with a cooperative stop flag.

use crate::config::{Destination, Settings};
use crate::error::ConfigError;
use crate::logging::{StatusEvent, StatusLine};
use crate::metrics::SensorAggregator;
use crate::transport::{DatagramSocket, TelemetryTransport, TransportConfig, DEFAULT_PORT};
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularity of the inter-cycle wait; bounds how late a stop is noticed.
const STOP_POLL: Duration = Duration::from_millis(100);

type AggregatorFactory = Box<dyn FnOnce(Ipv4Addr) -> SensorAggregator + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorOptions {
    pub port: u16,
    pub interval: Duration,
    pub transport: TransportConfig,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            interval: Duration::from_secs(5),
            transport: TransportConfig::default(),
        }
    }
}

impl From<&Settings> for CollectorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            port: settings.port,
            interval: settings.interval,
            transport: settings.transport,
        }
    }
}

/// Front-end entry point: validates the receiver and starts the worker.
pub struct Collector {
    options: CollectorOptions,
    build: AggregatorFactory,
}

impl Collector {
    /// `build` runs once on the worker thread, so slow GPU probing never
    /// blocks the caller.
    pub fn new<F>(options: CollectorOptions, build: F) -> Self
    where
        F: FnOnce(Ipv4Addr) -> SensorAggregator + Send + 'static,
    {
        Self {
            options,
            build: Box::new(build),
        }
    }

    /// Validate `destination` and spawn the collector thread.
    pub fn start(self, destination: &str) -> Result<CollectorHandle, ConfigError> {
        let destination = Destination::parse(destination)?;
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        // First line the operator sees, before any cycle runs.
        let _ = tx.send(StatusLine::now(StatusEvent::Started(destination)));
        log::info!("Collector started, sending to {}:{}", destination, self.options.port);

        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("compmon-collector".into())
            .spawn(move || {
                let collector = self.into_loop(destination);
                collector.run(&worker_stop, &tx);
            })
            .map_err(ConfigError::Io)?;

        Ok(CollectorHandle {
            stop,
            statuses: Some(rx),
            worker: Some(worker),
        })
    }

    /// Validate `destination` and run exactly one cycle on this thread.
    pub fn run_once(self, destination: &str) -> Result<StatusLine, ConfigError> {
        let destination = Destination::parse(destination)?;
        let mut collector = self.into_loop(destination);
        Ok(collector.cycle())
    }

    fn into_loop(self, destination: Destination) -> CollectorLoop<UdpSocket> {
        let aggregator = (self.build)(destination.addr());
        let mut transport: TelemetryTransport<UdpSocket> =
            TelemetryTransport::new(self.options.transport);
        transport.set_destination(destination.addr());
        if let Err(e) = transport.initialize(self.options.port) {
            // Every send reports "Service not started." until restart.
            log::warn!("{}", e);
        }
        CollectorLoop::new(aggregator, transport, self.options.interval)
    }
}

/// Owned by the front end; the worker owns everything else.
pub struct CollectorHandle {
    stop: Arc<AtomicBool>,
    statuses: Option<Receiver<StatusLine>>,
    worker: Option<JoinHandle<()>>,
}

impl CollectorHandle {
    /// Request a stop. Takes effect between cycles, never mid-send.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// The per-cycle status lines. Can be taken once.
    pub fn take_statuses(&mut self) -> Option<Receiver<StatusLine>> {
        self.statuses.take()
    }

    /// Wait for the worker to finish its current cycle and exit.
    pub fn join(mut self) -> thread::Result<()> {
        match self.worker.take() {
            Some(worker) => worker.join(),
            None => Ok(()),
        }
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One collector's state: the aggregator (with its counter table) and the
/// transport (with its socket). Single owner, no locking.
pub struct CollectorLoop<S: DatagramSocket = UdpSocket> {
    aggregator: SensorAggregator,
    transport: TelemetryTransport<S>,
    interval: Duration,
}

impl<S: DatagramSocket> CollectorLoop<S> {
    pub fn new(aggregator: SensorAggregator, transport: TelemetryTransport<S>, interval: Duration) -> Self {
        Self {
            aggregator,
            transport,
            interval,
        }
    }

    /// Snapshot, serialize, send.
    pub fn cycle(&mut self) -> StatusLine {
        let started = Instant::now();
        let snapshot = self.aggregator.snapshot();
        let event = match snapshot.to_payload() {
            Ok(payload) => {
                log::trace!("payload: {}", String::from_utf8_lossy(&payload));
                StatusEvent::Delivered(self.transport.send(&payload))
            }
            Err(e) => StatusEvent::EncodeFailed(e.to_string()),
        };

        match &event {
            StatusEvent::Delivered(outcome) if outcome.is_sent() => {
                log::info!("{} ({:?})", outcome, started.elapsed())
            }
            other => log::warn!("{}", other),
        }
        StatusLine::now(event)
    }

    /// Cycle until `stop` is set, checking it only between cycles.
    pub fn run(mut self, stop: &AtomicBool, statuses: &Sender<StatusLine>) {
        while !stop.load(Ordering::SeqCst) {
            let line = self.cycle();
            if statuses.send(line).is_err() {
                log::debug!("status receiver dropped");
            }
            wait_unless_stopped(self.interval, stop);
        }
        log::info!("Collector stopped");
        let _ = statuses.send(StatusLine::now(StatusEvent::Stopped));
    }
}

fn wait_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}
