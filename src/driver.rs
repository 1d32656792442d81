//! Ties a [`Handler`] to a [`Device`] and drives the byte-at-a-time loop.
//!
//! Two shapes share the same [`Driver::run_once`] core: an embedded/polled
//! caller invokes it directly from its own loop, while the `threaded`
//! feature wraps it in a background thread with a queue-backed, blocking
//! `transmit()`.
//!
//! The handler never calls [`Device::send`] itself — it emits outbound
//! bytes through its `bus_write` callback instead. [`Driver::new`] wires
//! that callback to the same device it reads from, sharing it behind an
//! `Arc<Mutex<D>>` so the closure captured by the handler and the
//! driver's own read loop can both reach it without `D` needing to be
//! `Clone`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::consts::{ACK_TIMEOUT_MS, BUS_TIMEOUT_MS, DEFAULT_ACCESS_TIMEOUT_US, DEFAULT_OPEN_RETRY_MAX};
use crate::device::{Device, RecvOutcome};
use crate::error::ErrorKind;
use crate::handler::{CycleOutcome, Handler, State};
use crate::queue::{Completion, OutboundRequest, RequestQueue};

/// Owns the handler and device, polls the queue for work, and reports
/// completed/failed/lost cycles back to their originating [`Completion`].
pub struct Driver<D> {
    handler: Handler,
    device: Arc<Mutex<D>>,
    queue: Arc<RequestQueue>,
    current: Option<(Vec<u8>, Arc<Completion>)>,
    open_retry_max: u8,
    access_timeout_us: u16,
}

impl<D> std::fmt::Debug for Driver<D> {
    /// The device itself isn't `Debug`-bound by [`Device`], so only the
    /// handler and the driver's own scheduling state are printed.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("handler", &self.handler)
            .field("open_retry_max", &self.open_retry_max)
            .field("access_timeout_us", &self.access_timeout_us)
            .finish_non_exhaustive()
    }
}

impl<D: Device + Send + 'static> Driver<D> {
    /// Builds a driver for bus address `address` over `device`. The device
    /// is not opened yet; call [`Driver::open`]. The handler's write
    /// callback is wired to this same device automatically — write and
    /// read share one half-duplex line, as the wire itself does.
    pub fn new(address: u8, device: D) -> Self {
        let device = Arc::new(Mutex::new(device));
        let mut handler = Handler::new(address);
        let write_device = device.clone();
        handler.set_bus_write_callback(move |byte| {
            if let Err(e) = write_device.lock().unwrap().send(byte) {
                log::error!("bus write failed: {e}");
            }
        });
        Driver {
            handler,
            device,
            queue: Arc::new(RequestQueue::new()),
            current: None,
            open_retry_max: DEFAULT_OPEN_RETRY_MAX,
            access_timeout_us: DEFAULT_ACCESS_TIMEOUT_US,
        }
    }

    /// Direct access to the handler, to register callbacks before the loop
    /// starts running.
    pub fn handler_mut(&mut self) -> &mut Handler {
        &mut self.handler
    }

    /// A clone of the request queue handle, shareable with other threads
    /// so they can enqueue work without owning the driver itself.
    pub fn queue(&self) -> Arc<RequestQueue> {
        self.queue.clone()
    }

    /// Sets how many consecutive failed [`Device::open`] attempts
    /// [`Driver::open`] retries before giving up.
    pub fn set_open_retry_max(&mut self, max: u8) {
        self.open_retry_max = max;
    }

    /// Sets the delay, in microseconds, [`Driver::run_once`] waits after
    /// writing our arbitration address before reading back the echo.
    pub fn set_access_timeout_us(&mut self, timeout_us: u16) {
        self.access_timeout_us = timeout_us;
    }

    /// Opens the device, retrying up to `open_retry_max` times.
    pub fn open(&mut self) -> Result<(), ErrorKind> {
        let mut attempts = 0;
        loop {
            match self.device.lock().unwrap().open() {
                Ok(()) => {
                    log::info!("device open");
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > self.open_retry_max {
                        return Err(e);
                    }
                    log::warn!("device open attempt {attempts} failed: {e}");
                }
            }
        }
    }

    /// Closes the device and fails every queued and in-flight request.
    pub fn close(&mut self) {
        log::info!("device close");
        self.device.lock().unwrap().close();
        if let Some((_, completion)) = self.current.take() {
            completion.complete(Err(ErrorKind::Offline));
        }
        self.queue.fail_all(|| ErrorKind::Offline);
    }

    /// Whether the device is currently open.
    pub fn is_online(&self) -> bool {
        self.device.lock().unwrap().is_open()
    }

    /// Enqueues `master_bytes` (`QQ ZZ PB SB NN D1..DN`, no CRC) and blocks
    /// the calling thread until the cycle completes or fails.
    pub fn transmit(&self, master_bytes: Vec<u8>) -> Result<Vec<u8>, ErrorKind> {
        let request = OutboundRequest::new(master_bytes);
        let completion = request.completion.clone();
        self.queue.enqueue(request);
        completion.wait()
    }

    /// Services exactly one byte: starts the next queued cycle if idle,
    /// reads one byte (or times out), feeds it to the handler, and
    /// resolves any request whose cycle just concluded.
    pub fn run_once(&mut self) -> Result<(), ErrorKind> {
        if !self.device.lock().unwrap().is_open() {
            return Err(ErrorKind::Offline);
        }

        if self.current.is_none() && self.handler.state() == State::PassiveReceiveMaster {
            if let Some(request) = self.queue.dequeue() {
                if self.handler.enqueue_active(&request.master_bytes) {
                    self.current = Some((request.master_bytes, request.completion));
                } else {
                    request.completion.complete(Err(ErrorKind::Sequence));
                }
            }
        }

        let idle = self.handler.state() == State::PassiveReceiveMaster;
        let timeout = Duration::from_millis(if idle { BUS_TIMEOUT_MS } else { ACK_TIMEOUT_MS });

        let outcome = self.device.lock().unwrap().recv(timeout)?;
        match outcome {
            RecvOutcome::Byte(byte) => {
                self.handler.run(byte);
                // We just wrote our arbitration address; give it time to
                // loop back on the wire before the next recv reads the echo.
                if matches!(self.handler.state(), State::RequestBusFirstTry | State::RequestBusSecondTry) {
                    std::thread::sleep(Duration::from_micros(self.access_timeout_us as u64));
                }
                self.resolve_cycle();
            }
            RecvOutcome::Timeout => {}
            RecvOutcome::Eof => return Err(ErrorKind::Offline),
        }
        Ok(())
    }

    fn resolve_cycle(&mut self) {
        let Some(outcome) = self.handler.take_cycle_outcome() else {
            return;
        };
        match outcome {
            CycleOutcome::Success(slave) => {
                if let Some((_, completion)) = self.current.take() {
                    completion.complete(Ok(slave));
                }
            }
            CycleOutcome::Failed(err) => {
                if let Some((_, completion)) = self.current.take() {
                    completion.complete(Err(err));
                }
            }
            CycleOutcome::ArbitrationLost => {
                if let Some((master_bytes, completion)) = self.current.take() {
                    self.queue.enqueue(OutboundRequest { master_bytes, completion });
                }
            }
        }
    }

    /// Runs [`Driver::run_once`] until it returns an error (device offline
    /// or failed).
    pub fn run_forever(&mut self) -> Result<(), ErrorKind> {
        loop {
            self.run_once()?;
        }
    }
}

#[cfg(feature = "threaded")]
mod threaded {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::JoinHandle;

    /// A [`Driver`] running on its own background thread. Dropping this
    /// without calling [`ThreadedDriver::shutdown`] detaches the thread;
    /// it keeps running until the device errors out on its own.
    ///
    /// `queue` and the shared `online`/`running` flags below are the only
    /// cross-thread touch points (§5): the device itself stays owned by the
    /// background thread's driver loop.
    pub struct ThreadedDriver<D> {
        queue: Arc<RequestQueue>,
        device: Arc<Mutex<D>>,
        running: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl<D> std::fmt::Debug for ThreadedDriver<D> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ThreadedDriver")
                .field("queue", &self.queue)
                .field("running", &self.running.load(Ordering::Relaxed))
                .finish_non_exhaustive()
        }
    }

    impl<D: Device + Send + 'static> ThreadedDriver<D> {
        /// Enqueues `master_bytes` and blocks until the cycle completes.
        pub fn transmit(&self, master_bytes: Vec<u8>) -> Result<Vec<u8>, ErrorKind> {
            let request = OutboundRequest::new(master_bytes);
            let completion = request.completion.clone();
            self.queue.enqueue(request);
            completion.wait()
        }

        /// Whether the background loop is still executing. `false` once the
        /// device has errored out or [`ThreadedDriver::shutdown`] has run.
        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }

        /// Whether the underlying device currently reports itself open.
        /// Safe to call from any thread while the driver loop owns the
        /// device on its own background thread.
        pub fn is_online(&self) -> bool {
            self.device.lock().unwrap().is_open()
        }

        /// Stops the background loop and joins the thread, failing any
        /// requests still queued or in flight.
        pub fn shutdown(mut self) {
            self.running.store(false, Ordering::Relaxed);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            self.queue.fail_all(|| ErrorKind::Offline);
        }
    }

    impl<D: Device + Send + 'static> Driver<D> {
        /// Moves this driver onto a background thread that calls
        /// [`Driver::run_once`] in a loop until it errors or
        /// [`ThreadedDriver::shutdown`] is called.
        pub fn spawn(mut self) -> ThreadedDriver<D> {
            let queue = self.queue.clone();
            let device = self.device.clone();
            let running = Arc::new(AtomicBool::new(true));
            let running_loop = running.clone();

            let handle = std::thread::spawn(move || {
                while running_loop.load(Ordering::Relaxed) {
                    if let Err(e) = self.run_once() {
                        log::error!("driver loop stopped: {e}");
                        break;
                    }
                }
                running_loop.store(false, Ordering::Relaxed);
                self.close();
            });

            ThreadedDriver {
                queue,
                device,
                running,
                handle: Some(handle),
            }
        }
    }
}

#[cfg(feature = "threaded")]
pub use threaded::ThreadedDriver;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockDevice {
        open: bool,
        inbound: Mutex<VecDeque<u8>>,
        outbound: Mutex<Vec<u8>>,
    }

    impl Device for MockDevice {
        fn open(&mut self) -> Result<(), ErrorKind> {
            self.open = true;
            Ok(())
        }
        fn close(&mut self) {
            self.open = false;
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn send(&mut self, byte: u8) -> Result<(), ErrorKind> {
            self.outbound.lock().unwrap().push(byte);
            Ok(())
        }
        fn recv(&mut self, _timeout: Duration) -> Result<RecvOutcome, ErrorKind> {
            match self.inbound.lock().unwrap().pop_front() {
                Some(b) => Ok(RecvOutcome::Byte(b)),
                None => Ok(RecvOutcome::Timeout),
            }
        }
    }

    #[test]
    fn open_succeeds_and_reports_online() {
        let mut driver = Driver::new(0x10, MockDevice::default());
        assert!(!driver.is_online());
        driver.open().unwrap();
        assert!(driver.is_online());
    }

    #[test]
    fn run_once_without_bytes_is_a_noop_timeout() {
        let mut driver = Driver::new(0x10, MockDevice::default());
        driver.open().unwrap();
        driver.run_once().unwrap();
        assert_eq!(driver.handler.state(), State::PassiveReceiveMaster);
    }

    #[test]
    fn access_timeout_defaults_and_is_overridable() {
        let mut driver = Driver::new(0x10, MockDevice::default());
        assert_eq!(driver.access_timeout_us, DEFAULT_ACCESS_TIMEOUT_US);
        driver.set_access_timeout_us(0);
        assert_eq!(driver.access_timeout_us, 0);
    }

    #[test]
    fn arbitration_win_pauses_for_the_access_timeout_before_reading_the_echo() {
        let mut driver = Driver::new(0x33, MockDevice::default());
        driver.set_access_timeout_us(0);
        driver.open().unwrap();
        driver.handler_mut().set_max_lock_counter(0);
        driver.handler_mut().set_is_data_available_callback(|| false);

        let queue = driver.queue();
        queue.enqueue(OutboundRequest::new(vec![0x52, 0xB5, 0x09, 0x02, 0x01, 0x02]));

        driver.device.lock().unwrap().inbound.lock().unwrap().push_back(0xAA);
        driver.run_once().unwrap();
        assert_eq!(driver.handler.state(), State::RequestBusFirstTry);

        driver.device.lock().unwrap().inbound.lock().unwrap().push_back(0x33);
        driver.run_once().unwrap();
        assert_eq!(driver.handler.state(), State::ActiveSendMaster);

        // The handler's arbitration byte must have reached the device, not
        // just the handler's internal bookkeeping.
        assert_eq!(*driver.device.lock().unwrap().outbound.lock().unwrap(), vec![0x33]);
    }

    #[test]
    fn transmit_enqueues_and_close_fails_it() {
        let driver = Driver::new(0x10, MockDevice::default());
        let queue = driver.queue();
        let request = OutboundRequest::new(vec![0x52, 0xB5, 0x09, 0x00]);
        let completion = request.completion.clone();
        queue.enqueue(request);
        queue.fail_all(|| ErrorKind::Offline);
        assert_eq!(completion.poll(), Some(Err(ErrorKind::Offline)));
    }

    #[cfg(feature = "threaded")]
    #[test]
    fn threaded_driver_completes_a_broadcast_transmit() {
        let mut device = MockDevice::default();
        device
            .inbound
            .get_mut()
            .unwrap()
            .extend([0xAA, 0x33, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

        let mut driver = Driver::new(0x33, device);
        driver.set_access_timeout_us(0);
        driver.open().unwrap();
        driver.handler_mut().set_max_lock_counter(0);
        driver.handler_mut().set_is_data_available_callback(|| false);

        // Enqueue before spawning the background thread: the scripted bytes
        // are pre-loaded and must be consumed in the order the cycle
        // expects, so the request has to already be in the queue the
        // moment the loop takes its first turn.
        let queue = driver.queue();
        let request = OutboundRequest::new(vec![0xFE, 0xB5, 0x05, 0x02, 0x27, 0x00]);
        let completion = request.completion.clone();
        queue.enqueue(request);

        let threaded = driver.spawn();
        assert!(threaded.is_online());
        assert!(threaded.is_running());
        assert_eq!(completion.wait(), Ok(Vec::new()));
        threaded.shutdown();
    }
}
