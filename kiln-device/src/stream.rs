use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::device::{Device, DevicePtr};
use crate::error::DeviceError;

type Job = Box<dyn FnOnce() -> Result<(), DeviceError> + Send>;

/// An ordered queue of device work.
///
/// Work enqueued on the same stream runs in submission order, work on different streams may overlap.
/// Errors raised by asynchronous work are kept and reported by the next [Stream::synchronize].
/// Dropping a stream waits for all enqueued work to finish.
pub struct Stream {
    device: Device,
    sender: Option<Sender<(Job, Event)>>,
    worker: Option<JoinHandle<()>>,
    state: Arc<Shared>,
}

struct Shared {
    status: Mutex<StreamStatus>,
    idle: Condvar,
}

#[derive(Default)]
struct StreamStatus {
    pending: usize,
    first_error: Option<DeviceError>,
}

/// Marks the completion of a single piece of enqueued work.
#[derive(Clone)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a job, turning a panic into an error so the event and pending count are always settled.
fn run_job(job: Job) -> Result<(), DeviceError> {
    catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| Err(DeviceError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "unknown panic payload".to_owned(),
        },
    }
}

impl Event {
    fn new() -> Self {
        Event {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    fn complete(&self) {
        let (done, condvar) = &*self.inner;
        *lock(done) = true;
        condvar.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *lock(&self.inner.0)
    }

    pub fn wait(&self) {
        let (done, condvar) = &*self.inner;
        let mut guard = lock(done);
        while !*guard {
            guard = condvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("complete", &self.is_complete()).finish()
    }
}

impl Stream {
    pub fn new(device: &Device) -> Stream {
        let (sender, receiver) = channel::<(Job, Event)>();
        let state = Arc::new(Shared {
            status: Mutex::new(StreamStatus::default()),
            idle: Condvar::new(),
        });

        let worker_state = state.clone();
        let worker = std::thread::Builder::new()
            .name(format!("kiln-stream-dev{}", device.ordinal()))
            .spawn(move || {
                for (job, event) in receiver {
                    let result = run_job(job);

                    let mut status = lock(&worker_state.status);
                    if let Err(e) = result {
                        tracing::warn!("Asynchronous stream work failed: {}", e);
                        status.first_error.get_or_insert(e);
                    }
                    // events must be complete by the time synchronize returns
                    event.complete();
                    status.pending -= 1;
                    drop(status);

                    worker_state.idle.notify_all();
                }
            })
            .ok();

        if worker.is_none() {
            tracing::warn!("Failed to spawn stream worker, work will run synchronously");
        }

        Stream {
            device: device.clone(),
            sender: worker.as_ref().map(|_| sender),
            worker,
            state,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Enqueue work and return immediately. The returned [Event] completes once the work has run.
    pub fn enqueue(&self, job: impl FnOnce() -> Result<(), DeviceError> + Send + 'static) -> Event {
        let event = Event::new();
        lock(&self.state.status).pending += 1;

        let job: Job = Box::new(job);
        let unsent = match &self.sender {
            Some(sender) => sender.send((job, event.clone())).err().map(|e| e.0),
            None => Some((job, event.clone())),
        };

        // no worker available, run inline so the work is never lost
        if let Some((job, event)) = unsent {
            let result = run_job(job);
            let mut status = lock(&self.state.status);
            if let Err(e) = result {
                status.first_error.get_or_insert(e);
            }
            event.complete();
            status.pending -= 1;
            drop(status);
        }

        event
    }

    /// Asynchronously copy host data to the device. The data is captured by value.
    pub fn copy_host_to_device_async(&self, dst: DevicePtr, data: Vec<u8>) -> Event {
        let device = self.device.clone();
        self.enqueue(move || device.copy_host_to_device(dst, &data).map_err(DeviceError::from))
    }

    /// Block until all enqueued work has finished, then report the first error raised since the last call.
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        let mut status = lock(&self.state.status);
        while status.pending > 0 {
            status = self.state.idle.wait(status).unwrap_or_else(PoisonError::into_inner);
        }
        match status.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // closing the channel lets the worker drain the queue and exit
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Stream worker panicked");
            }
        }
        if let Some(e) = lock(&self.state.status).first_error.take() {
            tracing::warn!("Stream dropped with unreported error: {}", e);
        }
    }
}

impl Debug for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device.ordinal())
            .field("pending", &lock(&self.state.status).pending)
            .finish()
    }
}
