//! Bounded ingest queue with a dedicated consumer thread.
//!
//! Top-N workers take their input through a [`DataCarrier`] instead of
//! writing into the worker cache from the ingest threads directly: producers
//! block when the queue is full, which is the back-pressure boundary for the
//! sampled-record path.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, error};

/// Sink for carried items; runs on the consumer thread.
pub trait Consumer<T>: Send + 'static {
    /// Handle a batch drained from the queue.
    fn consume(&self, items: Vec<T>);
    /// Called once when the consumer thread exits.
    fn on_exit(&self) {}
}

enum CarrierCommand<T> {
    Produce(T),
    Shutdown,
}

/// Bounded single-consumer queue feeding a named consumer thread.
pub struct DataCarrier<T> {
    name: String,
    tx: Sender<CarrierCommand<T>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> DataCarrier<T> {
    /// Spawn the consumer thread and return the carrier handle.
    pub fn new<C>(name: &str, capacity: usize, consumer: C) -> Self
    where
        C: Consumer<T>,
    {
        let (tx, rx) = bounded(capacity);
        let thread_name = format!("{name}-consumer");
        let carrier_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || Self::consumer_loop(carrier_name, rx, consumer))
            .ok();
        if handle.is_none() {
            error!(carrier = name, "failed to spawn consumer thread");
        }
        Self {
            name: name.to_string(),
            tx,
            consumer: Mutex::new(handle),
        }
    }

    /// Enqueue one item, blocking while the queue is full.
    ///
    /// A send failure means the consumer thread is gone; the condition is
    /// fatal for this worker and surfaces through the log only.
    pub fn produce(&self, item: T) {
        if self.tx.send(CarrierCommand::Produce(item)).is_err() {
            error!(
                carrier = %self.name,
                "consumer thread is gone, dropping item"
            );
        }
    }

    /// Stop the consumer thread and wait for it to drain.
    pub fn shutdown(&self) {
        let _ = self.tx.send(CarrierCommand::Shutdown);
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
    }

    fn consumer_loop<C>(name: String, rx: Receiver<CarrierCommand<T>>, consumer: C)
    where
        C: Consumer<T>,
    {
        while let Ok(command) = rx.recv() {
            let first = match command {
                CarrierCommand::Produce(item) => item,
                CarrierCommand::Shutdown => break,
            };
            let mut batch = vec![first];
            let mut stop = false;
            // Drain whatever is already queued so the sink sees batches.
            loop {
                match rx.try_recv() {
                    Ok(CarrierCommand::Produce(item)) => batch.push(item),
                    Ok(CarrierCommand::Shutdown) => {
                        stop = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
            consumer.consume(batch);
            if stop {
                break;
            }
        }
        debug!(carrier = %name, "consumer exiting");
        consumer.on_exit();
    }
}

impl<T> Drop for DataCarrier<T> {
    fn drop(&mut self) {
        let _ = self.tx.send(CarrierCommand::Shutdown);
    }
}
