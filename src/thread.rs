use std::{
    io,
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread,
};

use log::{debug, error};
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
#[error("worker pool has no running workers")]
pub struct WorkersGone;

/// Fixed set of named worker threads pulling jobs off a shared queue.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl WorkerPool {
    /// Spawn `size` workers named `<name>-<id>`. A width of zero is rejected
    /// with [`io::ErrorKind::InvalidInput`].
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one worker",
            ));
        }

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        for id in 0..size {
            workers.push(Worker::spawn(name, id, Arc::clone(&receiver))?);
        }

        Ok(Self {
            workers,
            sender: Some(sender),
        })
    }

    pub fn width(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F) -> Result<(), WorkersGone>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(WorkersGone)?;
        sender.send(Box::new(f)).map_err(|_| WorkersGone)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.name);
            if worker.thread.join().is_err() {
                error!("worker {} panicked", worker.name);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    name: String,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(
        prefix: &str,
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    ) -> io::Result<Self> {
        let name = format!("{prefix}-{id}");
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                let msg = receiver
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recv();
                match msg {
                    Ok(job) => job(),
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        })?;

        Ok(Self { name, thread })
    }
}
