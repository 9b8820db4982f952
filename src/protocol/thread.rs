use std::{
    io,
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, error};

use super::{error::ProtocolError, lock};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads draining a shared job queue.
///
/// Dropping the pool closes the queue and joins every worker once the queued jobs are done.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver))?);
        }

        Ok(Self { workers, sender })
    }

    pub fn execute<F>(&self, f: F) -> Result<(), ProtocolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(job)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                error!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(name: &str, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(move || {
                loop {
                    let msg = lock(&receiver).recv();
                    match msg {
                        Ok(job) => {
                            debug!("worker {id} picked up a job");
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}
