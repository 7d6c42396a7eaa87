//! Off-thread codec workers with bounded concurrency.
//!
//! Heavy codec stages (DEFLATE, AES) run on dedicated OS threads. The
//! pool holds at most `max_workers` workers; each is either busy, bound
//! to one stage session, or idle. `acquire` spawns below the cap, rebinds
//! an idle worker, or queues the request FIFO until a stage flushes.
//! A released worker serves the queue head or is destroyed.
//!
//! The message protocol to a worker is `bind`, then any number of
//! `append`s, then `flush`. Payload buffers move through the channels by
//! ownership transfer. An error from the worker poisons the stage: the
//! in-flight operation fails and the stage accepts no further calls.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::codec::{CodecPolicy, Direction, EntryCodec, FlushOutput};
use crate::result::{ZipError, ZipResult};

enum Request {
    Bind {
        direction: Direction,
        policy: CodecPolicy,
        reply: oneshot::Sender<ZipResult<()>>,
    },
    Append {
        data: Vec<u8>,
        reply: oneshot::Sender<ZipResult<Vec<u8>>>,
    },
    Flush {
        reply: oneshot::Sender<ZipResult<FlushOutput>>,
    },
    Shutdown,
}

struct Worker {
    id: u64,
    tx: mpsc::Sender<Request>,
    busy: bool,
}

struct Pending {
    direction: Direction,
    policy: CodecPolicy,
    reply: oneshot::Sender<ZipResult<WorkerStage>>,
}

#[derive(Default)]
struct PoolInner {
    workers: Vec<Worker>,
    pending: VecDeque<Pending>,
    next_id: u64,
}

/// A bounded pool of codec workers. Cheap to share via `Arc`.
pub struct WorkerPool {
    max_workers: usize,
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers)
            .field("workers", &self.worker_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> WorkerPool {
        WorkerPool {
            max_workers: max_workers.max(1),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Number of workers currently alive, busy or idle.
    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    /// Number of acquire requests waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Obtains a stage bound to a worker, waiting FIFO when the pool is
    /// saturated.
    pub(crate) async fn acquire(
        pool: &Arc<WorkerPool>,
        direction: Direction,
        policy: CodecPolicy,
    ) -> ZipResult<WorkerStage> {
        let waiter = {
            let mut inner = pool.inner.lock();
            if inner.workers.len() < pool.max_workers {
                let id = inner.next_id;
                inner.next_id += 1;
                let tx = spawn_worker(id)?;
                debug!(worker = id, "spawned codec worker");
                inner.workers.push(Worker { id, tx, busy: true });
                let worker = inner.workers.last().expect("just pushed");
                return Ok(bind_stage(pool, worker, direction, policy));
            }
            if let Some(worker) = inner.workers.iter_mut().find(|w| !w.busy) {
                worker.busy = true;
                trace!(worker = worker.id, "rebound idle codec worker");
                let worker = &*worker;
                return Ok(bind_stage(pool, worker, direction, policy));
            }
            let (tx, rx) = oneshot::channel();
            inner.pending.push_back(Pending {
                direction,
                policy,
                reply: tx,
            });
            trace!(pending = inner.pending.len(), "queued acquire request");
            rx
        };
        waiter
            .await
            .map_err(|_| ZipError::io_other("worker pool shut down"))?
    }

    /// Hands a freed worker to the queue head, or destroys it.
    fn release(pool: &Arc<WorkerPool>, worker_id: u64) {
        let mut inner = pool.inner.lock();
        let Some(position) = inner.workers.iter().position(|w| w.id == worker_id) else {
            return;
        };
        if let Some(next) = inner.pending.pop_front() {
            let worker = &inner.workers[position];
            trace!(worker = worker_id, "rebinding released worker to queued request");
            let stage = bind_stage(pool, worker, next.direction, next.policy);
            if let Err(Ok(stage)) = next.reply.send(Ok(stage)) {
                // Acquirer went away; put the worker back through release.
                drop(inner);
                drop(stage);
            }
            return;
        }
        let worker = inner.workers.swap_remove(position);
        let _ = worker.tx.send(Request::Shutdown);
        debug!(worker = worker_id, "destroyed codec worker");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        for worker in &inner.workers {
            let _ = worker.tx.send(Request::Shutdown);
        }
    }
}

fn spawn_worker(id: u64) -> ZipResult<mpsc::Sender<Request>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("zipflow-codec-{id}"))
        .spawn(move || worker_main(rx))?;
    Ok(tx)
}

fn bind_stage(
    pool: &Arc<WorkerPool>,
    worker: &Worker,
    direction: Direction,
    policy: CodecPolicy,
) -> WorkerStage {
    let (reply, ack) = oneshot::channel();
    let _ = worker.tx.send(Request::Bind {
        direction,
        policy,
        reply,
    });
    WorkerStage {
        pool: Arc::clone(pool),
        worker_id: worker.id,
        tx: worker.tx.clone(),
        bind_ack: Some(ack),
        poisoned: false,
        released: false,
    }
}

/// One worker thread: owns at most one codec session at a time.
fn worker_main(rx: mpsc::Receiver<Request>) {
    let mut codec: Option<EntryCodec> = None;
    while let Ok(request) = rx.recv() {
        match request {
            Request::Bind {
                direction,
                policy,
                reply,
            } => match EntryCodec::new(direction, policy) {
                Ok(new_codec) => {
                    codec = Some(new_codec);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    codec = None;
                    let _ = reply.send(Err(e));
                }
            },
            Request::Append { data, reply } => {
                let result = match codec.as_mut() {
                    Some(codec) => codec.append(&data),
                    None => Err(ZipError::io_other("codec stage is poisoned")),
                };
                if result.is_err() {
                    codec = None;
                }
                let _ = reply.send(result);
            }
            Request::Flush { reply } => {
                let result = match codec.as_mut() {
                    Some(codec) => codec.flush(),
                    None => Err(ZipError::io_other("codec stage is poisoned")),
                };
                codec = None;
                let _ = reply.send(result);
            }
            Request::Shutdown => break,
        }
    }
}

/// A codec stage session bound to a pool worker.
pub(crate) struct WorkerStage {
    pool: Arc<WorkerPool>,
    worker_id: u64,
    tx: mpsc::Sender<Request>,
    bind_ack: Option<oneshot::Receiver<ZipResult<()>>>,
    poisoned: bool,
    released: bool,
}

impl WorkerStage {
    async fn ensure_bound(&mut self) -> ZipResult<()> {
        if self.poisoned {
            return Err(ZipError::io_other("codec stage is poisoned"));
        }
        if let Some(ack) = self.bind_ack.take() {
            match ack.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.poisoned = true;
                    return Err(e);
                }
                Err(_) => {
                    self.poisoned = true;
                    return Err(ZipError::io_other("codec worker died"));
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn append(&mut self, data: Vec<u8>) -> ZipResult<Vec<u8>> {
        self.ensure_bound().await?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Append { data, reply })
            .map_err(|_| ZipError::io_other("codec worker died"))?;
        match rx.await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(e)
            }
            Err(_) => {
                self.poisoned = true;
                Err(ZipError::io_other("codec worker died"))
            }
        }
    }

    /// Finalises the session and releases the worker back to the pool.
    pub(crate) async fn flush(&mut self) -> ZipResult<FlushOutput> {
        self.ensure_bound().await?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Flush { reply })
            .map_err(|_| ZipError::io_other("codec worker died"))?;
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(ZipError::io_other("codec worker died")),
        };
        if result.is_err() {
            self.poisoned = true;
        }
        self.released = true;
        WorkerPool::release(&self.pool, self.worker_id);
        result
    }
}

impl Drop for WorkerStage {
    fn drop(&mut self) {
        if !self.released {
            WorkerPool::release(&self.pool, self.worker_id);
        }
    }
}
