use std::num::NonZero;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use std::{iter, mem, panic};

use crossbeam::channel::{self, Receiver, Sender};
use many_cpus::ProcessorSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::metrics::COLLECTIVE_DURATION_MS;
use crate::shard::CURRENT_SHARD;
use crate::{
    ChildRegistry, Error, Result, ShardContext, ShardId, StorageEngine, TargetFiles,
    current_shard,
};

/// Fixed set of shard workers that collective operations fan out to.
///
/// Every shard is one thread that owns a [`ShardContext`]. The only way to touch the state of a
/// shard from outside is to run a task on it through
/// [`run_on_all_shards()`][Self::run_on_all_shards], which executes the task on every shard and
/// waits for all of them to finish before returning.
///
/// # Lifecycle
///
/// Shutting down (explicitly or by dropping the executor) lets every worker finish the tasks that
/// were already queued, purge its child registry and exit. Tasks submitted afterwards are rejected
/// with [`Error::ShardUnavailable`].
#[derive(Debug)]
pub struct ShardExecutor {
    // `None` once shutdown has started. Tasks are only ever sent under the read lock, so every
    // accepted task is queued ahead of the `Shutdown` command and completes before its worker exits.
    command_txs: RwLock<Option<Vec<Sender<Command>>>>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
    shard_count: NonZero<usize>,
}

impl ShardExecutor {
    /// Starts `shard_count` workers.
    ///
    /// If `pin` is set and the system offers enough processors, each worker is pinned to its own
    /// processor. Otherwise the workers are left to the operating system scheduler.
    pub(crate) fn new(
        shard_count: NonZero<usize>,
        pin: bool,
        engine: &Arc<dyn StorageEngine>,
        target_files: &Arc<dyn TargetFiles>,
    ) -> Self {
        let (command_txs, command_rxs): (Vec<_>, Vec<_>) = iter::repeat_with(channel::unbounded)
            .take(shard_count.get())
            .unzip();

        let workers = command_rxs
            .into_iter()
            .enumerate()
            .map(|(shard, commands)| Worker {
                shard,
                commands,
                engine: Arc::clone(engine),
                target_files: Arc::clone(target_files),
            })
            .collect::<Vec<_>>();

        let processors = if pin {
            ProcessorSet::builder().take(shard_count)
        } else {
            None
        };

        if pin && processors.is_none() {
            warn!(
                shard_count = shard_count.get(),
                "not enough processors to pin every shard, shard workers will not be pinned"
            );
        }

        let join_handles = spawn_workers(workers, processors.as_ref());

        Self {
            command_txs: RwLock::new(Some(command_txs)),
            join_handles: Mutex::new(join_handles),
            shard_count,
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> NonZero<usize> {
        self.shard_count
    }

    /// Runs `task` once on every shard and waits for all of them to complete.
    ///
    /// Every shard runs the task even if it fails on some of them.
    ///
    /// # Errors
    ///
    /// Returns the error of the lowest-numbered shard on which the task failed, or
    /// [`Error::ShardUnavailable`] if a shard has already shut down.
    ///
    /// # Panics
    ///
    /// Panics if called from a shard worker, because the worker would end up waiting for itself.
    /// Panics if a shard worker terminates before completing the task, which only happens if a
    /// task panicked on that shard.
    pub fn run_on_all_shards<F>(&self, task: F) -> Result<()>
    where
        F: Fn(&mut ShardContext) -> Result<()> + Send + Sync + 'static,
    {
        if let Some(shard) = current_shard() {
            panic!("shard {shard} attempted to start a collective operation, which would deadlock");
        }

        let started = Instant::now();
        let task = Arc::new(task);

        let mut results = Vec::with_capacity(self.shard_count.get());
        let mut first_error = None;

        {
            let command_txs = self.command_txs.read();

            let Some(command_txs) = command_txs.as_ref() else {
                return Err(Error::ShardUnavailable(0));
            };

            for (shard, commands) in command_txs.iter().enumerate() {
                let (result_tx, result_rx) = oneshot::channel::<Result<()>>();
                let task = Arc::clone(&task);

                let command = Command::Execute(Box::new(move |context: &mut ShardContext| {
                    // The receiver is only gone if the caller is unwinding, nobody to report to.
                    drop(result_tx.send(task(context)));
                }));

                // Only fails if the worker died of a panic in an earlier task.
                if commands.send(command).is_ok() {
                    results.push((shard, result_rx));
                } else {
                    first_error = first_error.or(Some(Error::ShardUnavailable(shard)));
                }
            }
        }

        // Wait for every shard before reporting anything, even if some were unreachable.
        for (shard, result_rx) in results {
            match result_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    debug!(shard, %error, "collective task failed on shard");
                    first_error = first_error.or(Some(error));
                }
                Err(_disconnected) => {
                    panic!("shard {shard} worker terminated before completing a collective task");
                }
            }
        }

        COLLECTIVE_DURATION_MS.with(|event| event.observe_millis(started.elapsed()));

        first_error.map_or(Ok(()), Err)
    }

    /// Stops every shard worker after it has finished the tasks queued so far.
    ///
    /// Tasks submitted before this call complete first, tasks submitted afterwards are rejected.
    /// Does nothing if the workers have already been stopped or are being stopped.
    ///
    /// # Panics
    ///
    /// Re-throws the panic of any worker that panicked, for example because a pool was still in
    /// use when its shard purged its registry.
    #[cfg_attr(test, mutants::skip)] // Removing this leaves workers running forever.
    pub fn shutdown(&self) {
        let Some(command_txs) = self.command_txs.write().take() else {
            return;
        };

        for commands in command_txs {
            // A worker that is already gone has nothing left to shut down.
            drop(commands.send(Command::Shutdown));
        }

        let handles = mem::take(&mut *self.join_handles.lock());

        for handle in handles {
            if let Err(payload) = handle.join() {
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Drop for ShardExecutor {
    fn drop(&mut self) {
        if thread::panicking() {
            // Joining workers while unwinding could hide the original panic behind a new one.
            // The workers exit on their own once the command channels are dropped.
            return;
        }

        self.shutdown();
    }
}

enum Command {
    Execute(Box<dyn FnOnce(&mut ShardContext) + Send>),
    Shutdown,
}

struct Worker {
    shard: ShardId,
    commands: Receiver<Command>,
    engine: Arc<dyn StorageEngine>,
    target_files: Arc<dyn TargetFiles>,
}

impl Worker {
    fn run(self) {
        CURRENT_SHARD.set(Some(self.shard));

        let mut context = ShardContext::new(ChildRegistry::new(
            self.shard,
            self.engine,
            self.target_files,
        ));

        debug!(shard = self.shard, "shard worker started");

        while let Ok(Command::Execute(task)) = self.commands.recv() {
            trace!(shard = self.shard, "executing shard task");
            task(&mut context);
        }

        context.registry_mut().purge_all();

        debug!(shard = self.shard, "shard worker exiting");
    }
}

/// Spawns one thread per worker, named after its shard. With `processors` set, shard N is pinned
/// to the N-th processor of the set.
fn spawn_workers(workers: Vec<Worker>, processors: Option<&ProcessorSet>) -> Vec<JoinHandle<()>> {
    let mut pins = processors.map(|processors| processors.decompose().into_iter());

    workers
        .into_iter()
        .map(|worker| {
            let pin = pins.as_mut().and_then(Iterator::next);

            thread::Builder::new()
                .name(format!("pool-target-s{}", worker.shard))
                .spawn(move || {
                    if let Some(pin) = pin {
                        pin.pin_current_thread_to();
                        debug!(shard = worker.shard, processor = %pin, "pinned shard worker");
                    }

                    worker.run();
                })
                .expect("failed to spawn shard worker thread: thread spawning failure is not supported")
        })
        .collect()
}
