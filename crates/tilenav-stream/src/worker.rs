//! Background full builds on one dedicated thread

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

use tilenav_common::{Error, Result};
use tilenav_mesh::NavMeshParams;

use crate::container::NavMeshContainer;
use crate::residency::StoreThenBuild;
use crate::tile_builder::TileBuilder;
use crate::tile_store::TileCacheStore;
use crate::tiled_build::{build_all_tiles, TiledBuildReport};

/// Shared cancellation flag polled by long running builds.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Error::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything a worker needs to build a container from scratch
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub builder: TileBuilder,
    pub params: NavMeshParams,
    pub tiles: Vec<(i32, i32)>,
    /// Store to reuse matching tiles from
    pub store_path: Option<PathBuf>,
}

impl BuildJob {
    /// Runs the job on the calling thread.
    pub fn run(&self, cancel: &CancellationToken) -> Result<(NavMeshContainer, TiledBuildReport)> {
        let mut container = NavMeshContainer::new(self.params)?;
        let mut store = self.store_path.clone().map(TileCacheStore::new);
        let mut source = StoreThenBuild::new(store.as_mut(), &self.builder, &self.params);
        let report = build_all_tiles(&mut source, &mut container, &self.tiles, cancel)?;
        Ok((container, report))
    }
}

/// Message sent back from the worker thread
#[derive(Debug)]
pub enum BuildResult {
    Finished {
        generation: u64,
        container: NavMeshContainer,
        report: TiledBuildReport,
    },
    Cancelled {
        generation: u64,
    },
    Failed {
        generation: u64,
        error: Error,
    },
}

impl BuildResult {
    pub fn generation(&self) -> u64 {
        match self {
            BuildResult::Finished { generation, .. }
            | BuildResult::Cancelled { generation }
            | BuildResult::Failed { generation, .. } => *generation,
        }
    }
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    receiver: Receiver<BuildResult>,
    handle: JoinHandle<()>,
}

/// Runs at most one [`BuildJob`] at a time.
///
/// Submitting while a build runs keeps only the newest job as pending; it starts once
/// the current build has been collected by [`BuildWorker::poll`].
#[derive(Default)]
pub struct BuildWorker {
    in_flight: Option<InFlight>,
    pending: Option<BuildJob>,
    next_generation: u64,
}

impl std::fmt::Debug for BuildWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildWorker")
            .field("busy", &self.is_busy())
            .field("pending", &self.pending.is_some())
            .field("next_generation", &self.next_generation)
            .finish()
    }
}

impl BuildWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Generation of the most recently started build, 0 before the first.
    pub fn latest_generation(&self) -> u64 {
        self.next_generation
    }

    /// Starts `job`, or parks it as the pending job when a build is running.
    ///
    /// Returns the generation of the started job, `None` when it was parked.
    pub fn submit(&mut self, job: BuildJob) -> Result<Option<u64>> {
        if self.in_flight.is_some() {
            log::debug!("Build in flight, coalescing request");
            self.pending = Some(job);
            return Ok(None);
        }
        self.start(job).map(Some)
    }

    fn start(&mut self, job: BuildJob) -> Result<u64> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();
        let (sender, receiver) = mpsc::channel();

        let thread_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("tilenav-build".to_string())
            .spawn(move || {
                let result = match job.run(&thread_cancel) {
                    Ok((container, report)) => BuildResult::Finished {
                        generation,
                        container,
                        report,
                    },
                    Err(Error::Cancelled) => BuildResult::Cancelled { generation },
                    Err(error) => BuildResult::Failed { generation, error },
                };
                // The receiver may be gone if the worker was dropped
                let _ = sender.send(result);
            })?;

        log::info!("Started background build {generation}");
        self.in_flight = Some(InFlight {
            generation,
            cancel,
            receiver,
            handle,
        });
        Ok(generation)
    }

    /// Collects a finished build, if any, and starts the pending job.
    pub fn poll(&mut self) -> Option<BuildResult> {
        let flight = self.in_flight.as_ref()?;
        let result = match flight.receiver.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => BuildResult::Failed {
                generation: flight.generation,
                error: Error::NavMesh("build thread stopped without a result".to_string()),
            },
        };
        self.finish_flight();
        Some(result)
    }

    /// Blocks until the running build finishes.
    pub fn wait(&mut self) -> Option<BuildResult> {
        let flight = self.in_flight.as_ref()?;
        let result = flight.receiver.recv().unwrap_or(BuildResult::Failed {
            generation: flight.generation,
            error: Error::NavMesh("build thread stopped without a result".to_string()),
        });
        self.finish_flight();
        Some(result)
    }

    fn finish_flight(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            if flight.handle.join().is_err() {
                log::warn!("Build thread {} panicked", flight.generation);
            }
        }
        if let Some(job) = self.pending.take() {
            if let Err(e) = self.start(job) {
                log::warn!("Could not start pending build: {e}");
            }
        }
    }

    /// Requests cancellation of the running build and drops the pending one.
    pub fn cancel(&mut self) {
        self.pending = None;
        if let Some(flight) = &self.in_flight {
            flight.cancel.cancel();
        }
    }
}

impl Drop for BuildWorker {
    fn drop(&mut self) {
        self.pending = None;
        if let Some(flight) = self.in_flight.take() {
            flight.cancel.cancel();
            let _ = flight.handle.join();
        }
    }
}
