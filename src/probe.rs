use crate::back::{Backend, Error};
use crate::mem::MemorySnapshot;
use crate::ten::{randn, Shape, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::ops::{Deref, DerefMut};

/// Region of work bound to one device.
///
/// The scope is left on every exit path: [`DeviceScope::close`] reports errors
/// raised inside, a scope dropped early (error or panic) only logs them.
pub struct DeviceScope<'a, B: Backend> {
    backend: &'a mut B,
    open: bool,
}

impl<'a, B: Backend> DeviceScope<'a, B> {
    pub fn enter(backend: &'a mut B) -> Self {
        backend.enter_scope();
        Self {
            backend,
            open: true,
        }
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.open = false;
        self.backend.exit_scope()
    }
}

impl<B: Backend> Deref for DeviceScope<'_, B> {
    type Target = B;

    fn deref(&self) -> &Self::Target {
        self.backend
    }
}

impl<B: Backend> DerefMut for DeviceScope<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend
    }
}

impl<B: Backend> Drop for DeviceScope<'_, B> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.backend.exit_scope() {
                log::warn!("Device error while leaving scope: {e}");
            }
        }
    }
}

/// One allocate, measure, release, measure cycle.
#[derive(Debug, Clone)]
pub struct Probe {
    pub shape: Shape,
    pub seed: Option<u64>,
    pub verify: bool,
    pub empty_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub shape: Shape,
    /// Bytes the allocation asked for, before pool rounding.
    pub requested: u64,
    /// Usage while the allocation is alive.
    pub before: MemorySnapshot,
    /// Usage after it was dropped.
    pub after: MemorySnapshot,
}

impl ProbeOutcome {
    pub fn diff(&self) -> i64 {
        self.before.diff(&self.after)
    }

    /// The released block is still held by the allocator.
    pub fn retained(&self) -> bool {
        self.diff() >= 0 || self.after.reserved > self.after.allocated
    }
}

impl Probe {
    pub fn run<B: Backend>(&self, backend: &mut B) -> Result<ProbeOutcome, Error> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let requested = self.shape.bytes()?;

        let mut scope = DeviceScope::enter(backend);
        let b = &mut *scope;

        log::debug!("Allocating {} ({} bytes) on {}", self.shape, requested, b.info());
        // Device memory first, so an over-capacity request fails before host data exists
        let tensor = Tensor::empty(b, &self.shape)?;
        let host = randn(&self.shape, &mut rng);
        tensor.upload(b, host.clone())?;
        log::debug!("Uploaded {} bytes", tensor.bytes());
        if self.verify {
            tensor.verify(b, &host)?;
        }
        drop(host);

        b.synchronize();
        let before = b.memory_usage();

        drop(tensor);
        if self.empty_cache {
            let freed = b.empty_cache();
            log::debug!("Released {freed} cached bytes");
        }
        b.synchronize();
        let after = b.memory_usage();

        scope.close()?;
        log::debug!("Peak allocated: {} bytes", backend.peak_allocated());

        Ok(ProbeOutcome {
            shape: self.shape.clone(),
            requested,
            before,
            after,
        })
    }
}
