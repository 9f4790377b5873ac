use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::apm::event::{PoolEvent, TopologyEvent};
use crate::error::Result;

pub type PoolHook = Box<dyn Fn(&PoolEvent) + Send + Sync>;
pub type TopologyHook = Box<dyn Fn(&TopologyEvent) + Send + Sync>;

pub struct Listener {
    no_pool_hooks: AtomicBool,
    no_topology_hooks: AtomicBool,
    pool_hooks: RwLock<Vec<PoolHook>>,
    topology_hooks: RwLock<Vec<TopologyHook>>,
}

impl Default for Listener {
    fn default() -> Self {
        Listener::new()
    }
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_pool_hooks: AtomicBool::new(true),
            no_topology_hooks: AtomicBool::new(true),
            pool_hooks: RwLock::new(Vec::new()),
            topology_hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_pool_hook(&self, hook: PoolHook) -> Result<()> {
        let mut guard = self.pool_hooks.write()?;
        self.no_pool_hooks.store(false, Ordering::SeqCst);
        guard.deref_mut().push(hook);
        Ok(())
    }

    pub fn add_topology_hook(&self, hook: TopologyHook) -> Result<()> {
        let mut guard = self.topology_hooks.write()?;
        self.no_topology_hooks.store(false, Ordering::SeqCst);
        guard.deref_mut().push(hook);
        Ok(())
    }

    pub fn run_pool_hooks(&self, event: &PoolEvent) -> Result<()> {
        if self.no_pool_hooks.load(Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.pool_hooks.read()?;

        for hook in guard.deref().iter() {
            hook(event);
        }

        Ok(())
    }

    pub fn run_topology_hooks(&self, event: &TopologyEvent) -> Result<()> {
        if self.no_topology_hooks.load(Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.topology_hooks.read()?;

        for hook in guard.deref().iter() {
            hook(event);
        }

        Ok(())
    }
}
