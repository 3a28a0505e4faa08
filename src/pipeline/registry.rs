//! The pipeline registry: builds pools and stages from a layout, wires them
//! together, and owns their lifecycle.
//!
//! There is no global instance. The server creates one registry at startup and
//! hands stage references to the front end; tests build as many as they like.

use std::collections::HashMap;
use std::sync::Arc;

use toml::Table;

use super::layout::{PipelineLayout, StageSpec};
use super::pool::WorkerPool;
use super::stage::{Stage, StageRef, StageState};
use super::sweeper::Sweeper;
use crate::error::{PipelineError, StageError};

type Constructor = Box<dyn Fn(&StageSpec) -> Result<Box<dyn Stage>, StageError> + Send + Sync>;

/// Maps a stage `Type` to its constructor.
#[derive(Default)]
pub struct StageFactory {
    ctors: HashMap<String, Constructor>,
}

impl StageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: &str, ctor: F) -> &mut Self
    where
        F: Fn(&StageSpec) -> Result<Box<dyn Stage>, StageError> + Send + Sync + 'static,
    {
        self.ctors.insert(kind.to_string(), Box::new(ctor));
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.ctors.contains_key(kind)
    }

    fn build(&self, spec: &StageSpec) -> Result<Box<dyn Stage>, PipelineError> {
        let ctor = self.ctors.get(&spec.kind).ok_or_else(|| {
            PipelineError::Init(format!(
                "stage '{}': unknown stage type '{}'",
                spec.name, spec.kind
            ))
        })?;
        ctor(spec).map_err(|e| PipelineError::Init(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Empty,
    Parsed,
    Instantiated,
    Running,
    CleanedUp,
}

impl RegistryState {
    fn as_str(self) -> &'static str {
        match self {
            RegistryState::Empty => "empty",
            RegistryState::Parsed => "parsed",
            RegistryState::Instantiated => "instantiated",
            RegistryState::Running => "running",
            RegistryState::CleanedUp => "cleaned up",
        }
    }
}

pub struct Registry {
    factory: StageFactory,
    layout: Option<PipelineLayout>,
    state: RegistryState,
    pools: Vec<Arc<WorkerPool>>,
    stages: HashMap<String, StageRef>,
    // Config order, for deterministic init/cleanup.
    stage_order: Vec<String>,
    sweeper: Option<Sweeper>,
}

impl Registry {
    pub fn new(factory: StageFactory) -> Self {
        Self {
            factory,
            layout: None,
            state: RegistryState::Empty,
            pools: Vec::new(),
            stages: HashMap::new(),
            stage_order: Vec::new(),
            sweeper: None,
        }
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    pub fn layout(&self) -> Option<&PipelineLayout> {
        self.layout.as_ref()
    }

    /// Read pool and stage definitions from a config document.
    pub fn parse(&mut self, config: &Table) -> Result<(), PipelineError> {
        let layout = PipelineLayout::parse(config)?;
        self.set_layout(layout)
    }

    /// Use an already built layout instead of parsing one.
    pub fn set_layout(&mut self, layout: PipelineLayout) -> Result<(), PipelineError> {
        self.expect_state(&[RegistryState::Empty, RegistryState::Parsed, RegistryState::CleanedUp], "parsed")?;
        tracing::debug!(
            pools = layout.pools.len(),
            stages = layout.stages.len(),
            history = layout.history.enabled,
            "pipeline layout parsed"
        );
        self.layout = Some(layout);
        self.state = RegistryState::Parsed;
        Ok(())
    }

    /// Build every stage and the pools they bind to, then bind downstream
    /// links. On any failure nothing built so far is kept.
    pub fn instantiate(&mut self) -> Result<(), PipelineError> {
        self.expect_state(&[RegistryState::Parsed], "parsed")?;
        if let Err(e) = self.build_all() {
            tracing::error!(error = %e, "pipeline instantiation failed, rolling back");
            self.discard();
            return Err(e);
        }
        self.state = RegistryState::Instantiated;
        Ok(())
    }

    fn build_all(&mut self) -> Result<(), PipelineError> {
        let Some(layout) = self.layout.as_ref() else {
            return Err(PipelineError::Init("no layout".into()));
        };

        // Pools are created in `ThreadPools` order, so `get_thread_pool(i)` is
        // the i-th listed pool whether or not a stage binds to it.
        let mut pool_index: HashMap<String, usize> = HashMap::new();
        for pool_spec in &layout.pools {
            pool_index.insert(pool_spec.name.clone(), self.pools.len());
            self.pools
                .push(Arc::new(WorkerPool::new(&pool_spec.name, pool_spec.count)));
        }

        for spec in &layout.stages {
            let logic = self.factory.build(spec)?;
            let idx = *pool_index.get(&spec.pool).ok_or_else(|| {
                PipelineError::Init(format!(
                    "stage '{}': thread pool '{}' is not defined",
                    spec.name, spec.pool
                ))
            })?;

            let stage = StageRef::new(
                &spec.name,
                &spec.kind,
                logic,
                Arc::clone(&self.pools[idx]),
                spec.next.clone(),
                layout.history,
            );
            self.stages.insert(spec.name.clone(), stage);
            self.stage_order.push(spec.name.clone());
        }

        for name in &self.stage_order {
            let stage = &self.stages[name];
            stage
                .initialize(|next| self.stages.get(next).cloned())
                .map_err(|e| PipelineError::Init(e.to_string()))?;
        }
        Ok(())
    }

    /// Mark every stage running and start the pools and the deadline sweeper.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.expect_state(&[RegistryState::Instantiated], "instantiated")?;

        for name in &self.stage_order {
            self.stages[name].mark_running();
        }
        for pool in &self.pools {
            if let Err(e) = pool.start(pool.size()) {
                let err = PipelineError::Init(format!("thread pool '{}': {e}", pool.name()));
                self.teardown();
                return Err(err);
            }
        }

        let interval = self
            .layout
            .as_ref()
            .map_or(super::layout::DEFAULT_SWEEP_INTERVAL, |l| l.sweep_interval);
        match Sweeper::spawn(self.pools.clone(), interval) {
            Ok(sweeper) => self.sweeper = Some(sweeper),
            Err(e) => {
                self.teardown();
                return Err(PipelineError::Init(format!("deadline sweeper: {e}")));
            }
        }

        self.state = RegistryState::Running;
        tracing::info!(
            pools = self.pools.len(),
            stages = self.stages.len(),
            "pipeline running"
        );
        Ok(())
    }

    /// parse → instantiate → start, stopping at the first failure.
    pub fn init(&mut self, config: &Table) -> Result<(), PipelineError> {
        self.parse(config)?;
        self.instantiate()?;
        self.start()
    }

    /// Same as [`Registry::init`] for a prepared layout.
    pub fn init_with_layout(&mut self, layout: PipelineLayout) -> Result<(), PipelineError> {
        self.set_layout(layout)?;
        self.instantiate()?;
        self.start()
    }

    pub fn get_stage(&self, name: &str) -> Option<StageRef> {
        self.stages.get(name).cloned()
    }

    pub fn get_thread_pool(&self, index: usize) -> Option<Arc<WorkerPool>> {
        self.pools.get(index).cloned()
    }

    pub fn thread_pool(&self, name: &str) -> Option<Arc<WorkerPool>> {
        self.pools.iter().find(|p| p.name() == name).cloned()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stage_order.clone()
    }

    /// Events waiting in each stage's queue, in config order.
    pub fn queue_status(&self) -> Vec<(String, usize)> {
        self.stage_order
            .iter()
            .map(|name| (name.clone(), self.stages[name].queue_len()))
            .collect()
    }

    /// Stop the pools, clean up every stage and drop everything. Idempotent.
    pub fn cleanup(&mut self) {
        if self.state == RegistryState::CleanedUp {
            return;
        }
        let was_running = self.state == RegistryState::Running;
        self.teardown();
        if was_running {
            tracing::info!("pipeline stopped");
        }
    }

    fn teardown(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        // Quiesce first so no handler runs while stages are cleaned up.
        for pool in &self.pools {
            pool.shutdown();
        }
        for name in &self.stage_order {
            self.stages[name].cleanup();
        }
        for pool in &self.pools {
            pool.shutdown();
        }
        self.discard();
        self.state = RegistryState::CleanedUp;
    }

    fn discard(&mut self) {
        for stage in self.stages.values() {
            if stage.state() != StageState::CleanedUp {
                stage.cleanup();
            }
        }
        self.stages.clear();
        self.stage_order.clear();
        self.pools.clear();
    }

    fn expect_state(&self, allowed: &[RegistryState], expected: &'static str) -> Result<(), PipelineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PipelineError::State {
                expected,
                actual: self.state.as_str(),
            })
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cleanup();
    }
}
