//! Stack Builder API
//!
//! The single wiring point of a host stack: validates a [`StackConfig`],
//! launches each configured executor on its own thread and owns them until
//! teardown. Executors are stopped in reverse launch order so upper layers
//! drain before the layers they post into.

use crate::client::{spawn_client_model, ClientHandle, PublicationReceiver};
use crate::executor::{
    self, DispatchTable, ExecutorHandle, ExecutorStatsSnapshot, ManagedExecutor, TaskContext,
};
use bluestack_core::{
    ExecutorConfig, OpcodePairTable, StackConfig, StackError, StackResult, Transport,
};
use std::sync::Arc;

#[cfg(not(feature = "std"))]
use log::{error, info};
#[cfg(feature = "std")]
use tracing::{error, info};

// ----------------------------------------------------------------------------
// Stack Builder
// ----------------------------------------------------------------------------

/// Builder for a [`StackHandle`]
#[derive(Debug, Clone, Default)]
pub struct StackBuilder {
    config: StackConfig,
}

impl StackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: StackConfig) -> Self {
        self.config = config;
        self
    }

    /// Add or replace one executor configuration
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        match self
            .config
            .executors
            .iter_mut()
            .find(|existing| existing.name == executor.name)
        {
            Some(existing) => *existing = executor,
            None => self.config.executors.push(executor),
        }
        self
    }

    /// Validate the configuration and create an empty stack
    pub fn build(self) -> StackResult<StackHandle> {
        self.config.validate()?;
        info!(
            "Building stack with {} configured executors",
            self.config.executors.len()
        );
        Ok(StackHandle {
            config: self.config,
            executors: Vec::new(),
        })
    }
}

// ----------------------------------------------------------------------------
// Stack Handle
// ----------------------------------------------------------------------------

/// Owner of every running executor of one stack instance
///
/// Dropping the handle shuts the stack down and joins every thread.
pub struct StackHandle {
    config: StackConfig,
    executors: Vec<Box<dyn ManagedExecutor>>,
}

impl StackHandle {
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    fn executor_config(&self, name: &str) -> StackResult<ExecutorConfig> {
        if self.executors.iter().any(|e| e.name() == name) {
            return Err(StackError::config_error(format!(
                "executor '{}' is already running",
                name
            )));
        }
        self.config
            .executor(name)
            .cloned()
            .ok_or_else(|| StackError::config_error(format!("no executor named '{}'", name)))
    }

    /// Launch the configured executor `name` with the given handlers and state
    pub fn launch<S, P, I>(
        &mut self,
        name: &str,
        table: DispatchTable<S, P>,
        init: I,
    ) -> StackResult<ExecutorHandle<P>>
    where
        S: 'static,
        P: Send + 'static,
        I: FnOnce(&TaskContext<P>) -> S + Send + 'static,
    {
        let config = self.executor_config(name)?;
        let spawned = executor::spawn(config, table, init)?;
        let handle = spawned.handle().clone();
        self.executors.push(Box::new(spawned));
        Ok(handle)
    }

    /// Launch the configured executor `name` as a client model using the
    /// stack's correlator configuration
    pub fn launch_client_model<T, F>(
        &mut self,
        name: &str,
        pairs: Arc<OpcodePairTable>,
        make_transport: F,
    ) -> StackResult<(ClientHandle, PublicationReceiver)>
    where
        T: Transport + 'static,
        F: FnOnce(&TaskContext<crate::client::ClientParam>) -> T + Send + 'static,
    {
        let config = self.executor_config(name)?;
        let (spawned, client, publications) =
            spawn_client_model(config, self.config.correlator.clone(), pairs, make_transport)?;
        self.executors.push(Box::new(spawned));
        Ok((client, publications))
    }

    /// Names of running executors in launch order
    pub fn executor_names(&self) -> Vec<&str> {
        self.executors.iter().map(|e| e.name()).collect()
    }

    /// Counters of every running executor
    pub fn stats(&self) -> Vec<(String, ExecutorStatsSnapshot)> {
        self.executors
            .iter()
            .map(|e| (e.name().to_string(), e.stats()))
            .collect()
    }

    /// Stop every executor after its current message, abandoning queued
    /// work. Threads are joined by [`StackHandle::shutdown`] or on drop.
    pub fn abort_all(&self) {
        for executor in self.executors.iter().rev() {
            executor.abort();
        }
    }

    /// Stop every executor in reverse launch order and join its thread.
    /// Blocks the calling thread.
    pub fn shutdown(mut self) -> StackResult<()> {
        self.stop_all()
    }

    fn stop_all(&mut self) -> StackResult<()> {
        let mut first_error = None;
        while let Some(mut executor) = self.executors.pop() {
            info!("Stopping executor '{}'", executor.name());
            executor.request_shutdown();
            if let Err(e) = executor.join() {
                error!("Executor '{}' did not stop cleanly: {}", executor.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for StackHandle {
    fn drop(&mut self) {
        let _ = self.stop_all();
    }
}
