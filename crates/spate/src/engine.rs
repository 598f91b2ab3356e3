use std::{
    sync::{Arc, Mutex, atomic::Ordering},
    thread,
};

use tracing::info;

use crate::{
    config::{Config, InstanceId, StateHandler},
    error::Error,
    instance::{Instance, StateEvent},
    registry::Registry,
    report::{ReportSink, StdoutSink, TrafficReport},
    traffic,
};

/// Sentinel id addressing every live instance in [`Engine::stop_instance`].
pub const ALL_INSTANCES: InstanceId = -1;

/// Hosts the instance registry, the report sink and the engine-wide state
/// handler. One engine runs any number of concurrent instances; independent
/// engines are fully isolated.
pub struct Engine {
    registry: Arc<Registry>,
    sink: Arc<dyn ReportSink>,
    state_handler: Mutex<Option<Arc<StateHandler>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine printing reports through [`StdoutSink`].
    pub fn new() -> Self {
        Self::with_sink(Arc::new(StdoutSink))
    }

    /// Engine routing every report record through the given sink.
    pub fn with_sink(sink: Arc<dyn ReportSink>) -> Self {
        Self { registry: Arc::new(Registry::default()), sink, state_handler: Mutex::new(None) }
    }

    /// Installs the fallback state handler for instances whose config does
    /// not carry its own.
    pub fn set_state_handler<F>(&self, handler: F)
    where
        F: Fn(InstanceId, &StateEvent) + Send + Sync + 'static,
    {
        *self.state_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Validates the config, registers an instance and spawns its workers.
    /// Returns the assigned id (>= 1). Once registration succeeded, any
    /// failure still delivers a final `Closed` callback.
    pub fn start_instance(&self, cfg: &Config) -> Result<InstanceId, Error> {
        cfg.validate()?;

        let handler =
            cfg.state_handler.clone().or_else(|| self.state_handler.lock().unwrap().clone());
        let registry = self.registry.clone();
        let sink = self.sink.clone();
        let inst = self
            .registry
            .insert_with(cfg.instance_id, |id| {
                Arc::new(Instance::new(cfg, id, sink, handler, registry))
            })?;
        let id = inst.id;
        info!(id, role = ?cfg.role, proto = ?cfg.proto, "starting instance");

        // the report worker comes first: its handle gates instance deletion
        let report_inst = inst.clone();
        let report_handle = thread::Builder::new()
            .name(format!("spate-report-{id}"))
            .spawn(move || crate::report::report_worker(report_inst));
        match report_handle {
            Ok(handle) => *inst.report_handle.lock().unwrap() = Some(handle),
            Err(_) => {
                inst.delete();
                return Err(Error::Fatal("could not start report worker"));
            }
        }

        inst.is_running.store(true, Ordering::Release);
        let traffic_inst = inst.clone();
        let traffic_handle = thread::Builder::new()
            .name(format!("spate-traffic-{id}"))
            .spawn(move || traffic::traffic_worker(traffic_inst));
        if traffic_handle.is_err() {
            inst.stop_exec();
            if !inst.delete() {
                return Err(Error::Timeout);
            }
            return Err(Error::Fatal("could not start traffic worker"));
        }

        Ok(id)
    }

    /// Asks one instance (or, with [`ALL_INSTANCES`], every live instance) to
    /// stop. Returns once the instances have been told, not once they closed;
    /// completion is observable through the `Closed` state callback.
    pub fn stop_instance(&self, id: InstanceId) -> Result<(), Error> {
        if id == ALL_INSTANCES {
            self.registry.for_each(|inst| inst.force_stop());
            return Ok(());
        }
        if id <= 0 {
            return Err(Error::InvalidArg("instance id must be positive or ALL_INSTANCES"));
        }
        match self.registry.find(id) {
            Some(inst) => {
                inst.force_stop();
                Ok(())
            }
            None => Err(Error::InstanceNotFound(id)),
        }
    }

    /// Copies the cumulative counters of a live instance. The copy is not
    /// synchronized with the report worker; the intended call sites are state
    /// callbacks at `Running` or `Closed`.
    pub fn traffic_report(&self, id: InstanceId) -> Result<TrafficReport, Error> {
        if id <= 0 {
            return Err(Error::InvalidArg("instance id must be positive"));
        }
        let inst = self.registry.find(id).ok_or(Error::InstanceNotFound(id))?;
        let totals = *inst.totals.lock().unwrap();
        Ok(totals)
    }

    /// Ids of the currently registered instances.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.registry.ids()
    }
}
