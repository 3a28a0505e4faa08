#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use toml::Table;

use sedadb::error::StageError;
use sedadb::pipeline::{
    Context, Event, Registry, Stage, StageFactory, StageRef, take_context,
};
use sedadb::stages;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn doc(text: &str) -> Table {
    toml::from_str(text).expect("test config is valid TOML")
}

/// Build and start a registry from `config` with the built-in and test stages.
pub fn running_registry(config: &str, extra: impl FnOnce(&mut StageFactory)) -> Registry {
    let mut factory = test_factory();
    extra(&mut factory);
    let mut registry = Registry::new(factory);
    registry.init(&doc(config)).expect("pipeline starts");
    registry
}

pub fn test_factory() -> StageFactory {
    let mut factory = stages::default_factory();
    factory
        .register("Forward", |_| Ok(Box::new(Forward { reschedule: false })))
        .register("Rescheduler", |_| Ok(Box::new(Forward { reschedule: true })));
    factory
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("?").to_string()
}

/// Hands the event to its first downstream stage with a continuation and, on
/// resume, appends `|ctx=N|thread=<worker>` to whatever the downstream replied.
/// The `reschedule` variant acts as the downstream end instead: it replies and
/// lets the upstream resume on its own pool.
pub struct Forward {
    reschedule: bool,
}

impl Stage for Forward {
    fn handle(&self, me: &StageRef, mut event: Event) {
        if self.reschedule {
            event.set_response(b"rescheduled".to_vec());
            event.reschedule();
            return;
        }
        match me.first_downstream() {
            Some(next) => {
                event.push(me.continuation_with(7u32));
                next.submit(event);
            }
            None => event.finish_immediate(),
        }
    }

    fn resume(&self, _me: &StageRef, mut event: Event, context: Context) {
        let ctx = take_context::<u32>(context).unwrap_or(0);
        let mut reply = event.response().to_vec();
        reply.extend_from_slice(format!("|ctx={ctx}|thread={}", thread_name()).as_bytes());
        event.set_response(reply);
        event.finish();
    }
}

/// Appends every handled request to a shared log, then replies "ok".
pub struct Recorder {
    pub log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Stage for Recorder {
    fn handle(&self, _me: &StageRef, mut event: Event) {
        self.log.lock().push(event.request().to_vec());
        event.set_response(b"ok".to_vec());
        event.finish();
    }
}

pub fn recorder(factory: &mut StageFactory) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&log);
    factory.register("Recorder", move |_| {
        Ok(Box::new(Recorder {
            log: Arc::clone(&shared),
        }))
    });
    log
}

/// Holds the worker inside `handle` until released.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
    entered: Mutex<usize>,
}

impl Gate {
    pub fn release(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    pub fn entered(&self) -> usize {
        *self.entered.lock()
    }

    fn pass(&self) {
        *self.entered.lock() += 1;
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
    }
}

pub struct Blocking {
    gate: Arc<Gate>,
}

impl Stage for Blocking {
    fn handle(&self, _me: &StageRef, mut event: Event) {
        self.gate.pass();
        event.set_response(b"unblocked".to_vec());
        event.finish();
    }
}

pub fn blocking(factory: &mut StageFactory) -> Arc<Gate> {
    let gate = Arc::new(Gate::default());
    let shared = Arc::clone(&gate);
    factory.register("Blocking", move |_| {
        Ok(Box::new(Blocking {
            gate: Arc::clone(&shared),
        }))
    });
    gate
}

/// Sleeps in `handle`, then replies "slow done".
pub struct Slow {
    pub delay: Duration,
}

impl Stage for Slow {
    fn handle(&self, _me: &StageRef, mut event: Event) {
        thread::sleep(self.delay);
        event.set_response(b"slow done".to_vec());
        event.finish();
    }
}

pub fn slow(factory: &mut StageFactory, delay: Duration) {
    factory.register("Slow", move |_| Ok(Box::new(Slow { delay })));
}

/// Refuses to initialize.
pub fn rejecting(factory: &mut StageFactory) {
    factory.register("Rejecting", |spec| {
        Err(StageError::Rejected {
            stage: spec.name.clone(),
            reason: "not today".into(),
        })
    });
}
