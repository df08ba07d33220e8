//! Shared harness for the connection integration tests.
//!
//! `Harness::start` builds a connection on mock hardware, launches a [`ManualEngine`] and
//! spawns the dispatch loop. Tests then play the engine side through `harness.channel`.

#![allow(dead_code)]

use async_trait::async_trait;
use beamline_workflow::config::WorkflowConfig;
use beamline_workflow::connection::{
    AbortHandle, ConnectionState, MessageChannel, RunOutcome, WorkflowConnection,
};
use beamline_workflow::engine::{EngineExit, EngineProcess};
use beamline_workflow::error::WorkflowResult;
use beamline_workflow::geometry::{AxisSettings, GoniostatRotation};
use beamline_workflow::handlers::{HandlerContext, HandlerSet, MessageHandler};
use beamline_workflow::hardware::{GoniostatExecutor, HardwareRepository, MockDetector};
use beamline_workflow::operator::ScriptedOperator;
use beamline_workflow::protocol::{MessageType, Payload, Response};
use beamline_workflow::queue::QueueController;
use beamline_workflow::store::InMemorySink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// What a handler saw when it ran.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub message_type: MessageType,
    pub correlation_id: Option<String>,
    pub state: ConnectionState,
    pub subprocesses: Vec<(String, String)>,
}

/// Shared log of handler invocations.
#[derive(Debug, Clone, Default)]
pub struct Observations(Arc<Mutex<Vec<Observation>>>);

impl Observations {
    pub fn all(&self) -> Vec<Observation> {
        self.0.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<MessageType> {
        self.all().into_iter().map(|o| o.message_type).collect()
    }
}

/// Wraps a handler and records each invocation before delegating.
struct Observed {
    message_type: MessageType,
    inner: Box<dyn MessageHandler>,
    log: Observations,
    states: watch::Receiver<ConnectionState>,
}

#[async_trait]
impl MessageHandler for Observed {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let state = *self.states.borrow();
        let response = self.inner.handle(payload, ctx).await;
        let mut subprocesses: Vec<(String, String)> = ctx
            .subprocesses
            .iter()
            .map(|(id, name)| (id.to_string(), name.clone()))
            .collect();
        subprocesses.sort();
        self.log.0.lock().unwrap().push(Observation {
            message_type: self.message_type,
            correlation_id: ctx.correlation_id().map(ToString::to_string),
            state,
            subprocesses,
        });
        response
    }
}

/// Wrap every handler of `handlers` in an observer.
pub fn observe(
    mut handlers: HandlerSet,
    states: &watch::Receiver<ConnectionState>,
) -> (HandlerSet, Observations) {
    let log = Observations::default();
    for message_type in [
        MessageType::RequestConfiguration,
        MessageType::ObtainPriorInformation,
        MessageType::PrepareForCentring,
        MessageType::RequestCentring,
        MessageType::ChooseLattice,
        MessageType::CollectionProposal,
        MessageType::SubprocessStarted,
        MessageType::SubprocessStopped,
        MessageType::Info,
    ] {
        if let Some(inner) = handlers.remove(message_type) {
            handlers.register(
                message_type,
                Box::new(Observed {
                    message_type,
                    inner,
                    log: log.clone(),
                    states: states.clone(),
                }),
            );
        }
    }
    (handlers, log)
}

/// Engine whose lifetime the test controls.
pub struct ManualEngine {
    exit: Option<oneshot::Receiver<i32>>,
    lifecycle: EngineLifecycle,
}

/// Test-side view of a [`ManualEngine`].
#[derive(Debug, Clone, Default)]
pub struct EngineLifecycle {
    pub stopped: Arc<AtomicBool>,
    pub killed: Arc<AtomicBool>,
}

impl EngineLifecycle {
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl ManualEngine {
    /// Engine, its lifecycle flags, and the sender that makes it exit with a code.
    pub fn new() -> (Self, EngineLifecycle, oneshot::Sender<i32>) {
        let (tx, rx) = oneshot::channel();
        let lifecycle = EngineLifecycle::default();
        (
            Self {
                exit: Some(rx),
                lifecycle: lifecycle.clone(),
            },
            lifecycle,
            tx,
        )
    }
}

#[async_trait]
impl EngineProcess for ManualEngine {
    async fn start(&mut self) -> WorkflowResult<()> {
        Ok(())
    }

    async fn stop(&mut self) -> WorkflowResult<()> {
        self.lifecycle.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&mut self) -> WorkflowResult<()> {
        self.lifecycle.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&mut self) -> WorkflowResult<EngineExit> {
        let Some(exit) = self.exit.as_mut() else {
            return std::future::pending().await;
        };
        match exit.await {
            Ok(code) => {
                self.exit = None;
                Ok(EngineExit { code: Some(code) })
            }
            Err(_) => {
                self.exit = None;
                std::future::pending().await
            }
        }
    }
}

/// Mock goniostat with every configured axis and the given detector.
pub fn hardware(config: &WorkflowConfig, detector: MockDetector) -> Arc<HardwareRepository> {
    let axes = config
        .rotation_axis_names()
        .into_iter()
        .chain(config.recentring.translation_axes.iter().map(String::as_str));
    Arc::new(HardwareRepository::simulated_with_detector(axes, detector))
}

/// A running connection plus everything a test needs to drive and inspect it.
pub struct Harness {
    pub channel: MessageChannel,
    pub abort: AbortHandle,
    pub states: watch::Receiver<ConnectionState>,
    pub observations: Observations,
    pub sink: Arc<InMemorySink>,
    pub lifecycle: EngineLifecycle,
    pub exit: Option<oneshot::Sender<i32>>,
    run: JoinHandle<(WorkflowConnection, WorkflowResult<RunOutcome>)>,
}

impl Harness {
    /// Connection with the standard handlers on mock hardware.
    pub async fn start(config: WorkflowConfig) -> Self {
        Self::start_with(config, MockDetector::new(), |handlers| handlers).await
    }

    /// Connection with a customised detector and handler set.
    pub async fn start_with(
        config: WorkflowConfig,
        detector: MockDetector,
        customise: impl FnOnce(HandlerSet) -> HandlerSet,
    ) -> Self {
        let executor = GoniostatExecutor::from_config(hardware(&config, detector), &config.recentring);
        let queue = QueueController::new(
            "workflow",
            Arc::new(executor),
            config.queue.sibling_failure_policy,
        );
        let sink = Arc::new(InMemorySink::new());
        let context = HandlerContext::new(
            Arc::new(config.clone()),
            queue,
            Arc::new(ScriptedOperator::new()),
            sink.clone(),
        );

        let mut connection =
            WorkflowConnection::new(&config.connection, customise(HandlerSet::standard()), context);
        let states = connection.subscribe();
        let (handlers, observations) = observe(std::mem::take(connection.handlers_mut()), &states);
        *connection.handlers_mut() = handlers;

        let channel = connection.connect().unwrap();
        let (engine, lifecycle, exit) = ManualEngine::new();
        connection.start(Box::new(engine)).await.unwrap();
        let abort = connection.abort_handle();

        let run = tokio::spawn(async move {
            let outcome = connection.run().await;
            (connection, outcome)
        });

        Self {
            channel,
            abort,
            states,
            observations,
            sink,
            lifecycle,
            exit: Some(exit),
            run,
        }
    }

    /// Make the engine exit with `code`.
    pub fn exit_engine(&mut self, code: i32) {
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(code);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.states.borrow()
    }

    /// Drop the engine side of the FIFO and wait for the dispatch loop to notice.
    pub async fn drop_channel_and_finish(self) -> (WorkflowConnection, WorkflowResult<RunOutcome>) {
        let Self { channel, run, .. } = self;
        drop(channel);
        Self::join(run).await
    }

    /// Wait for the dispatch loop to end.
    pub async fn finish(self) -> (WorkflowConnection, WorkflowResult<RunOutcome>) {
        Self::join(self.run).await
    }

    async fn join(
        run: JoinHandle<(WorkflowConnection, WorkflowResult<RunOutcome>)>,
    ) -> (WorkflowConnection, WorkflowResult<RunOutcome>) {
        tokio::time::timeout(std::time::Duration::from_secs(10), run)
            .await
            .expect("dispatch loop did not end")
            .expect("dispatch loop panicked")
    }
}

/// Rotation record for `omega kappa phi`.
pub fn rotation(omega: f64, kappa: f64, phi: f64) -> GoniostatRotation {
    GoniostatRotation::new(AxisSettings::new([
        ("omega", omega),
        ("kappa", kappa),
        ("phi", phi),
    ]))
}
