//! In-process scripted engine.
//!
//! [`ScriptedEngine`] stands in for the external strategy engine: it plays a fixed list of
//! payloads through a [`MessageChannel`] from its own task, records every exchange, and
//! behaves like the real engine at the end of a run.
//!
//! - A request answered with an abort makes it send `WorkflowAborted` and stop.
//! - A script without a terminal message is closed with `WorkflowCompleted`.
//!
//! [`run_simulation`] wires it to mock hardware for the `simulate` command.

use crate::acquisition::{CollectionProposal, Scan, Sweep};
use crate::config::WorkflowConfig;
use crate::connection::{MessageChannel, RunOutcome, WorkflowConnection};
use crate::engine::{EngineExit, EngineProcess};
use crate::error::{WorkflowError, WorkflowResult};
use crate::geometry::{AxisSettings, GoniostatRotation};
use crate::handlers::{HandlerContext, HandlerSet};
use crate::hardware::{GoniostatExecutor, HardwareRepository, MockDetector};
use crate::operator::ScriptedOperator;
use crate::protocol::{
    ChooseLattice, MessageCategory, ObtainPriorInformation, Payload, RequestCentring,
    RequestConfiguration, Response,
};
use crate::queue::QueueController;
use crate::store::{CollectionRecord, InMemorySink};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long [`ScriptedEngine::stop`] waits for the script task before killing it.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// One call made by the scripted engine and the answer it got.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    /// Payload sent to the broker
    pub request: Payload,
    /// Correlation id of the call
    pub correlation_id: String,
    /// Answer received, `None` for notifications
    pub response: Response,
}

/// Shared record of a scripted conversation.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<Exchange>>>);

impl Transcript {
    fn push(&self, exchange: Exchange) {
        if let Ok(mut exchanges) = self.0.lock() {
            exchanges.push(exchange);
        }
    }

    /// Snapshot of the exchanges so far.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of exchanges so far.
    pub fn len(&self) -> usize {
        self.0.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether no call was made yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Engine that plays a script through the message channel.
#[derive(Debug)]
pub struct ScriptedEngine {
    channel: MessageChannel,
    enactment_id: String,
    script: Vec<Payload>,
    transcript: Transcript,
    task: Option<JoinHandle<()>>,
}

impl ScriptedEngine {
    /// Engine that plays `script` under `enactment_id` once started.
    pub fn new(channel: MessageChannel, enactment_id: impl Into<String>, script: Vec<Payload>) -> Self {
        Self {
            channel,
            enactment_id: enactment_id.into(),
            script,
            transcript: Transcript::default(),
            task: None,
        }
    }

    /// Handle on the conversation record; stays valid after the engine is boxed.
    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }
}

async fn play(channel: MessageChannel, enactment_id: String, script: Vec<Payload>, transcript: Transcript) {
    let mut calls = 0usize;
    let mut call = |payload: Payload| {
        calls += 1;
        let correlation_id = format!("c{calls}");
        let channel = channel.clone();
        let enactment_id = enactment_id.clone();
        let transcript = transcript.clone();
        async move {
            let response = channel
                .call(payload.clone(), &enactment_id, Some(&correlation_id))
                .await;
            debug!(%correlation_id, ?response, "Scripted engine got answer");
            transcript.push(Exchange {
                request: payload,
                correlation_id,
                response: response.clone(),
            });
            response
        }
    };

    for payload in script {
        let category = payload.message_type().map(|t| t.category());
        let response = call(payload).await;
        match category {
            Some(MessageCategory::Terminal) => return,
            Some(MessageCategory::Request) | None => {
                if let Some(Payload::BeamlineAbort(abort)) = &response {
                    info!(reason = %abort.reason, "Scripted engine received abort");
                    if !channel.is_closed() {
                        call(Payload::WorkflowAborted).await;
                    }
                    return;
                }
            }
            Some(MessageCategory::Notification) => {}
        }
    }
    call(Payload::WorkflowCompleted).await;
}

#[async_trait]
impl EngineProcess for ScriptedEngine {
    async fn start(&mut self) -> WorkflowResult<()> {
        if self.task.is_some() {
            return Err(WorkflowError::EngineProcess("engine is already running".into()));
        }
        info!(enactment_id = %self.enactment_id, messages = self.script.len(), "Starting scripted engine");
        self.task = Some(tokio::spawn(play(
            self.channel.clone(),
            self.enactment_id.clone(),
            std::mem::take(&mut self.script),
            self.transcript.clone(),
        )));
        Ok(())
    }

    async fn stop(&mut self) -> WorkflowResult<()> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!("Scripted engine did not finish; cancelling it");
            task.abort();
        }
        Ok(())
    }

    async fn abort(&mut self) -> WorkflowResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn wait(&mut self) -> WorkflowResult<EngineExit> {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let joined = task.await;
        self.task = None;
        match joined {
            Ok(()) => Ok(EngineExit { code: Some(0) }),
            Err(e) if e.is_cancelled() => Ok(EngineExit { code: None }),
            Err(e) => Err(WorkflowError::EngineProcess(format!("scripted engine panicked: {e}"))),
        }
    }
}

fn rotation(omega: f64, kappa: f64, phi: f64) -> GoniostatRotation {
    GoniostatRotation::new(AxisSettings::new([
        ("omega", omega),
        ("kappa", kappa),
        ("phi", phi),
    ]))
}

/// Proposal of `sweeps` sweeps named "sweep", one 0.1° scan series of 10° each.
pub fn demo_proposal(sweeps: u32) -> WorkflowResult<CollectionProposal> {
    let sweeps = (0..sweeps)
        .map(|i| {
            let start = f64::from(i) * 90.0;
            Sweep {
                id: Uuid::new_v4(),
                base_name: "sweep".into(),
                rotation: rotation(start, 0.0, f64::from(i) * 30.0),
                scan_axis: "omega".into(),
                start_deg: start,
                width_deg: 10.0,
                detector_distance_mm: 250.0,
                wavelength_a: 0.976,
                scans: vec![Scan {
                    id: Uuid::new_v4(),
                    start_deg: start,
                    width_deg: 10.0,
                    image_width_deg: 0.1,
                    exposure_s: 0.01,
                    first_image_no: 1,
                }],
            }
        })
        .collect();
    CollectionProposal::new("native", "characterisation", sweeps)
}

/// A complete characterisation conversation: setup, `rotations` centrings, lattice choice,
/// one collection proposal, completion.
pub fn standard_conversation(rotations: u32, proposal: CollectionProposal) -> Vec<Payload> {
    let mut script = vec![
        Payload::SubprocessStarted {
            name: "strategy".into(),
        },
        Payload::RequestConfiguration(RequestConfiguration),
        Payload::ObtainPriorInformation(ObtainPriorInformation),
        Payload::Info {
            text: "Calculating centring strategy".into(),
        },
        Payload::PrepareForCentring,
    ];
    for setting in 1..=rotations {
        script.push(Payload::RequestCentring(RequestCentring {
            current_setting_no: setting,
            total_rotations: rotations,
            goniostat_rotation: rotation(0.0, f64::from(setting - 1) * 45.0, 0.0),
        }));
    }
    script.extend([
        Payload::ChooseLattice(ChooseLattice {
            lattice_format: "IDXREF".into(),
            solutions: vec!["P 4 2 2  a=78.1 c=37.2".into(), "P 2 2 2  a=78.1 b=78.2 c=37.2".into()],
        }),
        Payload::CollectionProposal(proposal),
        Payload::SubprocessStopped,
        Payload::WorkflowCompleted,
    ]);
    script
}

/// Settings for [`run_simulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationOptions {
    /// Centring rotations in the conversation
    pub rotations: u32,
    /// Sweeps in the collection proposal
    pub sweeps: u32,
    /// Make the detector fail on this sweep (1-based)
    pub fail_collection: Option<u32>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            rotations: 3,
            sweeps: 3,
            fail_collection: None,
        }
    }
}

/// What a simulated run produced.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// How the run ended
    pub outcome: RunOutcome,
    /// Every call the engine made
    pub exchanges: Vec<Exchange>,
    /// Records written by the collection sink
    pub records: Vec<CollectionRecord>,
}

impl SimulationReport {
    /// Calls that were answered with an abort.
    pub fn aborted_calls(&self) -> usize {
        self.exchanges
            .iter()
            .filter(|exchange| exchange.response.as_ref().is_some_and(Payload::is_abort))
            .count()
    }
}

/// Run the standard conversation against mock hardware.
pub async fn run_simulation(
    config: &WorkflowConfig,
    options: SimulationOptions,
) -> WorkflowResult<SimulationReport> {
    let mut detector = MockDetector::new();
    if let Some(series) = options.fail_collection {
        detector = detector.fail_on_series(series);
    }
    let axes = config
        .rotation_axis_names()
        .into_iter()
        .chain(config.recentring.translation_axes.iter().map(String::as_str));
    let hardware = Arc::new(HardwareRepository::simulated_with_detector(axes, detector));

    let executor = GoniostatExecutor::from_config(hardware, &config.recentring);
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
    let mut connection = WorkflowConnection::new(&config.connection, HandlerSet::standard(), context);

    let channel = connection.connect()?;
    let script = standard_conversation(options.rotations, demo_proposal(options.sweeps)?);
    let engine = ScriptedEngine::new(channel, Uuid::new_v4().to_string(), script);
    let transcript = engine.transcript();

    connection.start(Box::new(engine)).await?;
    let outcome = connection.run().await?;

    Ok(SimulationReport {
        outcome,
        exchanges: transcript.exchanges(),
        records: sink.records(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use crate::queue::EntryStatus;

    #[test]
    fn standard_conversation_shape() {
        let script = standard_conversation(2, demo_proposal(1).unwrap());
        let types: Vec<MessageType> = script.iter().filter_map(Payload::message_type).collect();
        assert_eq!(types.first(), Some(&MessageType::SubprocessStarted));
        assert_eq!(types.last(), Some(&MessageType::WorkflowCompleted));
        assert_eq!(
            types
                .iter()
                .filter(|t| **t == MessageType::RequestCentring)
                .count(),
            2
        );
    }

    #[test]
    fn demo_proposal_counts_images() {
        let proposal = demo_proposal(2).unwrap();
        assert_eq!(proposal.image_count().unwrap(), 200);
    }

    #[tokio::test]
    async fn simulation_completes() {
        let report = run_simulation(&WorkflowConfig::default(), SimulationOptions::default())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.aborted_calls(), 0);
        assert_eq!(report.records.len(), 3);
        assert!(report.records.iter().all(|r| r.status == EntryStatus::Success));
    }

    #[tokio::test]
    async fn failed_sweep_aborts_the_run() {
        let options = SimulationOptions {
            fail_collection: Some(2),
            ..Default::default()
        };
        let report = run_simulation(&WorkflowConfig::default(), options).await.unwrap();
        assert!(matches!(report.outcome, RunOutcome::Aborted(_)));
        assert_eq!(report.aborted_calls(), 1);
        let last = report.exchanges.last().unwrap();
        assert_eq!(last.request, Payload::WorkflowAborted);
    }
}
