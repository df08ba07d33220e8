//! # Beamline Workflow Broker
//!
//! This crate sits between beamline control and an external strategy engine. The engine runs
//! as a separate process and drives an experiment by calling back into the beamline: asking
//! for configuration, for sample centring at given goniostat rotations, for an operator's
//! lattice choice, and for the acquisition of the sweeps it proposes. The broker serialises
//! those calls onto a single control task, runs the matching hardware procedures through a
//! task queue, and answers each call exactly once.
//!
//! ## Crate Structure
//!
//! - **`connection`**: the `WorkflowConnection` facade, its OFF/ON/RUNNING/OPEN state
//!   machine, the engine-facing `MessageChannel`, and the dispatch loop.
//! - **`protocol`**: message types, payload records, and enactment/correlation ids.
//! - **`handlers`**: one `MessageHandler` per message type, collected in a `HandlerSet`.
//! - **`queue`**: the task tree and `QueueController` that executes centring and data
//!   collection under an explicit sibling-failure policy.
//! - **`geometry`** and **`acquisition`**: axis settings, rotation/translation records, and
//!   the sweeps of a collection proposal.
//! - **`recentring`**: the external recentring calculator (namelist input, output parsing).
//! - **`engine`**: launching and supervising the engine process.
//! - **`hardware`**: capability traits, a device repository, mock devices, and the
//!   goniostat task executor.
//! - **`operator`** and **`store`**: operator prompts and collection metadata sinks.
//! - **`sim`**: a scripted in-process engine for simulation and tests.
//! - **`config`**, **`logging`**, **`error`**: configuration loading, tracing setup, and the
//!   crate error type.

pub mod acquisition;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod handlers;
pub mod hardware;
pub mod logging;
pub mod operator;
pub mod protocol;
pub mod queue;
pub mod recentring;
pub mod sim;
pub mod store;

pub use config::WorkflowConfig;
pub use connection::{AbortHandle, ConnectionState, RunOutcome, WorkflowConnection};
pub use error::{WorkflowError, WorkflowResult};
