//! # Beamline Control Core Library
//!
//! This crate is the concurrency and orchestration substrate of a beamline
//! control system: the observable-state framework shared by every hardware
//! device and long-running activity, and the data-collection and automation
//! engines built on top of it. Presentation layers (GUIs, consoles) are thin
//! consumers of the state transitions emitted here.
//!
//! ## Crate Structure
//!
//! - **`signals`**: Observable state objects with change notification,
//!   marshalled onto one coordination thread in submission order.
//! - **`health`**: Bitmask severities and per-context health aggregation.
//! - **`device`**: Base device housekeeping: pending children, aggregate
//!   readiness, and the stuck-component liveness monitor.
//! - **`engine`**: The engine lifecycle framework (start/pause/resume/stop on
//!   a dedicated worker), plus the concrete engines:
//!   - **`engine::script`**: one-shot hardware mode transitions;
//!   - **`engine::collector`**: multi-wedge exposure sequencing with
//!     beam-loss pause and resume-from-disk recovery;
//!   - **`engine::automation`**: multi-sample task sequencing.
//! - **`dataset`**: Runs, wedges, frameset strings, disk scans and merged
//!   per-dataset summary files.
//! - **`beamline`**: Capability traits for every hardware collaborator and
//!   the injected `Beamline` bundle with its shared hardware lock.
//! - **`hardware`**: Mock collaborator implementations for tests, the CLI
//!   and simulations.
//! - **`config`**: Figment-based layered configuration with validation.
//! - **`logging`**: Tracing subscriber setup from configuration.
//! - **`error`**: The `BeamlineError` enum for structured failures.

pub mod beamline;
pub mod config;
pub mod dataset;
pub mod device;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod health;
pub mod logging;
pub mod signals;
