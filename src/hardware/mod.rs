//! Hardware collaborator implementations.
//!
//! Real beamline hardware speaks EPICS or vendor protocols through dedicated
//! control processes; this crate only depends on the capability traits in
//! [`crate::beamline`]. The mock implementations here stand in for hardware
//! in tests, simulations and the CLI.

pub mod mock;
