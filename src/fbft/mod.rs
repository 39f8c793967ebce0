//! The FBFT state machine (C5): requests, views, sequence numbers, log
//! invariants, action generation, timers, view changes, new-view install,
//! checkpoint GC.
//!
//! Grounded on `original_source/src/fbft/actions/actions.h` (the 18-action
//! enum) and sampled `SendViewChange.cpp`/`ReceiveViewChange.cpp`/
//! `SendNewView.cpp`/`Execute.cpp`, reimplemented as pure functions over an
//! owned [`state::State`] per the design note on replacing the embedded
//! Prolog engine (§9).

pub mod actions;
pub mod apply;
pub mod state;

pub use actions::{active_actions, Action};
pub use apply::{apply, RoastDriver};
pub use state::{ReplicaParams, State, ViewChangeTimer};
