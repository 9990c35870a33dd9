//! Core engine for boardpull: drives a WebDriver session over a project
//! tracker's board to capture work items (fields, discussions, history,
//! related links, changesets, attachments) into a resumable JSON snapshot,
//! then materializes the snapshot offline into a reviewable directory tree.

pub mod config;
pub mod convert;
pub mod driver;
pub mod extract;
pub mod materialize;
pub mod model;
pub mod reconcile;
pub mod runtime;
pub mod selectors;
pub mod snapshot;
pub mod traverse;
