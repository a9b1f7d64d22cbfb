//! Sync engine for click-wheel iPods: decodes the on-device library and
//! play-counter files, reconciles them against a local ledger and reports
//! each listen to a scrobbling service exactly once.

pub mod config;
pub mod ipod;
pub mod ledger;
pub mod queue;
pub mod scrobble;
pub mod service;
pub mod sync;
