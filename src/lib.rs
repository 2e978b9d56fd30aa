//! A session driver for `sertop`, the S-expression protocol frontend to the
//! Coq proof assistant.
//!
//! A variable of type [`driver::Driver`] represents one live `sertop`
//! subprocess together with the driver's private mirror of whatever the
//! prover currently believes about the session: the state id last reached,
//! the focused/background/shelved/given-up proof obligations, the tactic
//! history tree, the open module/section nesting, and the registry of lemma
//! statements introduced so far. You construct a `Driver`, feed it Coq source
//! text one sentence (or semicolon-joined tactic chain) at a time through
//! [`driver::Driver::run_stmt`], and query the mirror or the prover's
//! read-only endpoints (`Check`, `Locate`, `Search`, ...) in between.
//!
//! ## On recovery
//!
//! Every `run_stmt` is a transaction: `Add` the sentence, `Exec` its state
//! id, and reconcile the mirror against what actually happened. A failure at
//! any point in that transaction is routed through [`recovery`], which
//! decides — per the classified exception kind — whether a `cancel_failed`
//! is enough to get back to a consistent session, or whether the prover must
//! be killed and the whole accepted command log replayed against a fresh one.
//! The expensive, fallible operation — a round trip to a live prover — stays
//! behind a narrow interface the rest of the crate never has to reason about
//! directly.
//!
//! ## Module map
//!
//! - [`sexp`] — the S-expression value type and its hand-rolled parser.
//! - [`transport`] — the duplex pipe to the subprocess (or a scripted double
//!   for tests).
//! - [`classifier`] — turns a raw wire line into a closed
//!   [`classifier::ClassifiedMessage`].
//! - [`preprocess`] — sentence-level recognition: comment stripping,
//!   escaping, proof-starter/-ender detection, module/section tracking,
//!   lemma-statement extraction, and the tactic linearizer.
//! - [`mirror`] — the proof-state data model.
//! - [`query`] — the read-only `Check`/`Locate`/`Search`/... round trips.
//! - [`recovery`] — cancellation and reset+replay.
//! - [`driver`] — ties all of the above together into [`driver::Driver`].
//! - [`config`] — [`config::DriverOptions`] and its builder.
//! - [`error`] — the [`error::DriverError`] taxonomy.
//! - [`coqproject`] — `_CoqProject` discovery.

pub mod classifier;
pub mod config;
pub mod coqproject;
pub mod driver;
pub mod error;
pub mod mirror;
pub mod preprocess;
pub mod query;
pub mod recovery;
pub mod sexp;
pub mod transport;
