//! The read-only query layer: `Check`, `Locate`, `Definition`, `Assumptions`,
//! `Search`, `Env`, and the `Print` round-trip that turns a raw S-expression
//! term back into a pretty-printed string.
//!
//! Every function here is a self-contained send/drain/return round-trip; none
//! of them touch the proof-state mirror. The `Print` round-trip result is
//! memoized in a small bounded LRU (cap 128) keyed on the exact
//! S-expression string sent, since the same subterm is often printed
//! repeatedly while a caller explores a goal.

use std::time::Duration;

use fnv::FnvHashMap;

use crate::classifier::{self, ClassifiedMessage, FeedbackKind};
use crate::error::DriverError;
use crate::sexp::Sexp;
use crate::transport::Transport;

const LRU_CAP: usize = 128;

/// Bounded least-recently-used cache from canonical S-expression string to
/// its pretty-printed form. Keyed on wire text rather than anything an
/// adversary controls, so `fnv`'s non-cryptographic hasher is a fine trade
/// for the bit of cycles `SipHash` would otherwise spend here.
pub struct PrintCache {
    map: FnvHashMap<String, String>,
    order: Vec<String>,
}

impl PrintCache {
    pub fn new() -> Self {
        PrintCache { map: FnvHashMap::default(), order: Vec::new() }
    }

    pub fn get(&mut self, key: &str) -> Option<String> {
        if let Some(v) = self.map.get(key) {
            let v = v.clone();
            self.touch(key);
            Some(v)
        } else {
            None
        }
    }

    pub fn insert(&mut self, key: String, value: String) {
        if !self.map.contains_key(&key) {
            if self.order.len() >= LRU_CAP {
                let evict = self.order.remove(0);
                self.map.remove(&evict);
            }
            self.order.push(key.clone());
        } else {
            self.touch(&key);
        }
        self.map.insert(key, value);
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for PrintCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a read-only query's response stream: skip leading
/// `Processed`/`ProcessingIn` feedback, capture the first `ObjList`,
/// `CoqExn`, or `Ack`+payload, then drain through `Completed`.
fn drain_query_response(
    transport: &mut dyn Transport,
    timeout: Duration,
) -> Result<Vec<Sexp>, DriverError> {
    let mut objects = Vec::new();
    loop {
        let line = transport
            .recv_line(timeout)?
            .ok_or_else(|| DriverError::Timeout { statement: "<query>".to_string() })?;
        match classifier::classify(&line)? {
            ClassifiedMessage::Feedback { kind: FeedbackKind::Processed, .. }
            | ClassifiedMessage::Feedback { kind: FeedbackKind::ProcessingIn, .. } => continue,
            ClassifiedMessage::Feedback { .. } => continue,
            ClassifiedMessage::Ack => continue,
            ClassifiedMessage::ObjList(items) => {
                objects = items;
            }
            ClassifiedMessage::CoqExn { kind, messages, .. } => {
                return Err(crate::recovery::exn_to_error(kind, "<query>".to_string(), messages));
            }
            ClassifiedMessage::Completed => return Ok(objects),
            other => return Err(DriverError::BadResponse { raw: format!("{:?}", other) }),
        }
    }
}

/// Send a bare `(Query () <form>)` sentence and collect its response
/// objects.
pub fn run_query(
    transport: &mut dyn Transport,
    timeout: Duration,
    form: &str,
) -> Result<Vec<Sexp>, DriverError> {
    transport.send_line(&format!("(Query () {})", form))?;
    drain_query_response(transport, timeout)
}

/// Ask the prover to pretty-print a raw S-expression term via a `Print`
/// round-trip, consulting and updating `cache` first.
pub fn print_term(
    transport: &mut dyn Transport,
    timeout: Duration,
    cache: &mut PrintCache,
    sexpr: &str,
    kind: PrintKind,
) -> Result<String, DriverError> {
    if let Some(hit) = cache.get(sexpr) {
        return Ok(hit);
    }
    let tag = match kind {
        PrintKind::CoqConstr => "CoqConstr",
        PrintKind::CoqExpr => "CoqExpr",
        PrintKind::CoqPp => "CoqPp",
    };
    let sentence = format!("(Print ((pp ((pp_format PpStr)))) ({} {}))", tag, sexpr);
    transport.send_line(&sentence)?;
    let objs = drain_query_response(transport, timeout)?;
    let pretty = objs
        .iter()
        .find_map(|o| {
            let items = o.as_list()?;
            if items.first()?.as_atom()? == "CoqString" {
                items.get(1)?.as_atom().map(str::to_string)
            } else {
                None
            }
        })
        .ok_or_else(|| DriverError::BadResponse { raw: format!("{:?}", objs) })?;
    cache.insert(sexpr.to_string(), pretty.clone());
    Ok(pretty)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintKind {
    CoqConstr,
    CoqExpr,
    CoqPp,
}

/// `Locate qid`: resolve a qualified identifier to its canonical form. If
/// not found and `qid` is rooted at the synthetic top-level module, retry
/// without that prefix.
pub fn locate(
    transport: &mut dyn Transport,
    timeout: Duration,
    qid: &str,
    synthetic_top_module: Option<&str>,
) -> Result<Option<String>, DriverError> {
    let objs = run_query(transport, timeout, &format!("(Locate \"{}\")", qid))?;
    if let Some(found) = first_string_obj(&objs) {
        return Ok(Some(found));
    }
    if let Some(top) = synthetic_top_module {
        let prefix = format!("{}.", top);
        if let Some(rest) = qid.strip_prefix(&prefix) {
            let objs = run_query(transport, timeout, &format!("(Locate \"{}\")", rest))?;
            return Ok(first_string_obj(&objs));
        }
    }
    Ok(None)
}

fn first_string_obj(objs: &[Sexp]) -> Option<String> {
    objs.iter().find_map(|o| o.as_atom().map(str::to_string))
}

/// `Check`: pretty-printed type of `term`, via a `Vernac` query followed by
/// a `Print` round-trip on the returned term.
pub fn check(
    transport: &mut dyn Transport,
    timeout: Duration,
    cache: &mut PrintCache,
    term: &str,
) -> Result<String, DriverError> {
    let escaped = crate::preprocess::escape_for_wire(term);
    let objs = run_query(transport, timeout, &format!("(Vernac \"Check {}.\")", escaped))?;
    let raw = objs
        .first()
        .map(|o| o.to_string())
        .ok_or_else(|| DriverError::BadResponse { raw: "empty Check response".to_string() })?;
    print_term(transport, timeout, cache, &raw, PrintKind::CoqPp)
}

/// `Definition name`: raw S-expression body.
pub fn definition(transport: &mut dyn Transport, timeout: Duration, name: &str) -> Result<Vec<Sexp>, DriverError> {
    run_query(transport, timeout, &format!("(Definition \"{}\")", name))
}

/// `Assumptions name`: raw S-expression body.
pub fn assumptions(transport: &mut dyn Transport, timeout: Duration, name: &str) -> Result<Vec<Sexp>, DriverError> {
    run_query(transport, timeout, &format!("(Assumptions \"{}\")", name))
}

/// `Search`: up to 10 `Notice`-level `Message` feedbacks, pretty-printed.
pub fn search(transport: &mut dyn Transport, timeout: Duration, pattern: &str) -> Result<Vec<String>, DriverError> {
    let escaped = crate::preprocess::escape_for_wire(pattern);
    transport.send_line(&format!("(Query () (Vernac \"Search {}.\"))", escaped))?;
    let mut hits = Vec::new();
    loop {
        let line = transport
            .recv_line(timeout)?
            .ok_or_else(|| DriverError::Timeout { statement: "<search>".to_string() })?;
        match classifier::classify(&line)? {
            ClassifiedMessage::Feedback { kind: FeedbackKind::Message { level, payload }, .. } => {
                if level == "Notice" && hits.len() < 10 {
                    hits.push(payload);
                }
            }
            ClassifiedMessage::Feedback { .. } | ClassifiedMessage::Ack => continue,
            ClassifiedMessage::Completed => return Ok(hits),
            ClassifiedMessage::CoqExn { kind, messages, .. } => {
                return Err(crate::recovery::exn_to_error(kind, "<search>".to_string(), messages));
            }
            other => return Err(DriverError::BadResponse { raw: format!("{:?}", other) }),
        }
    }
}

/// One entry in an `Env` listing: its qualified name, its locate-derived
/// short identifier, and its pretty-printed type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub qualid: String,
    pub short_ident: Option<String>,
    pub ty: String,
}

/// `Env`: enumerate constants and inductives, each resolved via `Locate`
/// and printed via `Print`.
pub fn env(
    transport: &mut dyn Transport,
    timeout: Duration,
    cache: &mut PrintCache,
) -> Result<(Vec<EnvEntry>, Vec<EnvEntry>), DriverError> {
    let objs = run_query(transport, timeout, "Env")?;
    let mut constants = Vec::new();
    let mut inductives = Vec::new();
    for obj in &objs {
        let items = match obj.as_list() {
            Some(i) => i,
            None => continue,
        };
        let section = items.first().and_then(Sexp::as_atom).unwrap_or("");
        let bucket = match section {
            "CoqEnv" | "constants" => &mut constants,
            "inductives" => &mut inductives,
            _ => continue,
        };
        for entry in items.iter().skip(1) {
            let qualid = entry.head().unwrap_or_default().to_string();
            let short_ident = locate(transport, timeout, &qualid, None)?;
            let ty = print_term(transport, timeout, cache, &entry.to_string(), PrintKind::CoqPp)?;
            bucket.push(EnvEntry { qualid, short_ident, ty });
        }
    }
    Ok((constants, inductives))
}

/// Accessor for the fixed-path index the hammer's `predict` tactic uses to
/// locate its premise list within a drained feedback buffer. Kept behind
/// this single function: this encodes the current
/// prover's feedback shape, and a prover upgrade that changes it is then a
/// one-line fix here rather than a hunt through call sites.
pub fn hammer_predict_premises(feedbacks: &[Sexp]) -> Option<&Sexp> {
    feedbacks
        .get(3)?
        .as_list()?
        .get(1)?
        .as_list()?
        .get(3)?
        .as_list()?
        .get(1)?
        .as_list()?
        .get(3)?
        .as_list()?
        .get(1)?
        .as_list()?
        .get(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    #[test]
    fn print_cache_hits_avoid_a_second_round_trip() {
        let mut cache = PrintCache::new();
        cache.insert("(App x y)".to_string(), "x y".to_string());
        assert_eq!(cache.get("(App x y)"), Some("x y".to_string()));
    }

    #[test]
    fn print_cache_evicts_oldest_past_capacity() {
        let mut cache = PrintCache::new();
        for i in 0..LRU_CAP + 1 {
            cache.insert(format!("k{}", i), format!("v{}", i));
        }
        assert_eq!(cache.len(), LRU_CAP);
        assert!(cache.get("k0").is_none());
        assert!(cache.get(&format!("k{}", LRU_CAP)).is_some());
    }

    #[test]
    fn run_query_drains_through_completed() {
        let mut t = ScriptedTransport::new(vec![vec![
            "(Answer 0 (Feedback ((doc_id 0) (span_id 1) (route 0) (contents Processed))))",
            "(Answer 0 (ObjList (foo)))",
            "(Answer 0 Completed)",
        ]]);
        let objs = run_query(&mut t, Duration::from_millis(10), "Goals").unwrap();
        assert_eq!(objs, vec![Sexp::Atom("foo".to_string())]);
    }

    #[test]
    fn search_collects_up_to_ten_notice_messages() {
        let mut lines = vec![];
        for i in 0..12 {
            lines.push(format!(
                "(Answer 0 (Feedback ((doc_id 0) (span_id 1) (route 0) (contents (Message ((level Notice)) () (Pp_string \"hit{}\"))))))",
                i
            ));
        }
        lines.push("(Answer 0 Completed)".to_string());
        let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut t = ScriptedTransport::new(vec![line_refs]);
        let hits = search(&mut t, Duration::from_millis(10), "plus_comm").unwrap();
        assert_eq!(hits.len(), 10);
    }
}
