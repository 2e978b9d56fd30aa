//! Classifies raw inbound messages into a closed tagged enumeration.
//!
//! This is the single match site the rest of the crate relies on: every
//! shape the prover can send crosses through [`classify`] exactly once, and
//! everything downstream works with [`ClassifiedMessage`] rather than raw
//! S-expressions. Keeping the dispatch closed here (instead of scattering
//! shape matches across the executor, the query layer, and the recovery
//! controller) is what makes it tractable to add a new `Feedback` kind or a
//! new `CoqExn` sub-classification later.

use lazy_static::lazy_static;
use regex::Regex;

use crate::mirror::StateId;
use crate::sexp::{self, Sexp};

/// A normalized inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedMessage {
    Ack,
    Completed,
    Added(StateId),
    /// The minimum state id among those canceled, per the wire contract
    /// that this becomes the new `cur_state`.
    Canceled(StateId),
    ObjList(Vec<Sexp>),
    CoqExn { kind: ExnKind, messages: String, raw: Sexp },
    Feedback { kind: FeedbackKind, payload: Sexp },
    /// The prover's acknowledgement of an interrupt signal.
    Break,
}

/// `CoqExn` sub-classification, per the original driver's text matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExnKind {
    Parse,
    NoSuchGoal,
    NotFound,
    /// Unrecoverable.
    Overflow,
    /// Unrecoverable.
    Anomaly,
    ReservedIdentifier,
    Unification,
    Other,
}

/// `Feedback` sub-kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackKind {
    Processed,
    ProcessingIn,
    Message { level: String, payload: String },
    Other(String),
}

lazy_static! {
    static ref RE_PARSE: Regex =
        Regex::new(r"Stream\.Error|Syntax error|CLexer\.Error|Invalid_argument").unwrap();
    static ref RE_NO_SUCH_GOAL: Regex = Regex::new(r"NoSuchGoals").unwrap();
    static ref RE_NOT_FOUND: Regex = Regex::new(r"Not_found").unwrap();
    static ref RE_OVERFLOW: Regex = Regex::new(r"Overflowed|Stack overflow").unwrap();
    static ref RE_ANOMALY: Regex = Regex::new(r"Anomaly").unwrap();
    static ref RE_RESERVED: Regex = Regex::new(r"identifier.*is reserved").unwrap();
    static ref RE_UNIFICATION: Regex =
        Regex::new(r"Unable to unify|CErrors\.UserError|ExplainErr\.EvaluatedError").unwrap();
}

/// Classify `CoqExn` message text into an `ExnKind`. Order matters:
/// overflow and anomaly are checked early since they are unrecoverable and
/// must never be mistaken for a merely-recoverable kind.
pub fn classify_exn_text(text: &str) -> ExnKind {
    if RE_OVERFLOW.is_match(text) {
        ExnKind::Overflow
    } else if RE_ANOMALY.is_match(text) {
        ExnKind::Anomaly
    } else if RE_PARSE.is_match(text) {
        ExnKind::Parse
    } else if RE_NO_SUCH_GOAL.is_match(text) {
        ExnKind::NoSuchGoal
    } else if RE_NOT_FOUND.is_match(text) {
        ExnKind::NotFound
    } else if RE_RESERVED.is_match(text) {
        ExnKind::ReservedIdentifier
    } else if RE_UNIFICATION.is_match(text) {
        ExnKind::Unification
    } else {
        ExnKind::Other
    }
}

/// The bounded-depth search for `(str "...")` leaves inside a `CoqExn`
/// payload, concatenated in document order. The depth bound mirrors the
/// original driver's own bound and exists only to stop runaway recursion on
/// a malformed payload; real `CoqExn` nesting never gets close to it.
const MAX_EXN_SEARCH_DEPTH: usize = 30;

fn collect_str_leaves(node: &Sexp, depth: usize, out: &mut String) {
    if depth > MAX_EXN_SEARCH_DEPTH {
        return;
    }
    if let Sexp::List(items) = node {
        if items.len() == 2 {
            if let (Some("str"), Sexp::Atom(s)) = (items[0].as_atom(), &items[1]) {
                out.push_str(s);
                return;
            }
        }
        for item in items {
            collect_str_leaves(item, depth + 1, out);
        }
    }
}

fn extract_exn_messages(payload: &Sexp) -> String {
    let mut out = String::new();
    collect_str_leaves(payload, 0, &mut out);
    out
}

fn state_id_of(sexp: &Sexp) -> Option<StateId> {
    match sexp {
        Sexp::Atom(s) => s.parse::<i64>().ok().map(StateId),
        _ => None,
    }
}

/// Parse and classify one raw line from the prover.
pub fn classify(raw: &str) -> Result<ClassifiedMessage, crate::error::DriverError> {
    if raw.trim() == "Sys.Break" {
        return Ok(ClassifiedMessage::Break);
    }
    let parsed = sexp::parse(raw).map_err(|_| crate::error::DriverError::BadResponse { raw: raw.to_string() })?;
    classify_sexp(&parsed).ok_or_else(|| crate::error::DriverError::BadResponse { raw: raw.to_string() })
}

fn classify_sexp(sexp: &Sexp) -> Option<ClassifiedMessage> {
    let items = sexp.as_list()?;
    match sexp.head()? {
        "Answer" => classify_answer(items),
        "Feedback" => classify_feedback(items).map(|(kind, payload)| ClassifiedMessage::Feedback { kind, payload }),
        _ => None,
    }
}

fn classify_answer(items: &[Sexp]) -> Option<ClassifiedMessage> {
    // (Answer <tag> <body>)
    let body = items.get(2)?;
    match body {
        Sexp::Atom(a) if a == "Ack" => Some(ClassifiedMessage::Ack),
        Sexp::Atom(a) if a == "Completed" => Some(ClassifiedMessage::Completed),
        Sexp::List(_) => {
            let tag = body.head()?;
            let inner = body.as_list()?;
            match tag {
                "Added" => {
                    let sid = inner.get(1).and_then(state_id_of)?;
                    Some(ClassifiedMessage::Added(sid))
                }
                "Canceled" => {
                    let ids_list = inner.get(1)?.as_list()?;
                    let min = ids_list.iter().filter_map(state_id_of).min()?;
                    Some(ClassifiedMessage::Canceled(min))
                }
                "ObjList" => {
                    let objs = inner.get(1)?.as_list()?.to_vec();
                    Some(ClassifiedMessage::ObjList(objs))
                }
                "CoqExn" => {
                    let payload = body.clone();
                    let messages = extract_exn_messages(&payload);
                    let kind = classify_exn_text(&messages);
                    Some(ClassifiedMessage::CoqExn { kind, messages, raw: payload })
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn classify_feedback(items: &[Sexp]) -> Option<(FeedbackKind, Sexp)> {
    // (Feedback ((... (contents <contents>) ...)))
    let body = items.get(1)?;
    let fields = body.as_list()?;
    let contents = fields.iter().find_map(|f| {
        let pair = f.as_list()?;
        if pair.first()?.as_atom()? == "contents" {
            pair.get(1)
        } else {
            None
        }
    })?;
    let kind = match contents.head() {
        Some("Processed") => FeedbackKind::Processed,
        Some("ProcessingIn") => FeedbackKind::ProcessingIn,
        Some("Message") => {
            let inner = contents.as_list()?;
            let level = inner
                .get(1)
                .and_then(Sexp::as_list)
                .and_then(|opts| opts.iter().find_map(|o| {
                    let pair = o.as_list()?;
                    if pair.first()?.as_atom()? == "level" {
                        pair.get(1)?.as_atom()
                    } else {
                        None
                    }
                }))
                .unwrap_or("")
                .to_string();
            let payload = inner
                .get(3)
                .and_then(|s| {
                    let pair = s.as_list()?;
                    if pair.first()?.as_atom()? == "Pp_string" {
                        pair.get(1)?.as_atom().map(str::to_string)
                    } else {
                        None
                    }
                })
                .unwrap_or_else(|| inner.get(3).map(|s| s.to_string()).unwrap_or_default());
            FeedbackKind::Message { level, payload }
        }
        Some(other) => FeedbackKind::Other(other.to_string()),
        None => FeedbackKind::Other(contents.to_string()),
    };
    Some((kind, body.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ack_and_completed() {
        assert_eq!(classify("(Answer 0 Ack)").unwrap(), ClassifiedMessage::Ack);
        assert_eq!(classify("(Answer 0 Completed)").unwrap(), ClassifiedMessage::Completed);
    }

    #[test]
    fn classifies_added() {
        assert_eq!(classify("(Answer 0 (Added 3 () ()))").unwrap(), ClassifiedMessage::Added(StateId(3)));
    }

    #[test]
    fn classifies_canceled_takes_minimum() {
        assert_eq!(
            classify("(Answer 0 (Canceled (5 3 4)))").unwrap(),
            ClassifiedMessage::Canceled(StateId(3))
        );
    }

    #[test]
    fn classifies_break_atom() {
        assert_eq!(classify("Sys.Break").unwrap(), ClassifiedMessage::Break);
    }

    #[test]
    fn classifies_coqexn_and_extracts_messages() {
        let raw = r#"(Answer 0 (CoqExn (1 2 (Some 3) (str "Unable to unify") (str " a with b"))))"#;
        match classify(raw).unwrap() {
            ClassifiedMessage::CoqExn { kind, messages, .. } => {
                assert_eq!(kind, ExnKind::Unification);
                assert_eq!(messages, "Unable to unify a with b");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn bad_response_on_unrecognized_shape() {
        assert!(classify("(Weird 1 2)").is_err());
    }

    #[test]
    fn exn_text_classification_prioritizes_unrecoverable_kinds() {
        assert_eq!(classify_exn_text("Anomaly: Uncaught exception Stack overflow"), ExnKind::Overflow);
        assert_eq!(classify_exn_text("Anomaly: some other thing"), ExnKind::Anomaly);
        assert_eq!(classify_exn_text("Syntax error"), ExnKind::Parse);
        assert_eq!(classify_exn_text("identifier foo is reserved"), ExnKind::ReservedIdentifier);
        assert_eq!(classify_exn_text("something else entirely"), ExnKind::Other);
    }
}
