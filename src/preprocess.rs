//! Recognizing and reshaping sentence text before it crosses the pipe.
//!
//! Everything here is textual, syntactic recognition — never term-grammar
//! parsing, which stays the prover's job. Comment stripping, escaping, the
//! `Require Import` rewrite, proof-starter/-ender
//! detection, module/section stack updates, lemma-statement extraction, and
//! the tactic linearizer all live here because the executor needs all of
//! them on the same sentence before it decides what to send.

use lazy_static::lazy_static;
use regex::Regex;

use crate::mirror::LemmaEntry;

/// Strip every `(* ... *)` comment from `input`, tracking nesting depth and
/// staying quote-aware so a `(*` inside a string literal is not mistaken for
/// a comment opener. Idempotent: the output contains no comments, so
/// running this again is a no-op.
pub fn kill_comments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let mut depth = 0usize;
    let mut in_quote = false;

    while i < bytes.len() {
        if in_quote {
            if bytes[i] == b'\\' && i + 1 < bytes.len() {
                if depth == 0 {
                    out.push(bytes[i] as char);
                    out.push(bytes[i + 1] as char);
                }
                i += 2;
                continue;
            }
            if bytes[i] == b'"' {
                in_quote = false;
            }
            if depth == 0 {
                out.push(bytes[i] as char);
            }
            i += 1;
            continue;
        }

        if bytes[i] == b'"' && depth == 0 {
            in_quote = true;
            out.push('"');
            i += 1;
            continue;
        }

        if i + 1 < bytes.len() && bytes[i] == b'(' && bytes[i + 1] == b'*' {
            depth += 1;
            i += 2;
            continue;
        }
        if depth > 0 && i + 1 < bytes.len() && bytes[i] == b'*' && bytes[i + 1] == b')' {
            depth -= 1;
            i += 2;
            continue;
        }
        if depth == 0 {
            out.push(bytes[i] as char);
        }
        i += 1;
    }
    out
}

/// Wire-escape raw text for embedding in a `"..."` sentence argument:
/// backslashes first, then quotes.
pub fn escape_for_wire(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

lazy_static! {
    static ref RE_REQUIRE_IMPORT_COQ: Regex =
        Regex::new(r"^(\s*)Require\s+Import\s+Coq\.(\S+)\s*\.(\s*)$").unwrap();
}

/// Split a preprocessed sentence into one or more sub-statements. The only
/// known split in the original driver is not really a split at all: it
/// rewrites `Require Import Coq.X.` into `Require Import X.` so that the
/// prover's own `Coq.` root alias does not shadow the user's intent. Every
/// other sentence passes through unchanged as a single sub-statement.
pub fn split_substatements(stmt: &str) -> Vec<String> {
    if let Some(caps) = RE_REQUIRE_IMPORT_COQ.captures(stmt) {
        vec![format!("{}Require Import {}.{}", &caps[1], &caps[2], &caps[3])]
    } else {
        vec![stmt.to_string()]
    }
}

lazy_static! {
    static ref RE_PROOF_STARTER: Regex = Regex::new(
        r"(?x)
        ^\s*
        (Program\s+|Polymorphic\s+)*
        (Lemma|Theorem|Definition|Fixpoint|Instance|Corollary|Remark|Proposition|
         Example|Let|Function|Property|Fact|Equations?|Coercion|Derive|Goal|
         Add\s+(Parametric\s+)?Morphism|Next\s+Obligation|Obligation\s+\d+)\b
        "
    )
    .unwrap();
    static ref RE_PROOF_ENDER: Regex = Regex::new(r"^\s*(Qed|Defined|Admitted|Abort|Save)\s*\.\s*$").unwrap();
    static ref RE_PROOF_TERM: Regex = Regex::new(r"^\s*Proof\b").unwrap();
    static ref RE_PROOF_WITH_OR_USING: Regex = Regex::new(r"^\s*Proof\s+(with|using)\b").unwrap();
}

/// `true` iff `stmt` opens a new lemma/definition/proof obligation.
pub fn is_proof_starter(stmt: &str) -> bool {
    RE_PROOF_STARTER.is_match(stmt)
}

/// `true` iff `stmt` ends the current proof: `Qed.`/`Defined.`/`Admitted.`/
/// `Abort.`/`Save`, or a bare `Proof <term>.` (as opposed to `Proof with` or
/// `Proof using`, which continue rather than close the proof).
pub fn is_proof_ender(stmt: &str) -> bool {
    if RE_PROOF_ENDER.is_match(stmt) {
        return true;
    }
    RE_PROOF_TERM.is_match(stmt) && !RE_PROOF_WITH_OR_USING.is_match(stmt) && stmt.trim() != "Proof."
}

/// How a statement affects the proof-state mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    GoalOpen,
    GoalClose,
    Unshelve,
    ProofStarter,
    EndingProof,
    Other,
}

lazy_static! {
    static ref RE_SELECTOR_OPEN: Regex = Regex::new(r"^\s*(\d+|all)\s*:\s*\{").unwrap();
    static ref RE_BARE_SELECTOR: Regex = Regex::new(r"^\s*\d+\s*:").unwrap();
}

/// Classify a single (already linearized) statement for mirror-update
/// purposes.
pub fn classify_statement(stmt: &str) -> StatementKind {
    let trimmed = stmt.trim();
    if is_proof_ender(trimmed) {
        return StatementKind::EndingProof;
    }
    if is_proof_starter(trimmed) {
        return StatementKind::ProofStarter;
    }
    if trimmed.starts_with('}') {
        return StatementKind::GoalClose;
    }
    if trimmed.starts_with('{') || RE_SELECTOR_OPEN.is_match(trimmed) || RE_BARE_SELECTOR.is_match(trimmed) {
        return StatementKind::GoalOpen;
    }
    if trimmed.contains("Unshelve") {
        return StatementKind::Unshelve;
    }
    StatementKind::Other
}

/// What a module/section-stack-affecting sentence requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSectionOp {
    OpenModule(String),
    OpenSection(String),
    End(String),
}

lazy_static! {
    static ref RE_MODULE: Regex =
        Regex::new(r"^\s*Module\s+(Import\s+|Export\s+)?([A-Za-z_][A-Za-z0-9_']*)\b(.*)$").unwrap();
    static ref RE_SECTION: Regex = Regex::new(r"^\s*Section\s+([A-Za-z_][A-Za-z0-9_']*)\s*\.").unwrap();
    static ref RE_END: Regex = Regex::new(r"^\s*End\s+([A-Za-z_][A-Za-z0-9_']*)\s*\.").unwrap();
    static ref RE_WITH: Regex = Regex::new(r"\bwith\b").unwrap();
}

/// Detect a module/section nesting change in `stmt`. A `Module N := ...`
/// definition (no accompanying `with`) is a module *alias*, not an opening,
/// so it must not push the stack.
pub fn detect_module_section_op(stmt: &str) -> Option<ModuleSectionOp> {
    if let Some(caps) = RE_SECTION.captures(stmt) {
        return Some(ModuleSectionOp::OpenSection(caps[1].to_string()));
    }
    if let Some(caps) = RE_END.captures(stmt) {
        return Some(ModuleSectionOp::End(caps[1].to_string()));
    }
    if let Some(caps) = RE_MODULE.captures(stmt) {
        let rest = &caps[3];
        if rest.contains(":=") && !RE_WITH.is_match(rest) {
            return None;
        }
        return Some(ModuleSectionOp::OpenModule(caps[2].to_string()));
    }
    None
}

lazy_static! {
    static ref RE_NAMED_DEF: Regex = Regex::new(
        r"(?s)^\s*(?:Program\s+|Polymorphic\s+)*(?:Lemma|Theorem|Definition|Fixpoint|Instance|Corollary|Remark|Proposition|Example|Let|Function|Property|Fact|Equations?)\s+([A-Za-z_][A-Za-z0-9_']*)\s*(.*?)\s*:\s*(.+?)\s*\.\s*$"
    )
    .unwrap();
    static ref RE_GOAL: Regex = Regex::new(r"(?s)^\s*Goal\s+(.+?)\s*\.\s*$").unwrap();
    static ref RE_DERIVE: Regex = Regex::new(
        r"(?s)^\s*Derive\s+[A-Za-z_][A-Za-z0-9_']*\s+SuchThat\s+(.+?)\s+As\s+([A-Za-z_][A-Za-z0-9_']*)\s*\.\s*$"
    )
    .unwrap();
    static ref RE_MORPHISM: Regex = Regex::new(
        r"(?s)^\s*Add\s+(?:Parametric\s+)?Morphism\s+.*?\s+with\s+signature\s+(.+?)\s+as\s+([A-Za-z_][A-Za-z0-9_']*)\s*\.\s*$"
    )
    .unwrap();
    static ref RE_INDUCTIVE: Regex =
        Regex::new(r"(?s)^\s*Inductive\s+([A-Za-z_][A-Za-z0-9_']*)\b.*?:=\s*(.+?)\s*\.\s*$").unwrap();
    static ref RE_CONSTRUCTOR: Regex =
        Regex::new(r"\|?\s*([A-Za-z_][A-Za-z0-9_']*)\s*:\s*([^|]+?)\s*(?:$|(?=\|))").unwrap();
    static ref RE_OBLIGATION: Regex = Regex::new(r"^\s*(Next\s+Obligation|Obligation\s+\d+)\b").unwrap();
}

/// Extract the fully qualified lemma statement(s) a proof-starting command
/// introduces. `module_prefix` is joined with `.` to
/// qualify the name(s); an empty prefix yields an unqualified name.
pub fn extract_lemma_statements(stmt: &str, module_prefix: &str) -> Vec<LemmaEntry> {
    let qualify = |name: &str| -> String {
        if module_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", module_prefix, name)
        }
    };

    if RE_OBLIGATION.is_match(stmt) {
        return vec![LemmaEntry { name: String::new(), statement: ":".to_string(), is_section: false }];
    }

    if let Some(caps) = RE_DERIVE.captures(stmt) {
        let body = caps[1].trim();
        let name = &caps[2];
        let qname = qualify(name);
        return vec![LemmaEntry { name: qname.clone(), statement: format!("{} : {}", qname, body), is_section: false }];
    }

    if let Some(caps) = RE_MORPHISM.captures(stmt) {
        let sig = caps[1].trim();
        let name = &caps[2];
        return vec![LemmaEntry {
            name: qualify(name),
            statement: format!("{} : {}", qualify(name), sig),
            is_section: false,
        }];
    }

    if let Some(caps) = RE_INDUCTIVE.captures(stmt) {
        let type_name = &caps[1];
        let body = &caps[2];
        let mut out = Vec::new();
        for ctor in RE_CONSTRUCTOR.captures_iter(body) {
            let cname = ctor[1].trim();
            let cty = ctor[2].trim();
            if cname.is_empty() || cty.is_empty() {
                continue;
            }
            let qname = qualify(cname);
            out.push(LemmaEntry { name: qname.clone(), statement: format!("{} : {}", qname, cty), is_section: false });
        }
        if !out.is_empty() {
            return out;
        }
        let _ = type_name;
    }

    if let Some(caps) = RE_GOAL.captures(stmt) {
        let body = caps[1].trim();
        return vec![LemmaEntry { name: String::new(), statement: format!(": {}", body), is_section: false }];
    }

    if let Some(caps) = RE_NAMED_DEF.captures(stmt) {
        let name = &caps[1];
        let binders = caps[2].trim();
        let body = caps[3].trim();
        let qname = qualify(name);
        let stmt_text = if binders.is_empty() {
            format!("{} : {}", qname, body)
        } else {
            format!("{} : forall {}, {}", qname, binders, body)
        };
        return vec![LemmaEntry { name: qname, statement: stmt_text, is_section: false }];
    }

    Vec::new()
}

lazy_static! {
    static ref RE_GOAL_SELECTOR: Regex = Regex::new(r"(?s)^\s*(\d+|all)\s*:\s*(.*)$").unwrap();
}

/// Split a tactic sentence into individual `m: tactic.`-style statements:
/// top-level `;`, `[ t1 | t2 | ... ]` bracket-branch groups (one output
/// statement per branch, numbered from 1), and `n:`/`all:` goal selectors
/// (`all:` expanded against `goal_count`, the number of currently focused
/// goals). Depth-tracks parens/brackets and is quote-aware; a
/// `match goal with ... end` block is never split mid construct, since its
/// `|` and `=>` tokens would otherwise be mistaken for branch separators.
///
/// On any sign of unbalanced structure (parens that never close, a `match`
/// whose `end` is missing) the original text is returned unchanged as a
/// single statement: the linearizer rolls back to a no-op rather than
/// emitting a guess.
pub fn linearize(stmt: &str, goal_count: usize) -> Vec<String> {
    if !is_balanced(stmt) {
        return vec![stmt.to_string()];
    }
    if contains_unterminated_match(stmt) {
        return vec![stmt.to_string()];
    }

    let segments = split_top_level(stmt, b';');
    if segments.len() <= 1 {
        return linearize_segment(stmt.trim(), goal_count);
    }
    segments.iter().flat_map(|s| linearize_segment(s.trim(), goal_count)).collect()
}

/// Expand a single (already semicolon-split) segment: a bracket-branch
/// group, a goal selector, or a plain tactic.
fn linearize_segment(seg: &str, goal_count: usize) -> Vec<String> {
    if seg.is_empty() {
        return Vec::new();
    }
    if is_single_bracket_group(seg) {
        let inner = &seg[1..seg.len() - 1];
        return split_top_level(inner, b'|')
            .iter()
            .enumerate()
            .map(|(i, branch)| format!("{}: {}.", i + 1, finish_tactic(branch)))
            .collect();
    }
    if let Some(caps) = RE_GOAL_SELECTOR.captures(seg) {
        let rest = finish_tactic(&caps[2]);
        if &caps[1] == "all" {
            return (1..=goal_count.max(1)).map(|n| format!("{}: {}.", n, rest)).collect();
        }
        return vec![format!("{}: {}.", &caps[1], rest)];
    }
    vec![format!("{}.", finish_tactic(seg))]
}

fn finish_tactic(s: &str) -> String {
    s.trim().trim_end_matches('.').trim().to_string()
}

/// Is `s` a single `[ ... ]` group spanning its entire length, rather than
/// e.g. `[a] ++ [b]` or a trailing `]` that closes before the string ends?
fn is_single_bracket_group(s: &str) -> bool {
    if !(s.starts_with('[') && s.ends_with(']')) {
        return false;
    }
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut escape = false;
    for (i, &b) in bytes.iter().enumerate() {
        if escape {
            escape = false;
            continue;
        }
        match b {
            b'\\' if in_quote => escape = true,
            b'"' => in_quote = !in_quote,
            b'(' | b'[' if !in_quote => depth += 1,
            b')' | b']' if !in_quote => {
                depth -= 1;
                if depth == 0 && i != bytes.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn is_balanced(stmt: &str) -> bool {
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut escape = false;
    for b in stmt.bytes() {
        if escape {
            escape = false;
            continue;
        }
        match b {
            b'\\' if in_quote => escape = true,
            b'"' => in_quote = !in_quote,
            b'(' | b'[' if !in_quote => depth += 1,
            b')' | b']' if !in_quote => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0 && !in_quote
}

fn contains_unterminated_match(stmt: &str) -> bool {
    let opens = stmt.matches("match ").count();
    let ends = stmt.matches(" end").count() + usize::from(stmt.ends_with("end"));
    opens > ends
}

/// Split on a top-level separator byte only: not inside parens/brackets, a
/// string literal, or a `match goal with ... end` block (whose own `|`
/// tokens would otherwise be mistaken for bracket-branch separators).
fn split_top_level(stmt: &str, sep: u8) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut escape = false;
    let mut in_match = false;
    let mut start = 0usize;
    let bytes = stmt.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        if escape {
            escape = false;
            i += 1;
            continue;
        }
        match b {
            b'\\' if in_quote => escape = true,
            b'"' => in_quote = !in_quote,
            b'(' | b'[' if !in_quote => depth += 1,
            b')' | b']' if !in_quote => depth -= 1,
            _ => {}
        }
        if !in_quote && depth == 0 {
            if stmt[i..].starts_with("match ") {
                in_match = true;
            } else if in_match && stmt[i..].starts_with("end") {
                in_match = false;
            } else if b == sep && !in_match {
                out.push(stmt[start..i].to_string());
                start = i + 1;
            }
        }
        i += 1;
    }
    out.push(stmt[start..].to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_comments_strips_nested_comments() {
        assert_eq!(kill_comments("foo (* bar (* baz *) qux *) end."), "foo  end.");
    }

    #[test]
    fn kill_comments_is_quote_aware() {
        assert_eq!(kill_comments(r#"x "(* not a comment *)" y"#), r#"x "(* not a comment *)" y"#);
    }

    #[test]
    fn kill_comments_is_idempotent() {
        let once = kill_comments("a (* c *) b");
        let twice = kill_comments(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn escape_for_wire_orders_backslash_before_quote() {
        assert_eq!(escape_for_wire(r#"a\b"c"#), r#"a\\b\"c"#);
    }

    #[test]
    fn rewrites_require_import_coq_prefix() {
        let split = split_substatements("Require Import Coq.Lists.List.");
        assert_eq!(split, vec!["Require Import Lists.List.".to_string()]);
    }

    #[test]
    fn leaves_other_requires_untouched() {
        let split = split_substatements("Require Import MyLib.Foo.");
        assert_eq!(split, vec!["Require Import MyLib.Foo.".to_string()]);
    }

    #[test]
    fn recognizes_proof_starters_and_enders() {
        assert!(is_proof_starter("Lemma foo : True."));
        assert!(is_proof_starter("Derive f SuchThat (f = 0) As eq_zero."));
        assert!(is_proof_ender("Qed."));
        assert!(is_proof_ender("Proof I."));
        assert!(!is_proof_ender("Proof."));
        assert!(!is_proof_ender("Proof using x."));
    }

    #[test]
    fn classifies_braces_and_selectors_as_goal_transitions() {
        assert_eq!(classify_statement("{"), StatementKind::GoalOpen);
        assert_eq!(classify_statement("}"), StatementKind::GoalClose);
        assert_eq!(classify_statement("2: reflexivity."), StatementKind::GoalOpen);
        assert_eq!(classify_statement("Qed."), StatementKind::EndingProof);
        assert_eq!(classify_statement("Lemma l : True."), StatementKind::ProofStarter);
    }

    #[test]
    fn detects_module_and_section_open_close() {
        assert_eq!(detect_module_section_op("Module M."), Some(ModuleSectionOp::OpenModule("M".into())));
        assert_eq!(detect_module_section_op("Section S."), Some(ModuleSectionOp::OpenSection("S".into())));
        assert_eq!(detect_module_section_op("End M."), Some(ModuleSectionOp::End("M".into())));
    }

    #[test]
    fn module_alias_with_assignment_does_not_open_a_scope() {
        assert_eq!(detect_module_section_op("Module M := N."), None);
    }

    #[test]
    fn extracts_simple_lemma_statement() {
        let entries = extract_lemma_statements("Lemma l : True.", "");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].statement, "l : True");
    }

    #[test]
    fn extracts_lemma_statement_with_binders_and_prefix() {
        let entries = extract_lemma_statements("Lemma l (x : nat) : x = x.", "M");
        assert_eq!(entries[0].statement, "M.l : forall (x : nat), x = x");
    }

    #[test]
    fn extracts_anonymous_goal() {
        let entries = extract_lemma_statements("Goal 1 = 1.", "");
        assert_eq!(entries[0].statement, ": 1 = 1");
        assert_eq!(entries[0].name, "");
    }

    #[test]
    fn extracts_derive_suchthat_as_name() {
        let entries = extract_lemma_statements("Derive f SuchThat (f = 0) As eq_zero.", "");
        assert_eq!(entries[0].name, "eq_zero");
        assert_eq!(entries[0].statement, "eq_zero : (f = 0)");
    }

    #[test]
    fn extracts_morphism_as_name_with_signature() {
        let entries = extract_lemma_statements(
            "Add Parametric Morphism : plus with signature eq ==> eq ==> eq as plus_mor.",
            "",
        );
        assert_eq!(entries[0].name, "plus_mor");
        assert_eq!(entries[0].statement, "plus_mor : eq ==> eq ==> eq");
    }

    #[test]
    fn extracts_one_entry_per_inductive_constructor() {
        let entries =
            extract_lemma_statements("Inductive ev : nat -> Prop := | ev0 : ev 0 | evS : ev 0 -> ev 0.", "");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].statement, "ev0 : ev 0");
        assert_eq!(entries[1].statement, "evS : ev 0 -> ev 0");
    }

    #[test]
    fn linearizes_top_level_semicolons() {
        let parts = linearize("intros; split; reflexivity", 1);
        assert_eq!(parts, vec!["intros.", "split.", "reflexivity."]);
    }

    #[test]
    fn linearizer_leaves_match_blocks_intact() {
        let stmt = "match goal with | H : True |- _ => exact H end; idtac";
        let parts = linearize(stmt, 1);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("match goal with"));
    }

    #[test]
    fn linearizer_rolls_back_on_unbalanced_input() {
        let stmt = "intros; (split; reflexivity";
        assert_eq!(linearize(stmt, 1), vec![stmt.to_string()]);
    }

    #[test]
    fn linearizer_is_a_no_op_without_semicolons() {
        assert_eq!(linearize("reflexivity.", 1), vec!["reflexivity.".to_string()]);
    }

    #[test]
    fn linearizer_splits_bracket_branches_per_subgoal() {
        let parts = linearize("split; [ reflexivity | assumption ]", 2);
        assert_eq!(parts, vec!["split.", "1: reflexivity.", "2: assumption."]);
    }

    #[test]
    fn linearizer_passes_through_a_bare_numeric_selector() {
        assert_eq!(linearize("2: reflexivity.", 3), vec!["2: reflexivity."]);
    }

    #[test]
    fn linearizer_expands_all_selector_to_every_focused_goal() {
        assert_eq!(linearize("all: auto.", 3), vec!["1: auto.", "2: auto.", "3: auto."]);
    }

    #[test]
    fn linearizer_all_selector_without_goals_still_emits_one_statement() {
        assert_eq!(linearize("all: auto.", 0), vec!["1: auto."]);
    }
}
