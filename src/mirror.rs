//! The proof-state mirror: the driver's private copy of whatever the prover
//! currently believes about the session.
//!
//! Every field here must stay consistent with the live prover across
//! successful commands, failures, cancellations, interrupts, and full
//! resets (`driver::Driver` is the only thing allowed to mutate a
//! `Mirror`, and only from the main thread — see the crate-level docs).
//!
//! The tactic history in particular is a tree (nested subgoal frames,
//! tactic entries as leaves) but is represented as a flat arena of frames
//! indexed by integer rather than a parent-pointer graph of boxed nodes:
//! cheap to mutate in place, no `Rc<RefCell<_>>`, and a "current position"
//! is just a `Vec<usize>` path into the arena.

use tinyvec::TinyVec;

/// Opaque state id issued by the prover when a statement is `Added`.
/// Monotonic within one process instance; not preserved across a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub i64);

impl StateId {
    pub const INITIAL: StateId = StateId(1);
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A term, carried in both its raw wire serialization and its
/// pretty-printed form. Downstream consumers compare the pretty string;
/// queries pass the raw S-expression back to the prover, so both must be
/// kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ast {
    pub raw: String,
    pub pretty: String,
}

impl Ast {
    pub fn new(raw: impl Into<String>, pretty: impl Into<String>) -> Self {
        Ast { raw: raw.into(), pretty: pretty.into() }
    }
}

/// One or more identifiers sharing a single type, with an optional shared
/// body (a `:=`-bound local definition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hypothesis {
    pub names: TinyVec<[String; 2]>,
    pub body: Option<Ast>,
    pub ty: Ast,
}

impl Hypothesis {
    pub fn new(names: impl IntoIterator<Item = String>, body: Option<Ast>, ty: Ast) -> Self {
        let names: TinyVec<[String; 2]> = names.into_iter().collect();
        assert!(!names.is_empty(), "a hypothesis must name at least one identifier");
        Hypothesis { names, body, ty }
    }
}

/// A `(hypotheses, goal)` pair: the prover's unit of proof.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Obligation {
    pub hypotheses: Vec<Hypothesis>,
    pub goal: Option<Ast>,
}

/// The full set of obligations the prover is tracking for the current
/// proof. `fg[0]`, when present, is the focused goal. The driver never
/// auto-focuses: an empty `fg` with a non-empty `bg` means the user must
/// close a brace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProofContext {
    pub fg: Vec<Obligation>,
    pub bg: Vec<Obligation>,
    pub shelved: Vec<Obligation>,
    pub given_up: Vec<Obligation>,
}

impl ProofContext {
    pub fn is_focused(&self) -> bool {
        !self.fg.is_empty()
    }

    /// Apply the goal-open narrowing rule: the old focused goal stays as the
    /// sole new `fg`, and everything else that was foreground moves to
    /// background (appended after whatever was already there).
    pub fn narrow_to_focus(&mut self) {
        let mut old_fg = std::mem::take(&mut self.fg);
        if old_fg.is_empty() {
            return;
        }
        let focused = old_fg.remove(0);
        self.bg.append(&mut old_fg);
        self.fg = vec![focused];
    }
}

/// One entry in a tactic-history frame: either a tactic that was run, or a
/// reference to a nested subgoal frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HistoryNode {
    Tactic { text: String, state_id: StateId },
    Subgoal(usize),
}

#[derive(Debug, Clone, Default)]
struct Frame {
    children: Vec<HistoryNode>,
}

/// The tactic-history tree, as an arena of frames plus a path denoting the
/// currently focused frame.
#[derive(Debug, Clone)]
pub struct TacticHistory {
    frames: Vec<Frame>,
    /// Path from the root to the focused frame; always starts with `0`
    /// (the root) and is never empty.
    path: Vec<usize>,
    /// Background obligations captured at each `open_subgoal`, restored by
    /// the matching `close_subgoal`.
    bg_shadow: Vec<Vec<Obligation>>,
}

impl TacticHistory {
    pub fn new() -> Self {
        TacticHistory { frames: vec![Frame::default()], path: vec![0], bg_shadow: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.path.len() - 1
    }

    fn current_frame(&self) -> usize {
        *self.path.last().expect("path is never empty")
    }

    /// `true` iff nothing has been recorded: we are at the root frame and it
    /// has no children. `TacticHistory::remove_last` is only well defined
    /// when this is `false`.
    pub fn is_empty(&self) -> bool {
        self.depth() == 0 && self.frames[0].children.is_empty()
    }

    pub fn add_tactic(&mut self, text: impl Into<String>, state_id: StateId) {
        let cur = self.current_frame();
        self.frames[cur].children.push(HistoryNode::Tactic { text: text.into(), state_id });
    }

    /// Focus a new subgoal: push a fresh frame, record it as a child of the
    /// current frame, and shadow the current background obligations so
    /// `close_subgoal` can restore them.
    pub fn open_subgoal(&mut self, bg_before: Vec<Obligation>) {
        let new_idx = self.frames.len();
        self.frames.push(Frame::default());
        let cur = self.current_frame();
        self.frames[cur].children.push(HistoryNode::Subgoal(new_idx));
        self.path.push(new_idx);
        self.bg_shadow.push(bg_before);
    }

    /// Leave the current subgoal frame, restoring the background obligations
    /// captured when it was opened.
    pub fn close_subgoal(&mut self) -> Option<Vec<Obligation>> {
        if self.depth() == 0 {
            return None;
        }
        self.path.pop();
        self.bg_shadow.pop()
    }

    /// Inverse of the last mutation made to the history (a tactic add, a
    /// subgoal open, or a subgoal close). Used by `cancel_last` to roll
    /// back a statement whose effect on the tree must be undone.
    ///
    /// Rules, in order:
    /// - if the focused frame's last child is a tactic entry, pop it;
    /// - else if the focused frame is empty, pop the frame itself
    ///   (un-focusing one level, restoring the shadowed background);
    /// - else (the last child is a nested frame) re-enter it, pushing
    ///   `all_subgoals` as the background to restore when it is later
    ///   closed again.
    pub fn remove_last(&mut self, all_subgoals: Vec<Obligation>) {
        assert!(!self.is_empty(), "remove_last is undefined on an empty history");
        let cur = self.current_frame();
        match self.frames[cur].children.last() {
            Some(HistoryNode::Tactic { .. }) => {
                self.frames[cur].children.pop();
            }
            None => {
                self.path.pop();
                self.bg_shadow.pop();
            }
            Some(HistoryNode::Subgoal(idx)) => {
                let idx = *idx;
                self.path.push(idx);
                self.bg_shadow.push(all_subgoals);
            }
        }
    }

    /// The state id of the most recently recorded tactic in the focused
    /// frame, if any.
    pub fn last_tactic_state(&self) -> Option<StateId> {
        let cur = self.current_frame();
        match self.frames[cur].children.last() {
            Some(HistoryNode::Tactic { state_id, .. }) => Some(*state_id),
            _ => None,
        }
    }
}

impl Default for TacticHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// One `(name, is_section)` entry in the module/section nesting stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSectionEntry {
    pub name: String,
    pub is_section: bool,
}

/// Tracks open `Module`/`Section` nesting. `module_prefix` joins only the
/// non-section names (sections have no namespacing effect on qualified
/// names in Coq); `sm_prefix` joins everything.
#[derive(Debug, Clone, Default)]
pub struct ModuleSectionStack {
    stack: Vec<ModuleSectionEntry>,
}

impl ModuleSectionStack {
    pub fn new() -> Self {
        ModuleSectionStack { stack: Vec::new() }
    }

    pub fn push_module(&mut self, name: impl Into<String>) {
        self.stack.push(ModuleSectionEntry { name: name.into(), is_section: false });
    }

    pub fn push_section(&mut self, name: impl Into<String>) {
        self.stack.push(ModuleSectionEntry { name: name.into(), is_section: true });
    }

    /// Pop the top entry, requiring its name match `name`. By construction,
    /// this is the only way the stack shrinks; mismatches are the caller's
    /// bug (a malformed `End`) and are reported rather than silently
    /// ignored.
    pub fn pop(&mut self, name: &str) -> Result<ModuleSectionEntry, String> {
        match self.stack.last() {
            Some(top) if top.name == name => Ok(self.stack.pop().unwrap()),
            Some(top) => Err(format!("`End {}` does not match open `{}`", name, top.name)),
            None => Err(format!("`End {}` with nothing open", name)),
        }
    }

    pub fn module_prefix(&self) -> String {
        self.stack
            .iter()
            .filter(|e| !e.is_section)
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn sm_prefix(&self) -> String {
        self.stack.iter().map(|e| e.name.as_str()).collect::<Vec<_>>().join(".")
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// One lemma statement known to be provable at the module prefix it was
/// recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LemmaEntry {
    /// The qualified name, e.g. `M.l`, or empty for an anonymous `Goal`.
    pub name: String,
    /// The full `name : type` (or `: type` for anonymous) statement text.
    pub statement: String,
    pub is_section: bool,
}

/// Ordered registry of lemma statements introduced in the current session,
/// scoped by module/section nesting.
#[derive(Debug, Clone, Default)]
pub struct LocalLemmaRegistry {
    entries: Vec<LemmaEntry>,
}

impl LocalLemmaRegistry {
    pub fn new() -> Self {
        LocalLemmaRegistry { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: LemmaEntry) {
        self.entries.push(entry);
    }

    /// `Abort`: drop the most recently opened lemma.
    pub fn pop_last(&mut self) -> Option<LemmaEntry> {
        self.entries.pop()
    }

    /// `Reset name.`: remove every entry whose bare or qualified name
    /// equals `name`.
    pub fn remove_by_name(&mut self, name: &str) {
        self.entries.retain(|e| {
            let bare = e.name.rsplit('.').next().unwrap_or(&e.name);
            e.name != name && bare != name
        });
    }

    /// `End S.` on a section: drop every section-scoped entry.
    pub fn remove_section_scoped(&mut self) {
        self.entries.retain(|e| !e.is_section);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LemmaEntry> {
        self.entries.iter()
    }

    pub fn contains_statement(&self, statement: &str) -> bool {
        self.entries.iter().any(|e| e.statement == statement)
    }
}

/// One entry in the command-log audit trail, used only for reset+replay.
#[derive(Debug, Clone)]
pub struct CommandLogEntry {
    pub text: String,
    pub accepted: bool,
    pub state_id: Option<StateId>,
}

/// Audit log of every sentence the driver has sent, in order. Used only by
/// the recovery controller to replay the accepted prefix after a reset.
#[derive(Debug, Clone, Default)]
pub struct CommandHistory {
    entries: Vec<CommandLogEntry>,
}

impl CommandHistory {
    pub fn new() -> Self {
        CommandHistory { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: CommandLogEntry) {
        self.entries.push(entry);
    }

    /// Drop the last entry if its `state_id` equals `state_id`: used after a
    /// cancel to trim the entry that the cancel just rolled back.
    pub fn trim_if_matches(&mut self, state_id: StateId) {
        if let Some(last) = self.entries.last() {
            if last.state_id == Some(state_id) {
                self.entries.pop();
            }
        }
    }

    pub fn last(&self) -> Option<&CommandLogEntry> {
        self.entries.last()
    }

    /// Mark the tail entry accepted at `state_id`, once its transaction has
    /// fully succeeded.
    pub fn mark_last_accepted(&mut self, state_id: StateId) {
        if let Some(last) = self.entries.last_mut() {
            last.accepted = true;
            last.state_id = Some(state_id);
        }
    }

    /// Every accepted entry, in order, for replay.
    pub fn accepted(&self) -> impl Iterator<Item = &CommandLogEntry> {
        self.entries.iter().filter(|e| e.accepted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The complete proof-state mirror owned by a `Driver`.
#[derive(Debug, Clone, Default)]
pub struct Mirror {
    pub cur_state: Option<StateId>,
    pub proof_context: Option<ProofContext>,
    pub tactic_history: Option<TacticHistory>,
    pub module_stack: ModuleSectionStack,
    pub lemma_registry: LocalLemmaRegistry,
    pub command_history: CommandHistory,
}

impl Mirror {
    pub fn new() -> Self {
        Mirror::default()
    }

    /// Invariant: `proof_context` is `None` iff `tactic_history` is
    /// `None`.
    pub fn invariants_hold(&self) -> bool {
        self.proof_context.is_some() == self.tactic_history.is_some()
    }

    pub fn enter_proof(&mut self) {
        self.proof_context = Some(ProofContext::default());
        self.tactic_history = Some(TacticHistory::new());
    }

    pub fn leave_proof(&mut self) {
        self.proof_context = None;
        self.tactic_history = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obligation() -> Obligation {
        Obligation { hypotheses: vec![], goal: Some(Ast::new("(True)", "True")) }
    }

    #[test]
    fn module_prefix_distributes_over_open_close() {
        let mut stack = ModuleSectionStack::new();
        stack.push_module("M");
        assert_eq!(stack.module_prefix(), "M");
        stack.pop("M").unwrap();
        assert_eq!(stack.module_prefix(), "");
    }

    #[test]
    fn sections_do_not_affect_module_prefix() {
        let mut stack = ModuleSectionStack::new();
        stack.push_module("M");
        stack.push_section("S");
        assert_eq!(stack.module_prefix(), "M");
        assert_eq!(stack.sm_prefix(), "M.S");
    }

    #[test]
    fn pop_requires_matching_name() {
        let mut stack = ModuleSectionStack::new();
        stack.push_module("M");
        assert!(stack.pop("N").is_err());
        assert!(stack.pop("M").is_ok());
    }

    #[test]
    fn lemma_registry_reset_removes_by_name() {
        let mut reg = LocalLemmaRegistry::new();
        reg.push(LemmaEntry { name: "M.l".into(), statement: "M.l : True".into(), is_section: false });
        reg.remove_by_name("l");
        assert!(reg.is_empty());
    }

    #[test]
    fn lemma_registry_section_pop_keeps_non_section_residual() {
        // Scenario 6: Section S. Let x := 0. Lemma l : x = 0. ... End S.
        let mut reg = LocalLemmaRegistry::new();
        reg.push(LemmaEntry { name: "x".into(), statement: "x : nat".into(), is_section: true });
        reg.push(LemmaEntry { name: "l".into(), statement: "l : x = 0".into(), is_section: true });
        reg.remove_section_scoped();
        assert!(reg.is_empty());
    }

    #[test]
    fn tactic_history_open_close_round_trips_background() {
        let mut h = TacticHistory::new();
        assert!(h.is_empty());
        h.add_tactic("split.", StateId(2));
        assert!(!h.is_empty());
        h.open_subgoal(vec![obligation()]);
        assert_eq!(h.depth(), 1);
        h.add_tactic("exact I.", StateId(3));
        let restored = h.close_subgoal().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(h.depth(), 0);
    }

    #[test]
    fn remove_last_pops_trailing_tactic() {
        let mut h = TacticHistory::new();
        h.add_tactic("intros.", StateId(2));
        h.remove_last(vec![]);
        assert!(h.is_empty());
    }

    #[test]
    fn remove_last_unfocuses_empty_frame() {
        let mut h = TacticHistory::new();
        h.add_tactic("split.", StateId(2));
        h.open_subgoal(vec![obligation()]);
        // frame is empty (no tactics run in it yet)
        h.remove_last(vec![]);
        assert_eq!(h.depth(), 0);
    }

    #[test]
    fn remove_last_reenters_last_subgoal_frame() {
        let mut h = TacticHistory::new();
        h.add_tactic("split.", StateId(2));
        h.open_subgoal(vec![obligation()]);
        h.add_tactic("exact I.", StateId(3));
        h.close_subgoal();
        // last child of root is now the Subgoal frame; remove_last re-enters it
        h.remove_last(vec![obligation(), obligation()]);
        assert_eq!(h.depth(), 1);
    }

    #[test]
    fn narrow_to_focus_moves_remaining_goals_to_background() {
        let mut ctx = ProofContext { fg: vec![obligation(), obligation()], ..Default::default() };
        ctx.narrow_to_focus();
        assert_eq!(ctx.fg.len(), 1);
        assert_eq!(ctx.bg.len(), 1);
    }
}
