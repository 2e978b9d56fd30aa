//! The session driver: the crate's top-level handle, owning the mirror, the
//! transport, and the two-step `Add`/`Exec` transaction that is `run_stmt`.
//!
//! One struct per live session: `Drop` tears the child down, and every
//! public operation is a method on it. Because a session is backed by a
//! live subprocess rather than a file on disk, construction can fail in more
//! interesting ways, and failures mid-transaction route through
//! [`crate::recovery`] instead of simply propagating.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use crate::classifier::{self, ClassifiedMessage};
use crate::config::DriverOptions;
use crate::error::DriverError;
use crate::mirror::{Ast, CommandLogEntry, Hypothesis, Mirror, Obligation, ProofContext, StateId};
use crate::preprocess::{self, StatementKind};
use crate::query::{self, EnvEntry, PrintCache, PrintKind};
use crate::sexp::Sexp;
use crate::transport::{PipeTransport, Transport};

/// What one `run_stmt` sub-statement produced.
#[derive(Debug, Clone)]
pub struct RunStmtOutcome {
    pub state_id: StateId,
    pub feedback: Vec<Sexp>,
}

type TransportFactory = Box<dyn FnMut() -> Result<Box<dyn Transport>, DriverError>>;

/// A live session against one `sertop` subprocess.
pub struct Driver {
    pub(crate) options: DriverOptions,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) mirror: Mirror,
    print_cache: PrintCache,
    reset_count: u64,
    respawn: Option<TransportFactory>,
}

impl Driver {
    /// Spawn `sertop`, run the init sequence (prelude vernaculars, wrapper
    /// module, optional hammer preload), and return a ready session.
    pub fn new(options: DriverOptions) -> Result<Self, DriverError> {
        options.validate()?;
        let argv = options.coq_command.clone();
        let cwd = options.project_path.clone();
        let transport = PipeTransport::spawn(&argv, &cwd)?;
        let respawn_argv = argv;
        let respawn_cwd = cwd;
        let factory: TransportFactory =
            Box::new(move || PipeTransport::spawn(&respawn_argv, &respawn_cwd).map(|t| Box::new(t) as Box<dyn Transport>));
        let mut driver = Driver {
            options,
            transport: Box::new(transport),
            mirror: Mirror::new(),
            print_cache: PrintCache::new(),
            reset_count: 0,
            respawn: Some(factory),
        };
        driver.run_init_sequence()?;
        Ok(driver)
    }

    /// Construct against an already-built transport, bypassing subprocess
    /// spawn and the init sequence. For tests.
    pub fn for_test(options: DriverOptions, transport: Box<dyn Transport>) -> Self {
        Driver { options, transport, mirror: Mirror::new(), print_cache: PrintCache::new(), reset_count: 0, respawn: None }
    }

    /// Like [`Driver::for_test`], but with a respawn factory so
    /// [`crate::recovery::reset_and_replay`] can be exercised without a real
    /// subprocess.
    pub fn for_test_with_factory(
        options: DriverOptions,
        transport: Box<dyn Transport>,
        factory: impl FnMut() -> Result<Box<dyn Transport>, DriverError> + 'static,
    ) -> Self {
        Driver {
            options,
            transport,
            mirror: Mirror::new(),
            print_cache: PrintCache::new(),
            reset_count: 0,
            respawn: Some(Box::new(factory)),
        }
    }

    fn run_init_sequence(&mut self) -> Result<(), DriverError> {
        if let Some(name) = self.options.wrapper_module_name() {
            self.run_stmt_internal(&format!("Module {}.", name))?;
        }
        let module_path = self.options.resolved_module_path();
        for sentence in crate::coqproject::discover_vernaculars(&module_path, &self.options.project_path)? {
            self.run_stmt_internal(&sentence)?;
        }
        if self.options.use_hammer {
            let limits = self.options.hammer_time_limits();
            self.run_stmt_internal("From Hammer Require Import Hammer.")?;
            self.run_stmt_internal(&format!("Set Hammer ATPLimit {}.", limits.atp.as_secs().max(1)))?;
            self.run_stmt_internal(&format!("Set Hammer ReconstrLimit {}.", limits.reconstr.as_secs().max(1)))?;
            self.run_stmt_internal(&format!("Set Hammer CrushLimit {}.", limits.crush.as_secs().max(1)))?;
        }
        Ok(())
    }

    pub fn reset_count(&self) -> u64 {
        self.reset_count
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub(crate) fn bump_reset_count(&mut self) {
        self.reset_count += 1;
    }

    pub(crate) fn options_reset_on_cancel_fail(&self) -> bool {
        self.options.reset_on_cancel_fail
    }

    pub(crate) fn reinitialize_transport(&mut self) -> Result<(), DriverError> {
        let factory = self
            .respawn
            .as_mut()
            .ok_or_else(|| DriverError::InvalidConfig { message: "no transport factory configured for reset".into() })?;
        self.transport = factory()?;
        Ok(())
    }

    pub(crate) fn send_line(&mut self, line: &str) -> Result<(), DriverError> {
        if let Some(path) = &self.options.log_outgoing_messages {
            if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(f, "{}", line);
            }
        }
        self.transport.send_line(line)
    }

    pub(crate) fn drain_residual_messages(&mut self) {
        while let Ok(Some(_)) = self.transport.recv_line(Duration::from_millis(0)) {}
    }

    /// Block for a classified message, escalating through the two-interrupt
    /// timeout-escalation protocol below. If an interrupt races a real
    /// completion, the well-formed answer wins; a `CoqExn` observed in that
    /// race is treated as noise (the timeout stands) rather than as the
    /// answer.
    pub(crate) fn recv_classified(&mut self, statement: &str) -> Result<ClassifiedMessage, DriverError> {
        let timeout = self.options.timeout;
        if let Some(line) = self.transport.recv_line(timeout)? {
            return classifier::classify(&line);
        }
        for _ in 0..2 {
            self.transport.interrupt()?;
            if let Some(line) = self.transport.recv_line(timeout)? {
                let msg = classifier::classify(&line)?;
                return match msg {
                    ClassifiedMessage::CoqExn { .. } | ClassifiedMessage::Break => {
                        self.drain_interrupt_noise();
                        Err(DriverError::Timeout { statement: statement.to_string() })
                    }
                    well_formed => {
                        self.drain_interrupt_noise();
                        Ok(well_formed)
                    }
                };
            }
        }
        Err(DriverError::Timeout { statement: statement.to_string() })
    }

    fn drain_interrupt_noise(&mut self) {
        for _ in 0..4 {
            match self.transport.recv_line(Duration::from_millis(0)) {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    }

    pub(crate) fn drain_completed(&mut self, statement: &str) -> Result<(), DriverError> {
        loop {
            match self.recv_classified(statement)? {
                ClassifiedMessage::Completed => return Ok(()),
                ClassifiedMessage::Feedback { .. } | ClassifiedMessage::Ack => continue,
                ClassifiedMessage::CoqExn { kind, messages, .. } => {
                    return Err(crate::recovery::exn_to_error(kind, statement.to_string(), messages));
                }
                other => return Err(DriverError::BadResponse { raw: format!("{:?}", other) }),
            }
        }
    }

    fn goals_query_form(&self) -> &'static str {
        if self.options.kernel_level_terms {
            "(Goals)"
        } else {
            "(EGoals)"
        }
    }

    pub(crate) fn refresh_proof_context_into_mirror(&mut self) -> Result<(), DriverError> {
        if self.mirror.tactic_history.is_none() {
            return Ok(());
        }
        let form = self.goals_query_form();
        let objs = query::run_query(self.transport.as_mut(), self.options.timeout, form)?;
        self.mirror.proof_context = Some(parse_proof_context(&objs));
        Ok(())
    }

    /// Run one already-atomic sentence (no further splitting/linearizing)
    /// through the full `Add`/`Exec`/reconcile transaction.
    pub(crate) fn run_stmt_internal(&mut self, stmt: &str) -> Result<RunStmtOutcome, DriverError> {
        let module_op = preprocess::detect_module_section_op(stmt);
        let kind = preprocess::classify_statement(stmt);
        let module_prefix_before = self.mirror.module_stack.module_prefix();

        self.mirror.command_history.push(CommandLogEntry { text: stmt.to_string(), accepted: false, state_id: None });

        let escaped = preprocess::escape_for_wire(stmt);
        self.send_line(&format!("(Add () \"{}\")", escaped))?;
        let sid = self.drain_added(stmt)?;

        self.send_line(&format!("(Exec {})", sid.0))?;
        let feedback = self.drain_exec(stmt)?;

        self.reconcile(stmt, kind, module_op, sid, &module_prefix_before)?;

        self.mirror.cur_state = Some(sid);
        self.mirror.command_history.mark_last_accepted(sid);

        Ok(RunStmtOutcome { state_id: sid, feedback })
    }

    fn drain_added(&mut self, stmt: &str) -> Result<StateId, DriverError> {
        loop {
            match self.recv_classified(stmt)? {
                ClassifiedMessage::Ack | ClassifiedMessage::Feedback { .. } => continue,
                ClassifiedMessage::Added(sid) => {
                    self.drain_completed(stmt)?;
                    return Ok(sid);
                }
                ClassifiedMessage::CoqExn { kind, messages, .. } => {
                    self.drain_completed(stmt).ok();
                    return Err(crate::recovery::exn_to_error(kind, stmt.to_string(), messages));
                }
                other => return Err(DriverError::BadResponse { raw: format!("{:?}", other) }),
            }
        }
    }

    fn drain_exec(&mut self, stmt: &str) -> Result<Vec<Sexp>, DriverError> {
        let mut feedback = Vec::new();
        loop {
            match self.recv_classified(stmt)? {
                ClassifiedMessage::Completed => return Ok(feedback),
                ClassifiedMessage::Ack => continue,
                ClassifiedMessage::Feedback { payload, .. } => {
                    feedback.push(payload);
                }
                ClassifiedMessage::CoqExn { kind, messages, .. } => {
                    self.drain_completed(stmt).ok();
                    return Err(crate::recovery::exn_to_error(kind, stmt.to_string(), messages));
                }
                other => return Err(DriverError::BadResponse { raw: format!("{:?}", other) }),
            }
        }
    }

    fn reconcile(
        &mut self,
        stmt: &str,
        kind: StatementKind,
        module_op: Option<preprocess::ModuleSectionOp>,
        sid: StateId,
        module_prefix_before: &str,
    ) -> Result<(), DriverError> {
        use preprocess::ModuleSectionOp::*;

        if let Some(caps) = RE_RESET.captures(stmt) {
            self.mirror.lemma_registry.remove_by_name(&caps[1]);
        }

        match &module_op {
            Some(OpenModule(name)) => self.mirror.module_stack.push_module(name),
            Some(OpenSection(name)) => self.mirror.module_stack.push_section(name),
            Some(End(name)) => {
                let popped = self
                    .mirror
                    .module_stack
                    .pop(name)
                    .map_err(|message| DriverError::InvalidConfig { message })?;
                if popped.is_section {
                    self.mirror.lemma_registry.remove_section_scoped();
                }
            }
            None => {}
        }

        match kind {
            StatementKind::ProofStarter => {
                for entry in preprocess::extract_lemma_statements(stmt, module_prefix_before) {
                    self.mirror.lemma_registry.push(entry);
                }
                self.mirror.enter_proof();
                self.refresh_proof_context_into_mirror()?;
            }
            StatementKind::EndingProof => {
                if stmt.trim_start().starts_with("Abort") {
                    self.mirror.lemma_registry.pop_last();
                }
                self.mirror.leave_proof();
            }
            StatementKind::GoalOpen => {
                if let Some(history) = self.mirror.tactic_history.as_mut() {
                    let bg_before = self.mirror.proof_context.as_ref().map(|c| c.bg.clone()).unwrap_or_default();
                    history.open_subgoal(bg_before);
                }
                if let Some(ctx) = self.mirror.proof_context.as_mut() {
                    ctx.narrow_to_focus();
                }
            }
            StatementKind::GoalClose => {
                if let Some(history) = self.mirror.tactic_history.as_mut() {
                    history.close_subgoal();
                }
                self.refresh_proof_context_into_mirror()?;
            }
            StatementKind::Unshelve => {
                self.refresh_proof_context_into_mirror()?;
            }
            StatementKind::Other => {
                if let Some(history) = self.mirror.tactic_history.as_mut() {
                    history.add_tactic(stmt, sid);
                }
                self.refresh_proof_context_into_mirror()?;
            }
        }
        Ok(())
    }

    fn failure_policy(&mut self, e: &DriverError) -> Result<(), DriverError> {
        use DriverError::*;
        match e {
            ReservedIdentifier { .. } | Parse { .. } | InvalidConfig { .. } | Io(_) => Ok(()),
            NoSuchGoal { .. } | Unification { .. } => crate::recovery::cancel_failed(self),
            Overflow { .. } | Anomaly { .. } | Timeout { .. } | BrokenPipe(_) | BadResponse { .. } => {
                crate::recovery::reset_and_replay(self)
            }
        }
    }

    /// Full preprocess → linearize → per-atomic-statement transaction
    /// pipeline. On a failed sub-statement, routes the error through the
    /// recovery policy table before returning it to the caller.
    pub fn run_stmt(&mut self, text: &str) -> Result<Vec<RunStmtOutcome>, DriverError> {
        let cleaned = preprocess::kill_comments(text);
        let mut outcomes = Vec::new();
        for sub in preprocess::split_substatements(&cleaned) {
            let goal_count = self.mirror.proof_context.as_ref().map(|c| c.fg.len()).unwrap_or(1);
            for atomic in preprocess::linearize(&sub, goal_count) {
                match self.run_stmt_internal(&atomic) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        self.failure_policy(&e)?;
                        return Err(e);
                    }
                }
            }
        }
        debug_assert!(self.mirror.invariants_hold());
        Ok(outcomes)
    }

    pub fn cancel_last(&mut self) -> Result<(), DriverError> {
        crate::recovery::cancel_last(self)
    }

    pub fn cancel_failed(&mut self) -> Result<(), DriverError> {
        crate::recovery::cancel_failed(self)
    }

    pub fn check(&mut self, term: &str) -> Result<String, DriverError> {
        query::check(self.transport.as_mut(), self.options.timeout, &mut self.print_cache, term)
    }

    pub fn locate(&mut self, qid: &str) -> Result<Option<String>, DriverError> {
        let top = self.options.wrapper_module_name();
        query::locate(self.transport.as_mut(), self.options.timeout, qid, top.as_deref())
    }

    pub fn definition(&mut self, name: &str) -> Result<Vec<Sexp>, DriverError> {
        query::definition(self.transport.as_mut(), self.options.timeout, name)
    }

    pub fn assumptions(&mut self, name: &str) -> Result<Vec<Sexp>, DriverError> {
        query::assumptions(self.transport.as_mut(), self.options.timeout, name)
    }

    pub fn search(&mut self, pattern: &str) -> Result<Vec<String>, DriverError> {
        query::search(self.transport.as_mut(), self.options.timeout, pattern)
    }

    pub fn env(&mut self) -> Result<(Vec<EnvEntry>, Vec<EnvEntry>), DriverError> {
        query::env(self.transport.as_mut(), self.options.timeout, &mut self.print_cache)
    }

    pub fn print_term(&mut self, sexpr: &str, kind: PrintKind) -> Result<String, DriverError> {
        query::print_term(self.transport.as_mut(), self.options.timeout, &mut self.print_cache, sexpr, kind)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let _ = self.transport.kill();
    }
}

lazy_static! {
    static ref RE_RESET: Regex = Regex::new(r"^\s*Reset\s+([A-Za-z_][A-Za-z0-9_']*)\s*\.").unwrap();
}

fn parse_obligation(obj: &Sexp) -> Option<Obligation> {
    let items = obj.as_list()?;
    let hyps_sexp = items.first()?.as_list()?;
    let mut hypotheses = Vec::new();
    for h in hyps_sexp {
        let hitems = h.as_list()?;
        let names: Vec<String> =
            hitems.first()?.as_list()?.iter().filter_map(|n| n.as_atom().map(str::to_string)).collect();
        if names.is_empty() {
            continue;
        }
        let body = match hitems.get(1) {
            Some(Sexp::Atom(a)) if a == "None" => None,
            Some(other) => Some(Ast::new(other.to_string(), other.to_string())),
            None => None,
        };
        let ty_sexp = hitems.get(2)?;
        hypotheses.push(Hypothesis::new(names, body, Ast::new(ty_sexp.to_string(), ty_sexp.to_string())));
    }
    let goal_sexp = items.get(1)?;
    Some(Obligation { hypotheses, goal: Some(Ast::new(goal_sexp.to_string(), goal_sexp.to_string())) })
}

fn obligation_section(goal_obj: &[Sexp], key: &str) -> Vec<Obligation> {
    goal_obj
        .iter()
        .find_map(|f| {
            let pair = f.as_list()?;
            if pair.first()?.as_atom()? == key {
                Some(pair.get(1)?.as_list()?.iter().filter_map(parse_obligation).collect())
            } else {
                None
            }
        })
        .unwrap_or_default()
}

fn parse_proof_context(objs: &[Sexp]) -> ProofContext {
    let goal_obj = match objs.first().and_then(Sexp::as_list) {
        Some(items) => items,
        None => return ProofContext::default(),
    };
    ProofContext {
        fg: obligation_section(goal_obj, "fg"),
        bg: obligation_section(goal_obj, "bg"),
        shelved: obligation_section(goal_obj, "shelved"),
        given_up: obligation_section(goal_obj, "given_up"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;
    use std::time::Duration;

    fn opts() -> DriverOptions {
        let dir = tempfile::tempdir().unwrap();
        DriverOptions { project_path: dir.into_path(), timeout: Duration::from_millis(50), ..DriverOptions::default() }
    }

    fn added(sid: i64) -> String {
        format!("(Answer 0 (Added {} () ()))", sid)
    }

    #[test]
    fn run_stmt_accepts_a_simple_lemma_and_tracks_state() {
        // the Add/Exec round trip for `Lemma l : True.` (a proof starter)
        // triggers a follow-up Goals query; script its answer too.
        let t = ScriptedTransport::new(vec![
            vec![added(2).as_str(), "(Answer 0 Completed)"],
            vec!["(Answer 0 Completed)"],
            vec!["(Answer 0 (ObjList (((fg ()) (bg ()) (shelved ()) (given_up ())))))", "(Answer 0 Completed)"],
        ]);
        let mut driver = Driver::for_test(opts(), Box::new(t));
        let outcomes = driver.run_stmt("Lemma l : True.").unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(driver.mirror.cur_state, Some(StateId(2)));
        assert!(driver.mirror.proof_context.is_some());
    }

    #[test]
    fn run_stmt_routes_parse_error_without_cancelling() {
        let raw = r#"(Answer 0 (CoqExn (1 2 (Some 3) (str "Syntax error"))))"#;
        let t = ScriptedTransport::new(vec![vec![raw]]);
        let mut driver = Driver::for_test(opts(), Box::new(t));
        let err = driver.run_stmt("Lemma bad :=.").unwrap_err();
        match err {
            DriverError::Parse { .. } => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn module_open_and_close_updates_prefix() {
        let t = ScriptedTransport::new(vec![
            vec![added(2).as_str(), "(Answer 0 Completed)"],
            vec![added(3).as_str(), "(Answer 0 Completed)"],
        ]);
        let mut driver = Driver::for_test(opts(), Box::new(t));
        driver.run_stmt("Module M.").unwrap();
        assert_eq!(driver.mirror.module_stack.module_prefix(), "M");
        driver.run_stmt("End M.").unwrap();
        assert_eq!(driver.mirror.module_stack.module_prefix(), "");
    }
}
