use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use futures::future::{self, try_join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransitionError;
use crate::params::{Params, ParamsDiff};
use crate::router::Router;
use crate::signals::Endpoint;
use crate::state::{PrereqHook, Step, StepContext};
use crate::tree::{StateId, StateTree};
use crate::value::{Accumulator, StateValue};

// ============================================================================
// Planning
// ============================================================================

/// The ordered steps of one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// States to exit, deepest first.
    pub exits: Vec<StateId>,
    /// States to enter (or update), outermost first.
    pub enters: Vec<(StateId, Step)>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.exits.is_empty() && self.enters.is_empty()
    }
}

/// Where the exit and enter chains stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pivot {
    /// No shared ancestor: leave and enter whole chains.
    Whole,
    /// The pivot is itself exited and re-entered.
    Inclusive(StateId),
    /// The pivot stays put; only states below it move.
    Exclusive(StateId),
}

/// Compute the exit and enter steps from `from` to the leaf `to`.
///
/// `changed` is the set of param names whose value differs between the two
/// sides. A state that owns one of them is re-entered even when it is shared
/// by both chains; the outermost such owner wins. When `from == to` the
/// states with an `update` hook are updated in place instead.
pub fn plan(
    tree: &StateTree,
    from: Option<StateId>,
    to: StateId,
    changed: &BTreeSet<String>,
) -> Plan {
    let Some(from) = from else {
        let mut enters: Vec<_> = tree
            .chain(to)
            .into_iter()
            .map(|id| (id, Step::Enter))
            .collect();
        enters.reverse();
        return Plan {
            exits: Vec::new(),
            enters,
        };
    };

    let param_only = from == to;
    let pivot = pivot(tree, from, to, changed, param_only);
    let updatable = |id: StateId| param_only && tree.node(id).hooks.update.is_some();

    let exits = chain_until(tree, from, pivot)
        .into_iter()
        .filter(|&id| !updatable(id))
        .collect();

    let mut enters: Vec<_> = chain_until(tree, to, pivot)
        .into_iter()
        .map(|id| {
            let step = if updatable(id) { Step::Update } else { Step::Enter };
            (id, step)
        })
        .collect();
    enters.reverse();

    Plan { exits, enters }
}

fn pivot(
    tree: &StateTree,
    from: StateId,
    to: StateId,
    changed: &BTreeSet<String>,
    param_only: bool,
) -> Pivot {
    let common = if param_only {
        None
    } else {
        let to_ancestors = tree.ancestors(to);
        tree.ancestors(from)
            .iter()
            .copied()
            .find(|a| to_ancestors.contains(a))
    };

    let mut outermost_first = tree.chain(from);
    outermost_first.reverse();
    for id in outermost_first {
        let template = &tree.node(id).template;
        if changed.iter().any(|p| template.owns(p)) {
            return Pivot::Inclusive(id);
        }
        if Some(id) == common {
            return Pivot::Exclusive(id);
        }
    }

    match common {
        Some(common) => Pivot::Exclusive(common),
        None if param_only => Pivot::Inclusive(from),
        None => Pivot::Whole,
    }
}

/// `state` and its ancestors, closest first, cut at `pivot`.
fn chain_until(tree: &StateTree, state: StateId, pivot: Pivot) -> Vec<StateId> {
    let mut chain = tree.chain(state);
    match pivot {
        Pivot::Whole => {}
        Pivot::Inclusive(p) => {
            if let Some(i) = chain.iter().position(|&id| id == p) {
                chain.truncate(i + 1);
            }
        }
        Pivot::Exclusive(p) => {
            if let Some(i) = chain.iter().position(|&id| id == p) {
                chain.truncate(i);
            }
        }
    }
    chain
}

// ============================================================================
// Outcome and handle
// ============================================================================

/// How a transition ended.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Completed,
    Failed(TransitionError),
    Cancelled,
}

impl TransitionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransitionOutcome::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransitionOutcome::Cancelled)
    }

    pub fn error(&self) -> Option<&TransitionError> {
        match self {
            TransitionOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

struct Progress {
    cancelled: bool,
    /// Committed or failed; cancellation is no longer possible.
    finished: bool,
    /// Tree position after the last step that ran.
    reached: Option<Endpoint>,
}

pub(crate) struct Shared {
    id: u64,
    token: CancellationToken,
    progress: Mutex<Progress>,
    outcome: watch::Sender<Option<TransitionOutcome>>,
}

/// What [`Shared::interrupt`] found.
pub(crate) struct Interrupted {
    /// The transition had already committed or failed.
    pub(crate) finished: bool,
    pub(crate) reached: Option<Endpoint>,
}

impl Shared {
    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel unless already finished. Returns the position reached so far.
    pub(crate) fn interrupt(&self) -> Interrupted {
        let mut p = self.progress();
        if !p.finished && !p.cancelled {
            p.cancelled = true;
            self.token.cancel();
        }
        Interrupted {
            finished: p.finished,
            reached: p.reached.clone(),
        }
    }

    /// Record the position the next step leads to. `false` once cancelled.
    fn advance(&self, reached: Option<Endpoint>) -> bool {
        let mut p = self.progress();
        if p.cancelled {
            return false;
        }
        p.reached = reached;
        true
    }

    /// Mark the transition terminal. `false` if it was cancelled first.
    fn finish(&self) -> bool {
        let mut p = self.progress();
        if p.cancelled {
            return false;
        }
        p.finished = true;
        true
    }

    pub(crate) fn reached(&self) -> Option<Endpoint> {
        self.progress().reached.clone()
    }

    pub(crate) fn resolve(&self, outcome: TransitionOutcome) {
        self.outcome.send_replace(Some(outcome));
    }
}

/// Caller-side view of a running transition.
///
/// Cloning is cheap; every clone refers to the same transition.
#[derive(Clone)]
pub struct TransitionHandle {
    shared: Arc<Shared>,
}

impl TransitionHandle {
    /// Sequence number, starting at 1 for the router's first transition.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Request cancellation.
    ///
    /// Pending prerequisites are dropped and no further step runs. Returns
    /// `false` if the transition already finished or was cancelled.
    pub fn cancel(&self) -> bool {
        let mut p = self.shared.progress();
        if p.finished || p.cancelled {
            return false;
        }
        p.cancelled = true;
        self.shared.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.progress().cancelled
    }

    /// The outcome, once the router has settled the transition.
    pub fn outcome(&self) -> Option<TransitionOutcome> {
        self.shared.outcome.borrow().clone()
    }

    /// Wait until the transition is settled.
    pub async fn settled(&self) -> TransitionOutcome {
        let mut rx = self.shared.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(TransitionOutcome::Cancelled),
            Err(_) => TransitionOutcome::Cancelled,
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn same(&self, other: &TransitionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for TransitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionHandle")
            .field("id", &self.shared.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Execution
// ============================================================================

/// One accepted transition request.
///
/// Runs in two phases: [`Transition::prepare`] awaits every prerequisite
/// concurrently, then [`Prepared::commit`] runs the callbacks synchronously.
/// Neither phase touches router state; the router settles the outcome.
pub(crate) struct Transition {
    pub(crate) from: Option<Endpoint>,
    pub(crate) to: Endpoint,
    pub(crate) diff: ParamsDiff,
    plan: Plan,
    acc: Accumulator,
    shared: Arc<Shared>,
    logs: bool,
}

type Resolved = (Step, StateId, StateValue);

impl Transition {
    pub(crate) fn new(
        id: u64,
        from: Option<Endpoint>,
        to: Endpoint,
        diff: ParamsDiff,
        plan: Plan,
        acc: Accumulator,
        logs: bool,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            id,
            token: CancellationToken::new(),
            progress: Mutex::new(Progress {
                cancelled: false,
                finished: false,
                reached: from.clone(),
            }),
            outcome,
        });
        Self {
            from,
            to,
            diff,
            plan,
            acc,
            shared,
            logs,
        }
    }

    pub(crate) fn handle(&self) -> TransitionHandle {
        TransitionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Await every exit and enter prerequisite, fail-fast.
    ///
    /// Cancellation drops the pending futures.
    pub(crate) async fn prepare(self, tree: &StateTree) -> Result<Prepared, TransitionOutcome> {
        let from_params = self.from_params();
        let mut pending: Vec<PendingPrereq> = Vec::new();

        for &id in &self.plan.exits {
            if let Some(hook) = &tree.node(id).hooks.exit_prereqs {
                pending.push(start_prereq(hook, &from_params, id, Step::Exit));
            }
        }
        for &(id, step) in &self.plan.enters {
            if let Some(hook) = &tree.node(id).hooks.enter_prereqs {
                pending.push(start_prereq(hook, &self.to.params, id, step));
            }
        }

        let token = self.shared.token.clone();
        let resolved = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransitionOutcome::Cancelled),
            res = try_join_all(pending) => res,
        };

        match resolved {
            Ok(values) => {
                let mut exit_values = HashMap::new();
                let mut enter_values = HashMap::new();
                for (step, id, value) in values {
                    match step {
                        Step::Exit => exit_values.insert(id, value),
                        Step::Enter | Step::Update => enter_values.insert(id, value),
                    };
                }
                Ok(Prepared {
                    transition: self,
                    exit_values,
                    enter_values,
                })
            }
            Err((id, cause)) => {
                let state = tree.full_name(id).to_string();
                warn!(state = %state, to = %self.to.name, "prerequisite failed: {cause:#}");
                if !self.shared.finish() {
                    return Err(TransitionOutcome::Cancelled);
                }
                Err(TransitionOutcome::Failed(TransitionError::Prerequisite {
                    state,
                    state_id: id,
                    cause: Arc::new(cause),
                }))
            }
        }
    }

    fn from_params(&self) -> Params {
        self.from
            .as_ref()
            .map(|f| f.params.clone())
            .unwrap_or_default()
    }
}

/// A transition whose prerequisites all resolved.
pub(crate) struct Prepared {
    transition: Transition,
    exit_values: HashMap<StateId, StateValue>,
    enter_values: HashMap<StateId, StateValue>,
}

/// Keeps the router's "enter phase running" flag set while alive.
struct EnterPhase<'a>(&'a AtomicBool);

impl<'a> EnterPhase<'a> {
    fn begin(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for EnterPhase<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Prepared {
    /// Run exits (deepest first) then enters/updates (outermost first).
    ///
    /// Cancellation is checked before every step. The position reached is
    /// recorded before a callback runs, so a transition requested from
    /// inside the callback starts from there.
    pub(crate) fn commit(self, router: &Router) -> TransitionOutcome {
        let Prepared {
            mut transition,
            exit_values,
            enter_values,
        } = self;
        let tree = router.tree();
        let shared = Arc::clone(&transition.shared);
        let from_params = transition.from_params();
        let to_params = transition.to.params.clone();

        for &id in &transition.plan.exits {
            let reached = tree.parent(id).map(|p| Endpoint {
                state: p,
                name: tree.full_name(p).to_string(),
                params: from_params.clone(),
            });
            if !shared.advance(reached) {
                return TransitionOutcome::Cancelled;
            }
            if transition.logs {
                debug!(state = tree.full_name(id), "exit");
            }
            let step = StepRun {
                tree,
                router,
                id,
                step: Step::Exit,
                params: &from_params,
                value: exit_values.get(&id),
            };
            if let Err(e) = step.run(&mut transition.acc) {
                return failed(&shared, e);
            }
        }

        let _entering = EnterPhase::begin(router.entering_flag());
        for &(id, step) in &transition.plan.enters {
            let reached = Some(Endpoint {
                state: id,
                name: tree.full_name(id).to_string(),
                params: to_params.clone(),
            });
            if !shared.advance(reached) {
                return TransitionOutcome::Cancelled;
            }
            if transition.logs {
                debug!(state = tree.full_name(id), "{step}");
            }
            let run = StepRun {
                tree,
                router,
                id,
                step,
                params: &to_params,
                value: enter_values.get(&id),
            };
            if let Err(e) = run.run(&mut transition.acc) {
                return failed(&shared, e);
            }
        }

        if shared.finish() {
            TransitionOutcome::Completed
        } else {
            TransitionOutcome::Cancelled
        }
    }
}

/// A failed step only counts if no newer request cancelled the transition
/// while its callback ran.
fn failed(shared: &Shared, error: TransitionError) -> TransitionOutcome {
    if shared.finish() {
        TransitionOutcome::Failed(error)
    } else {
        TransitionOutcome::Cancelled
    }
}

type PendingPrereq = BoxFuture<'static, Result<Resolved, (StateId, anyhow::Error)>>;

/// Call a prerequisite hook and box its future. A panic in either the call
/// or the future becomes an error for `id`.
fn start_prereq(hook: &PrereqHook, params: &Params, id: StateId, step: Step) -> PendingPrereq {
    let fut = match panic::catch_unwind(AssertUnwindSafe(|| hook(params))) {
        Ok(fut) => fut,
        Err(payload) => {
            let cause = anyhow!("prerequisite panicked: {}", panic_message(payload.as_ref()));
            return Box::pin(future::ready(Err((id, cause))));
        }
    };
    Box::pin(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(res) => res.map(|v| (step, id, v)).map_err(|e| (id, e)),
            Err(payload) => Err((
                id,
                anyhow!("prerequisite panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// One callback invocation.
struct StepRun<'a> {
    tree: &'a StateTree,
    router: &'a Router,
    id: StateId,
    step: Step,
    params: &'a Params,
    value: Option<&'a StateValue>,
}

impl StepRun<'_> {
    fn run(self, acc: &mut Accumulator) -> Result<(), TransitionError> {
        let hooks = &self.tree.node(self.id).hooks;
        let hook = match self.step {
            Step::Exit => hooks.exit.clone(),
            Step::Enter => hooks.enter.clone(),
            Step::Update => hooks.update.clone(),
        };
        let Some(hook) = hook else {
            return Ok(());
        };

        let mut ctx = StepContext {
            tree: self.tree,
            state: self.id,
            step: self.step,
            params: self.params,
            value: self.value,
            acc,
            router: self.router,
        };
        panic::catch_unwind(AssertUnwindSafe(|| hook(&mut ctx))).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            let state = self.tree.full_name(self.id).to_string();
            warn!(state = %state, step = %self.step, "callback panicked: {message}");
            TransitionError::Callback {
                state,
                state_id: self.id,
                step: self.step,
                message,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    fn leaf(template: &str) -> State {
        State::builder(template).build().unwrap()
    }

    /// ```text
    /// index            ""
    /// blog             "blog?filter"
    ///   articles       "articles/:id"   (update hook)
    ///     show         ""
    ///     edit         "edit"
    ///   new            "new"
    /// about            "about"
    /// ```
    fn tree() -> StateTree {
        let mut tree = StateTree::new();
        tree.add_state("index", leaf("")).unwrap();
        tree.add_state(
            "blog",
            State::builder("blog?filter")
                .child(
                    "articles",
                    State::builder("articles/:id")
                        .update(|_| {})
                        .child("show", leaf(""))
                        .child("edit", leaf("edit"))
                        .build()
                        .unwrap(),
                )
                .child("new", leaf("new"))
                .build()
                .unwrap(),
        )
        .unwrap();
        tree.add_state("about", leaf("about")).unwrap();
        tree.init().unwrap();
        tree
    }

    fn names(tree: &StateTree, ids: &[StateId]) -> Vec<String> {
        ids.iter().map(|&id| tree.full_name(id).to_string()).collect()
    }

    fn steps(tree: &StateTree, steps: &[(StateId, Step)]) -> Vec<String> {
        steps
            .iter()
            .map(|&(id, step)| format!("{step} {}", tree.full_name(id)))
            .collect()
    }

    fn changed(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // ========================================================================
    // plan
    // ========================================================================

    #[test]
    fn first_transition_enters_whole_chain() {
        let tree = tree();
        let edit = tree.find("blog.articles.edit").unwrap();
        let p = plan(&tree, None, edit, &changed(&["id"]));
        assert!(p.exits.is_empty());
        assert_eq!(
            steps(&tree, &p.enters),
            vec![
                "enter blog",
                "enter blog.articles",
                "enter blog.articles.edit"
            ]
        );
    }

    #[test]
    fn unrelated_states_exit_and_enter_fully() {
        let tree = tree();
        let show = tree.find("blog.articles.show").unwrap();
        let about = tree.find("about").unwrap();
        let p = plan(&tree, Some(show), about, &changed(&["id"]));
        assert_eq!(
            names(&tree, &p.exits),
            vec!["blog.articles.show", "blog.articles", "blog"]
        );
        assert_eq!(steps(&tree, &p.enters), vec!["enter about"]);
    }

    #[test]
    fn common_ancestor_stays_when_its_params_are_unchanged() {
        let tree = tree();
        let show = tree.find("blog.articles.show").unwrap();
        let edit = tree.find("blog.articles.edit").unwrap();
        let p = plan(&tree, Some(show), edit, &BTreeSet::new());
        assert_eq!(names(&tree, &p.exits), vec!["blog.articles.show"]);
        assert_eq!(steps(&tree, &p.enters), vec!["enter blog.articles.edit"]);
    }

    #[test]
    fn changed_param_owner_is_reentered() {
        let tree = tree();
        let show = tree.find("blog.articles.show").unwrap();
        let edit = tree.find("blog.articles.edit").unwrap();
        let p = plan(&tree, Some(show), edit, &changed(&["id"]));
        assert_eq!(
            names(&tree, &p.exits),
            vec!["blog.articles.show", "blog.articles"]
        );
        assert_eq!(
            steps(&tree, &p.enters),
            vec!["enter blog.articles", "enter blog.articles.edit"]
        );
    }

    #[test]
    fn outermost_owner_wins() {
        let tree = tree();
        let edit = tree.find("blog.articles.edit").unwrap();
        let new = tree.find("blog.new").unwrap();
        // `filter` belongs to blog, above the common ancestor.
        let p = plan(&tree, Some(edit), new, &changed(&["filter", "id"]));
        assert_eq!(
            names(&tree, &p.exits),
            vec!["blog.articles.edit", "blog.articles", "blog"]
        );
        assert_eq!(steps(&tree, &p.enters), vec!["enter blog", "enter blog.new"]);
    }

    #[test]
    fn query_params_count_like_path_params() {
        let tree = tree();
        let edit = tree.find("blog.articles.edit").unwrap();
        let p = plan(&tree, Some(edit), edit, &changed(&["filter"]));
        // articles has an update hook; blog and edit do not.
        assert_eq!(names(&tree, &p.exits), vec!["blog.articles.edit", "blog"]);
        assert_eq!(
            steps(&tree, &p.enters),
            vec![
                "enter blog",
                "update blog.articles",
                "enter blog.articles.edit"
            ]
        );
    }

    #[test]
    fn param_only_change_updates_in_place() {
        let tree = tree();
        let edit = tree.find("blog.articles.edit").unwrap();
        let p = plan(&tree, Some(edit), edit, &changed(&["id"]));
        assert_eq!(names(&tree, &p.exits), vec!["blog.articles.edit"]);
        assert_eq!(
            steps(&tree, &p.enters),
            vec!["update blog.articles", "enter blog.articles.edit"]
        );
    }

    #[test]
    fn param_only_change_without_owner_reenters_leaf() {
        let tree = tree();
        let about = tree.find("about").unwrap();
        let p = plan(&tree, Some(about), about, &changed(&["unknown"]));
        assert_eq!(names(&tree, &p.exits), vec!["about"]);
        assert_eq!(steps(&tree, &p.enters), vec!["enter about"]);
    }

    #[test]
    fn from_intermediate_position() {
        let tree = tree();
        // A transition cancelled halfway left the router on `blog`.
        let blog = tree.find("blog").unwrap();
        let new = tree.find("blog.new").unwrap();
        let p = plan(&tree, Some(blog), new, &BTreeSet::new());
        assert!(p.exits.is_empty());
        assert_eq!(steps(&tree, &p.enters), vec!["enter blog.new"]);
    }

    // ========================================================================
    // handle
    // ========================================================================

    fn transition(id: u64) -> Transition {
        let tree = tree();
        let about = tree.find("about").unwrap();
        let to = Endpoint {
            state: about,
            name: "about".into(),
            params: Params::new(),
        };
        let p = plan(&tree, None, about, &BTreeSet::new());
        Transition::new(
            id,
            None,
            to,
            ParamsDiff::default(),
            p,
            Accumulator::new(),
            false,
        )
    }

    #[test]
    fn cancel_is_one_shot() {
        let t = transition(7);
        let h = t.handle();
        assert_eq!(h.id(), 7);
        assert!(!h.is_cancelled());
        assert!(h.cancel());
        assert!(!h.cancel());
        assert!(h.is_cancelled());

        let i = h.shared().interrupt();
        assert!(!i.finished);
    }

    #[test]
    fn finished_transition_cannot_be_cancelled() {
        let t = transition(1);
        let h = t.handle();
        assert!(t.shared.finish());
        assert!(!h.cancel());
        assert!(h.shared().interrupt().finished);
        assert!(!h.is_cancelled());
    }

    #[tokio::test]
    async fn settled_waits_for_outcome() {
        let t = transition(1);
        let h = t.handle();
        assert!(h.outcome().is_none());

        let waiter = {
            let h = h.clone();
            tokio::spawn(async move { h.settled().await })
        };
        h.shared().resolve(TransitionOutcome::Completed);

        assert!(waiter.await.unwrap().is_completed());
        assert!(h.outcome().unwrap().is_completed());
    }

    #[tokio::test]
    async fn prepare_observes_cancellation() {
        let tree = tree();
        let t = transition(1);
        t.handle().cancel();
        let res = t.prepare(&tree).await;
        assert!(matches!(res, Err(TransitionOutcome::Cancelled)));
    }
}
