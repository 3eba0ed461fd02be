use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RouterConfig, UrlSync};
use crate::error::RouteError;
use crate::history::HistorySink;
use crate::matcher::{PathMatcher, TrieMatcher};
use crate::params::{Params, ParamsDiff};
use crate::signals::{Endpoint, EventKind, RouterEvent, Signals};
use crate::transition::{self, Transition, TransitionHandle, TransitionOutcome};
use crate::tree::{StateId, StateTree, StateView};
use crate::value::{Accumulator, SubscriptionId};

/// The committed position of the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: StateId,
    /// Dotted full name of `state`.
    pub name: String,
    pub params: Params,
    /// Params diff of the transition that produced this snapshot.
    pub diff: ParamsDiff,
}

/// Router facade: resolves targets, starts transitions and tracks the
/// current state.
///
/// Cheap to clone; clones share the same state. Transitions run on the
/// tokio runtime the router is used from.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    tree: StateTree,
    matcher: Box<dyn PathMatcher>,
    history: Option<Arc<dyn HistorySink>>,
    config: RouterConfig,
    signals: Signals,
    state: Mutex<RouterState>,
    /// Serializes the commit phase of concurrent transitions.
    commit_gate: tokio::sync::Mutex<()>,
    /// Set while enter/update callbacks run.
    entering: AtomicBool,
    next_id: AtomicU64,
}

struct RouterState {
    /// Where the tree actually is. May be a non-leaf after a cancellation
    /// or a failure halfway through a commit.
    position: Option<Endpoint>,
    current: Option<StateSnapshot>,
    previous: Option<StateSnapshot>,
    active: Option<Active>,
    /// Last committed params per leaf, for `back_to`.
    last_params: HashMap<StateId, Params>,
    /// Cancelled whenever a new transition is accepted.
    epoch: CancellationToken,
    first_transition: bool,
}

struct Active {
    handle: TransitionHandle,
    from: Option<Endpoint>,
    to: Endpoint,
}

/// Everything the settle step needs once the transition value is consumed.
struct Settle {
    handle: TransitionHandle,
    from: Option<Endpoint>,
    to: Endpoint,
    diff: ParamsDiff,
    push_url: bool,
}

impl Router {
    pub fn builder(tree: StateTree) -> RouterBuilder {
        RouterBuilder {
            tree,
            config: RouterConfig::default(),
            matcher: None,
            history: None,
            signals: Signals::new(),
        }
    }

    pub fn tree(&self) -> &StateTree {
        &self.inner.tree
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Transition to a leaf state.
    ///
    /// `target` is either a dotted leaf name (`"blog.articles.edit"`) or, if
    /// it contains `/`, a path with optional query
    /// (`"/blog/articles/33/edit?filter=x"`). Params are ignored for the path
    /// form; for the name form only params the route declares are kept.
    ///
    /// Returns `Ok(None)` when the router already sits on the same state with
    /// the same params, and the running transition's handle when it already
    /// targets the same endpoint. Must be called within a tokio runtime.
    pub fn transition_to(
        &self,
        target: &str,
        params: Params,
    ) -> Result<Option<TransitionHandle>, RouteError> {
        self.transition_to_with(target, params, Accumulator::new())
    }

    /// Like [`Router::transition_to`], seeding the accumulator the enter
    /// callbacks share.
    pub fn transition_to_with(
        &self,
        target: &str,
        params: Params,
        acc: Accumulator,
    ) -> Result<Option<TransitionHandle>, RouteError> {
        let (state, params) = self.resolve(target, params)?;
        Ok(self.request(state, params, acc, false))
    }

    /// Go back to a leaf with the params it had when last committed, or
    /// `defaults` if it never was.
    pub fn back_to(
        &self,
        name: &str,
        defaults: Params,
    ) -> Result<Option<TransitionHandle>, RouteError> {
        self.back_to_with(name, defaults, Accumulator::new())
    }

    pub fn back_to_with(
        &self,
        name: &str,
        defaults: Params,
        acc: Accumulator,
    ) -> Result<Option<TransitionHandle>, RouteError> {
        let remembered = self
            .inner
            .tree
            .leaf(name)
            .and_then(|id| self.lock().last_params.get(&id).cloned());
        self.transition_to_with(name, remembered.unwrap_or(defaults), acc)
    }

    /// Report a history pop (back/forward) with the URL now shown.
    ///
    /// The resulting transition does not push to history. An empty URL is
    /// the root. A URL outside the configured format is `PathNotFound`
    /// unless a `not_found` state is set.
    pub fn handle_pop(&self, url: &str) -> Result<Option<TransitionHandle>, RouteError> {
        let (state, params) = match self.local_path(url) {
            Some(path) => self.resolve(&path, Params::new())?,
            None if url.is_empty() => self.resolve("/", Params::new())?,
            None => self.not_found(RouteError::PathNotFound(url.to_string()))?,
        };
        Ok(self.request(state, params, Accumulator::new(), true))
    }

    /// Route a clicked link through the router when it is same-origin.
    ///
    /// Returns `Ok(false)` when the click should be left to the browser:
    /// interception is off, the href is external, or it is a plain in-page
    /// anchor in history mode.
    pub fn handle_anchor_click(&self, href: &str) -> Result<bool, RouteError> {
        if !self.inner.config.intercept_anchors || is_external(href) {
            return Ok(false);
        }
        let Some(path) = self.local_path(href) else {
            return Ok(false);
        };
        self.transition_to(&path, Params::new())?;
        Ok(true)
    }

    /// Wait until no transition is running, following redirects.
    pub async fn settled(&self) {
        loop {
            let active = self.lock().active.as_ref().map(|a| a.handle.clone());
            match active {
                Some(handle) => {
                    handle.settled().await;
                }
                None => return,
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Last committed state, if any.
    pub fn current(&self) -> Option<StateSnapshot> {
        self.lock().current.clone()
    }

    pub fn previous(&self) -> Option<StateSnapshot> {
        self.lock().previous.clone()
    }

    /// Params diff of the last committed transition.
    pub fn params_diff(&self) -> ParamsDiff {
        self.lock()
            .current
            .as_ref()
            .map(|c| c.diff.clone())
            .unwrap_or_default()
    }

    /// `true` until the first transition settled.
    pub fn is_first_transition(&self) -> bool {
        self.lock().first_transition
    }

    /// Whether a transition is currently running.
    pub fn is_transitioning(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn find_state(&self, full_name: &str) -> Option<StateView<'_>> {
        self.inner
            .tree
            .find(full_name)
            .and_then(|id| self.inner.tree.state(id))
    }

    pub fn state(&self, id: StateId) -> Option<StateView<'_>> {
        self.inner.tree.state(id)
    }

    /// URL for a leaf state, formatted for the configured sync mode.
    pub fn link(&self, name: &str, params: &Params) -> Result<String, RouteError> {
        let id = self.leaf_by_name(name)?;
        let params = self.declared(id, params.clone())?;
        let path = self.inner.matcher.interpolate(id, &params)?;
        Ok(self.inner.config.format_url(&path))
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&RouterEvent) + Send + Sync + 'static,
    {
        self.inner.signals.subscribe(kind, handler)
    }

    /// Returns `true` if the subscription existed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.signals.unsubscribe(id)
    }

    // ========================================================================
    // Async work started by enter callbacks
    // ========================================================================

    /// Tie a future to the current transition.
    ///
    /// Only allowed from an `enter` / `update` callback. The returned future
    /// yields `None` if another transition started in the meantime, so stale
    /// results are never applied.
    pub fn guard<F>(&self, fut: F) -> Result<BoxFuture<'static, Option<F::Output>>, RouteError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.inner.entering.load(Ordering::Acquire) {
            return Err(RouteError::NotEntering);
        }
        let epoch = self.lock().epoch.clone();
        Ok(Box::pin(async move {
            tokio::select! {
                biased;
                _ = epoch.cancelled() => None,
                value = fut => (!epoch.is_cancelled()).then_some(value),
            }
        }))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    pub(crate) fn entering_flag(&self) -> &AtomicBool {
        &self.inner.entering
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, target: &str, params: Params) -> Result<(StateId, Params), RouteError> {
        if target.contains('/') {
            return match self.inner.matcher.find(target) {
                Some(hit) => Ok((hit.state, hit.params)),
                None => self.not_found(RouteError::PathNotFound(target.to_string())),
            };
        }
        match self.leaf_by_name(target) {
            Ok(id) => Ok((id, self.declared(id, params)?)),
            Err(RouteError::StateNotFound(name)) => {
                self.not_found(RouteError::StateNotFound(name))
            }
            Err(e) => Err(e),
        }
    }

    fn leaf_by_name(&self, name: &str) -> Result<StateId, RouteError> {
        let tree = &self.inner.tree;
        match tree.leaf(name) {
            Some(id) => Ok(id),
            None if tree.find(name).is_some() => Err(RouteError::NotALeaf(name.to_string())),
            None => Err(RouteError::StateNotFound(name.to_string())),
        }
    }

    fn not_found(&self, err: RouteError) -> Result<(StateId, Params), RouteError> {
        match self
            .inner
            .config
            .not_found
            .as_deref()
            .and_then(|name| self.inner.tree.leaf(name))
        {
            Some(id) => Ok((id, Params::new())),
            None => Err(err),
        }
    }

    /// Keep only the params the route of `id` declares; every path param
    /// must be present.
    fn declared(&self, id: StateId, mut params: Params) -> Result<Params, RouteError> {
        let tree = &self.inner.tree;
        let Some(route) = tree.route(id) else {
            return Err(RouteError::StateNotFound(format!("#{}", id.0)));
        };
        if let Some(missing) = route.params().find(|p| !params.contains(p)) {
            return Err(RouteError::MissingParam {
                state: tree.full_name(id).to_string(),
                param: missing.to_string(),
            });
        }
        params.retain(|k| route.params().any(|p| p == k) || route.query.iter().any(|q| q == k));
        Ok(params)
    }

    /// Path+query part of a same-origin URL in this router's format.
    fn local_path(&self, url: &str) -> Option<String> {
        let path = self.inner.config.parse_url(url)?;
        Some(if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        })
    }

    /// Accept a resolved request: supersede the running transition and spawn
    /// the new one.
    fn request(
        &self,
        state: StateId,
        params: Params,
        acc: Accumulator,
        from_pop: bool,
    ) -> Option<TransitionHandle> {
        let tree = &self.inner.tree;
        let to = Endpoint {
            state,
            name: tree.full_name(state).to_string(),
            params,
        };

        let mut guard = self.lock();
        match &guard.active {
            Some(active) if active.to == to && !active.handle.is_cancelled() => {
                return Some(active.handle.clone());
            }
            None if guard.position.as_ref() == Some(&to) => return None,
            _ => {}
        }

        let mut superseded = None;
        let from = match guard.active.take() {
            Some(active) => {
                let interrupted = active.handle.shared().interrupt();
                if !interrupted.finished {
                    superseded = Some((active.from, active.to));
                    guard.first_transition = false;
                }
                interrupted.reached
            }
            None => guard.position.clone(),
        };
        guard.epoch.cancel();
        guard.epoch = CancellationToken::new();

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let diff = match &from {
            Some(f) => f.params.diff(&to.params),
            None => Params::new().diff(&to.params),
        };
        let plan = transition::plan(tree, from.as_ref().map(|f| f.state), state, &diff.all());
        let logs = self.inner.config.enable_logs;
        if logs {
            debug!(
                id,
                from = from.as_ref().map(|f| f.name.as_str()).unwrap_or("-"),
                to = %to.name,
                "transition: exit {:?}, enter {:?}",
                plan.exits.iter().map(|&s| tree.full_name(s)).collect::<Vec<_>>(),
                plan.enters
                    .iter()
                    .map(|&(s, step)| format!("{step} {}", tree.full_name(s)))
                    .collect::<Vec<_>>(),
            );
        }

        let transition = Transition::new(id, from.clone(), to.clone(), diff, plan, acc, logs);
        let handle = transition.handle();
        guard.active = Some(Active {
            handle: handle.clone(),
            from: from.clone(),
            to: to.clone(),
        });
        drop(guard);

        if let Some((old_from, old_to)) = superseded {
            info!(from = %old_to.name, to = %to.name, "transition superseded");
            self.inner
                .signals
                .emit_terminal(EventKind::Cancelled, old_from, old_to, None);
        }
        self.inner.signals.emit(&RouterEvent {
            kind: EventKind::Started,
            from,
            to,
            error: None,
        });

        let settle = Settle {
            handle: handle.clone(),
            from: transition.from.clone(),
            to: transition.to.clone(),
            diff: transition.diff.clone(),
            push_url: id != 1 && !from_pop,
        };
        let router = self.clone();
        tokio::spawn(async move {
            let prepared = transition.prepare(router.tree()).await;
            let _gate = router.inner.commit_gate.lock().await;
            let outcome = match prepared {
                Ok(prepared) => prepared.commit(&router),
                Err(outcome) => outcome,
            };
            router.settle(settle, outcome);
        });

        Some(handle)
    }

    /// Fold a transition's outcome into router state, then notify.
    fn settle(&self, settle: Settle, outcome: TransitionOutcome) {
        let Settle {
            handle,
            from,
            to,
            diff,
            push_url,
        } = settle;

        let mut guard = self.lock();
        let is_active = guard
            .active
            .as_ref()
            .is_some_and(|a| a.handle.same(&handle));
        if is_active {
            guard.active = None;
            guard.first_transition = false;
        }

        let event = match &outcome {
            TransitionOutcome::Completed => {
                let snapshot = StateSnapshot {
                    state: to.state,
                    name: to.name.clone(),
                    params: to.params.clone(),
                    diff,
                };
                guard.previous = guard.current.replace(snapshot);
                guard.last_params.insert(to.state, to.params.clone());
                guard.first_transition = false;
                if is_active {
                    guard.position = Some(to.clone());
                }
                Some(EventKind::Completed)
            }
            TransitionOutcome::Failed(_) => {
                if is_active {
                    guard.position = handle.shared().reached();
                }
                Some(EventKind::Failed)
            }
            // Superseded transitions were reported when superseded.
            TransitionOutcome::Cancelled => is_active.then(|| {
                guard.position = handle.shared().reached();
                EventKind::Cancelled
            }),
        };
        drop(guard);

        if outcome.is_completed() && push_url {
            self.push_history(&to);
        }
        if let Some(kind) = event {
            if self.inner.config.enable_logs {
                debug!(id = handle.id(), to = %to.name, "transition {kind}");
            }
            if kind == EventKind::Cancelled {
                info!(to = %to.name, "transition cancelled");
            }
            self.inner
                .signals
                .emit_terminal(kind, from, to, outcome.error().cloned());
        }
        handle.shared().resolve(outcome);
    }

    fn push_history(&self, to: &Endpoint) {
        let Some(history) = &self.inner.history else {
            return;
        };
        match self.inner.matcher.interpolate(to.state, &to.params) {
            Ok(path) => history.push(&self.inner.config.format_url(&path)),
            Err(e) => warn!(state = %to.name, "cannot build URL for history: {e}"),
        }
    }
}

/// Links to another origin or scheme are left alone.
fn is_external(href: &str) -> bool {
    if href.starts_with("//") {
        return true;
    }
    let head = href.split(['/', '?', '#']).next().unwrap_or_default();
    head.contains(':')
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Router`] from a state tree.
pub struct RouterBuilder {
    tree: StateTree,
    config: RouterConfig,
    matcher: Option<Box<dyn PathMatcher>>,
    history: Option<Arc<dyn HistorySink>>,
    signals: Signals,
}

impl RouterBuilder {
    pub fn configure(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default [`TrieMatcher`].
    pub fn matcher<M: PathMatcher + 'static>(mut self, matcher: M) -> Self {
        self.matcher = Some(Box::new(matcher));
        self
    }

    pub fn history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    /// Subscribe before the first transition starts.
    pub fn on<F>(self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&RouterEvent) + Send + Sync + 'static,
    {
        self.signals.subscribe(kind, handler);
        self
    }

    /// Initialize the tree and register routes without transitioning.
    pub fn build(self) -> Result<Router, RouteError> {
        let RouterBuilder {
            mut tree,
            config,
            matcher,
            history,
            signals,
        } = self;

        if !tree.is_initialized() {
            tree.init()?;
        }
        let mut matcher = matcher.unwrap_or_else(|| Box::new(TrieMatcher::new()));
        for (_, id) in tree.leaves() {
            if let Some(route) = tree.route(id) {
                matcher.add_route(id, route)?;
            }
        }
        if let Some(name) = config.not_found.as_deref() {
            if tree.leaf(name).is_none() {
                return Err(match tree.find(name) {
                    Some(_) => RouteError::NotALeaf(name.to_string()),
                    None => RouteError::StateNotFound(name.to_string()),
                });
            }
        }
        if config.enable_logs {
            let mode = match config.url_sync {
                UrlSync::History => "history",
                UrlSync::Hash => "hash",
            };
            debug!(states = tree.len(), mode, "router ready");
        }

        Ok(Router {
            inner: Arc::new(RouterInner {
                tree,
                matcher,
                history,
                config,
                signals,
                state: Mutex::new(RouterState {
                    position: None,
                    current: None,
                    previous: None,
                    active: None,
                    last_params: HashMap::new(),
                    epoch: CancellationToken::new(),
                    first_transition: true,
                }),
                commit_gate: tokio::sync::Mutex::new(()),
                entering: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// [`RouterBuilder::build`], then start the first transition.
    ///
    /// `initial` is a leaf name or a path, as for [`Router::transition_to`].
    /// Must be called within a tokio runtime.
    pub fn init(self, initial: &str, params: Params) -> Result<Router, RouteError> {
        let router = self.build()?;
        router.transition_to(initial, params)?;
        Ok(router)
    }
}
