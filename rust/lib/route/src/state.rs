use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::RouteError;
use crate::params::Params;
use crate::router::Router;
use crate::template::PathTemplate;
use crate::tree::{StateId, StateTree, StateView};
use crate::value::{Accumulator, StateValue};

/// Synchronous lifecycle callback (`enter`, `exit`, `update`).
pub type StepHook = Arc<dyn Fn(&mut StepContext<'_>) + Send + Sync>;

/// Future produced by a prerequisite hook.
pub type PrereqFuture = BoxFuture<'static, anyhow::Result<StateValue>>;

/// Type-erased prerequisite hook.
///
/// Takes the params of the side it belongs to (target params for
/// `enter_prereqs`, origin params for `exit_prereqs`) and returns a future
/// whose value is handed to the matching callback.
pub type PrereqHook = Arc<dyn Fn(&Params) -> PrereqFuture + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) enter: Option<StepHook>,
    pub(crate) exit: Option<StepHook>,
    pub(crate) update: Option<StepHook>,
    pub(crate) enter_prereqs: Option<PrereqHook>,
    pub(crate) exit_prereqs: Option<PrereqHook>,
}

/// Which callback a [`StepContext`] is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Exit,
    Enter,
    Update,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Exit => "exit",
            Step::Enter => "enter",
            Step::Update => "update",
        })
    }
}

/// Everything a lifecycle callback gets to see.
pub struct StepContext<'a> {
    pub(crate) tree: &'a StateTree,
    pub(crate) state: StateId,
    pub(crate) step: Step,
    pub(crate) params: &'a Params,
    pub(crate) value: Option<&'a StateValue>,
    pub(crate) acc: &'a mut Accumulator,
    pub(crate) router: &'a Router,
}

impl<'a> StepContext<'a> {
    /// The state whose callback is running.
    pub fn state(&self) -> StateView<'a> {
        StateView::new(self.tree, self.state)
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Origin params for `exit`, target params for `enter` / `update`.
    pub fn params(&self) -> &Params {
        self.params
    }

    /// Value resolved by this state's prerequisite, if it declared one.
    pub fn prereq_value(&self) -> Option<&StateValue> {
        self.value
    }

    /// Typed access to the prerequisite value.
    pub fn prereq<T: Any>(&self) -> Option<&T> {
        self.value.and_then(|v| v.downcast_ref::<T>())
    }

    /// Accumulator shared by every step of this transition.
    pub fn acc(&mut self) -> &mut Accumulator {
        self.acc
    }

    /// State data, falling back to ancestors.
    pub fn data(&self, key: &str) -> Option<StateValue> {
        self.tree.data(self.state, key)
    }

    /// Router facade, e.g. to redirect from inside `enter`.
    pub fn router(&self) -> &Router {
        self.router
    }
}

/// A validated state declaration, ready to be added to a [`StateTree`].
pub struct State {
    pub(crate) template: PathTemplate,
    pub(crate) raw: String,
    pub(crate) hooks: Hooks,
    pub(crate) data: HashMap<String, StateValue>,
    pub(crate) children: Vec<(String, State)>,
}

impl State {
    /// Start declaring a state with the given path template.
    ///
    /// ```ignore
    /// let articles = State::builder("articles/:id?filter")
    ///     .enter(|ctx| println!("viewing {}", ctx.params().get("id").unwrap()))
    ///     .child("edit", State::builder("edit").build()?)
    ///     .build()?;
    /// ```
    pub fn builder(template: &str) -> StateBuilder {
        StateBuilder {
            template: template.to_string(),
            hooks: Hooks::default(),
            data: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("template", &self.raw)
            .field("data", &self.data.keys().collect::<Vec<_>>())
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

/// Builder for [`State`]. Nothing is validated until [`StateBuilder::build`].
pub struct StateBuilder {
    template: String,
    hooks: Hooks,
    data: Vec<(String, StateValue)>,
    children: Vec<(String, State)>,
}

impl StateBuilder {
    pub fn enter<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) + Send + Sync + 'static,
    {
        self.hooks.enter = Some(Arc::new(f));
        self
    }

    pub fn exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) + Send + Sync + 'static,
    {
        self.hooks.exit = Some(Arc::new(f));
        self
    }

    /// Called instead of exit + enter when only params change.
    pub fn update<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) + Send + Sync + 'static,
    {
        self.hooks.update = Some(Arc::new(f));
        self
    }

    /// Async work that must finish before any callback of the transition runs.
    pub fn enter_prereqs<F, Fut, T>(mut self, f: F) -> Self
    where
        F: Fn(&Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        self.hooks.enter_prereqs = Some(erase_prereq(f));
        self
    }

    pub fn exit_prereqs<F, Fut, T>(mut self, f: F) -> Self
    where
        F: Fn(&Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        self.hooks.exit_prereqs = Some(erase_prereq(f));
        self
    }

    /// Attach a data entry. Declaring the same key twice fails at `build`.
    pub fn data<T: Any + Send + Sync>(mut self, key: &str, value: T) -> Self {
        self.data.push((key.to_string(), StateValue::new(value)));
        self
    }

    pub fn child(mut self, name: &str, state: State) -> Self {
        self.children.push((name.to_string(), state));
        self
    }

    pub fn build(self) -> Result<State, RouteError> {
        let template = PathTemplate::parse(&self.template)?;

        let mut names: Vec<&str> = Vec::new();
        for (name, _) in &self.children {
            validate_name(name)?;
            if names.contains(&name.as_str()) {
                return Err(RouteError::DuplicateState(name.clone()));
            }
            names.push(name);
        }

        let mut data = HashMap::new();
        for (key, value) in self.data {
            if data.contains_key(&key) {
                return Err(RouteError::DataKeyExists {
                    state: self.template,
                    key,
                });
            }
            data.insert(key, value);
        }

        Ok(State {
            template,
            raw: self.template,
            hooks: self.hooks,
            data,
            children: self.children,
        })
    }
}

fn erase_prereq<F, Fut, T>(f: F) -> PrereqHook
where
    F: Fn(&Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Any + Send + Sync,
{
    Arc::new(move |params: &Params| -> PrereqFuture {
        let fut = f(params);
        Box::pin(async move { fut.await.map(StateValue::new) })
    })
}

pub(crate) fn validate_name(name: &str) -> Result<(), RouteError> {
    if name.is_empty() || name.contains(['.', '/']) {
        return Err(RouteError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_collects_hooks_data_and_children() {
        let state = State::builder("articles/:id?filter")
            .enter(|_| {})
            .exit(|_| {})
            .data("title", "Articles".to_string())
            .child("edit", State::builder("edit").build().unwrap())
            .build()
            .unwrap();

        assert!(state.hooks.enter.is_some());
        assert!(state.hooks.exit.is_some());
        assert!(state.hooks.update.is_none());
        assert_eq!(state.children.len(), 1);
        assert_eq!(
            state.data["title"].downcast_ref::<String>().map(String::as_str),
            Some("Articles")
        );
        assert_eq!(state.template().query, vec!["filter".to_string()]);
    }

    #[test]
    fn build_rejects_duplicate_children() {
        let err = State::builder("blog")
            .child("articles", State::builder("a").build().unwrap())
            .child("articles", State::builder("b").build().unwrap())
            .build()
            .unwrap_err();
        assert_eq!(err, RouteError::DuplicateState("articles".into()));
    }

    #[test]
    fn build_rejects_bad_child_names() {
        for bad in ["", "a.b", "a/b"] {
            let err = State::builder("blog")
                .child(bad, State::builder("x").build().unwrap())
                .build()
                .unwrap_err();
            assert_eq!(err, RouteError::InvalidName(bad.into()));
        }
    }

    #[test]
    fn build_rejects_redeclared_data_key() {
        let err = State::builder("blog")
            .data("title", 1u32)
            .data("title", 2u32)
            .build()
            .unwrap_err();
        assert!(matches!(err, RouteError::DataKeyExists { key, .. } if key == "title"));
    }

    #[test]
    fn build_rejects_malformed_template() {
        let err = State::builder("articles//:id").build().unwrap_err();
        assert!(matches!(err, RouteError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn prereq_hook_wraps_value() {
        let state = State::builder("articles/:id")
            .enter_prereqs(|params: &Params| {
                let id = params.get_as::<u32>("id");
                async move { id.ok_or_else(|| anyhow::anyhow!("no id")) }
            })
            .build()
            .unwrap();

        let hook = state.hooks.enter_prereqs.clone().unwrap();
        let value = hook(&Params::from([("id", "33")])).await.unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&33));

        let err = hook(&Params::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "no id");
    }

    #[test]
    fn step_display() {
        assert_eq!(Step::Enter.to_string(), "enter");
        assert_eq!(Step::Update.to_string(), "update");
    }
}
