use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::error::RouteError;
use crate::state::{validate_name, Hooks, State};
use crate::template::{PathTemplate, Route};
use crate::value::StateValue;

/// Stable identity of a state inside an initialized [`StateTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) usize);

pub(crate) struct StateNode {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) template: PathTemplate,
    pub(crate) parent: Option<StateId>,
    pub(crate) children: Vec<StateId>,
    /// Closest first.
    pub(crate) ancestors: Vec<StateId>,
    /// Accumulated route from the tree root down to this node.
    pub(crate) route: Route,
    pub(crate) hooks: Hooks,
    data: RwLock<HashMap<String, StateValue>>,
}

/// The hierarchy of states.
///
/// States are added with [`StateTree::add_state`] and the tree is frozen by
/// [`StateTree::init`], which derives full names, full paths, ancestor chains
/// and the leaf map, and rejects leaves whose paths overlap. After `init` the
/// structure never changes; only new data keys can be attached.
pub struct StateTree {
    pending: Vec<(String, State)>,
    nodes: Vec<StateNode>,
    roots: Vec<StateId>,
    by_name: HashMap<String, StateId>,
    leaves: BTreeMap<String, StateId>,
    frozen: bool,
}

impl StateTree {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            nodes: Vec::new(),
            roots: Vec::new(),
            by_name: HashMap::new(),
            leaves: BTreeMap::new(),
            frozen: false,
        }
    }

    /// Add a root state. Fails after `init` or when `name` is taken.
    pub fn add_state(&mut self, name: &str, state: State) -> Result<(), RouteError> {
        if self.frozen {
            return Err(RouteError::TreeFrozen);
        }
        validate_name(name)?;
        if self.pending.iter().any(|(n, _)| n == name) {
            return Err(RouteError::DuplicateState(name.to_string()));
        }
        self.pending.push((name.to_string(), state));
        Ok(())
    }

    /// Freeze the tree. Runs exactly once.
    pub fn init(&mut self) -> Result<(), RouteError> {
        if self.frozen {
            return Err(RouteError::TreeFrozen);
        }

        for (name, state) in std::mem::take(&mut self.pending) {
            let id = self.attach(name, state, None)?;
            self.roots.push(id);
        }

        let mut shapes: HashMap<String, StateId> = HashMap::new();
        for &id in self.leaves.values() {
            let node = &self.nodes[id.0];
            if let Some(other) = shapes.insert(node.route.shape(), id) {
                return Err(RouteError::AmbiguousPath {
                    first: self.nodes[other.0].full_name.clone(),
                    second: node.full_name.clone(),
                    path: node.route.path(),
                });
            }
        }

        self.frozen = true;
        Ok(())
    }

    fn attach(
        &mut self,
        name: String,
        state: State,
        parent: Option<StateId>,
    ) -> Result<StateId, RouteError> {
        let id = StateId(self.nodes.len());
        let (full_name, ancestors, mut route) = match parent {
            Some(p) => {
                let pn = &self.nodes[p.0];
                let mut ancestors = vec![p];
                ancestors.extend_from_slice(&pn.ancestors);
                (format!("{}.{name}", pn.full_name), ancestors, pn.route.clone())
            }
            None => (name.clone(), Vec::new(), Route::default()),
        };

        let inherited: Vec<&str> = route
            .params()
            .chain(route.query.iter().map(String::as_str))
            .collect();
        let own = state
            .template
            .params()
            .chain(state.template.query.iter().map(String::as_str));
        for param in own {
            if inherited.contains(&param) {
                return Err(RouteError::DuplicateParam {
                    state: full_name,
                    param: param.to_string(),
                });
            }
        }

        route.segments.extend(state.template.segments.iter().cloned());
        route.query.extend(state.template.query.iter().cloned());
        route.validate().map_err(|reason| RouteError::InvalidPath {
            template: state.raw.clone(),
            reason,
        })?;

        self.nodes.push(StateNode {
            name,
            full_name: full_name.clone(),
            template: state.template,
            parent,
            children: Vec::new(),
            ancestors,
            route,
            hooks: state.hooks,
            data: RwLock::new(state.data),
        });

        for (child_name, child) in state.children {
            let child_id = self.attach(child_name, child, Some(id))?;
            self.nodes[id.0].children.push(child_id);
        }

        if self.nodes[id.0].children.is_empty() {
            self.leaves.insert(full_name.clone(), id);
        }
        self.by_name.insert(full_name, id);
        Ok(id)
    }

    pub fn is_initialized(&self) -> bool {
        self.frozen
    }

    /// Number of states (after `init`).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up any state by dotted full name.
    pub fn find(&self, full_name: &str) -> Option<StateId> {
        self.by_name.get(full_name).copied()
    }

    /// Look up a leaf state by dotted full name.
    pub fn leaf(&self, full_name: &str) -> Option<StateId> {
        self.leaves.get(full_name).copied()
    }

    /// Leaf states, ordered by full name.
    pub fn leaves(&self) -> impl Iterator<Item = (&str, StateId)> {
        self.leaves.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn roots(&self) -> &[StateId] {
        &self.roots
    }

    pub fn state(&self, id: StateId) -> Option<StateView<'_>> {
        (id.0 < self.nodes.len()).then(|| StateView::new(self, id))
    }

    pub fn parent(&self, id: StateId) -> Option<StateId> {
        self.nodes.get(id.0).and_then(|n| n.parent)
    }

    /// Ancestors of `id`, closest first.
    pub fn ancestors(&self, id: StateId) -> &[StateId] {
        self.nodes
            .get(id.0)
            .map(|n| n.ancestors.as_slice())
            .unwrap_or_default()
    }

    /// `id` followed by its ancestors, closest first.
    pub fn chain(&self, id: StateId) -> Vec<StateId> {
        let mut chain = vec![id];
        chain.extend_from_slice(self.ancestors(id));
        chain
    }

    pub fn is_leaf(&self, id: StateId) -> bool {
        self.nodes.get(id.0).is_some_and(|n| n.children.is_empty())
    }

    /// Full route (every ancestor's segments and query params) of `id`.
    pub fn route(&self, id: StateId) -> Option<&Route> {
        self.nodes.get(id.0).map(|n| &n.route)
    }

    /// Read a data entry, falling back to the closest ancestor that has it.
    pub fn data(&self, id: StateId, key: &str) -> Option<StateValue> {
        if id.0 >= self.nodes.len() {
            return None;
        }
        self.chain(id).into_iter().find_map(|sid| {
            self.nodes[sid.0]
                .data
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
        })
    }

    /// Attach a new data entry to an initialized state.
    ///
    /// A key can be set once; setting it again is an error. A key that only
    /// exists on an ancestor can still be shadowed.
    pub fn set_data<T>(&self, id: StateId, key: &str, value: T) -> Result<(), RouteError>
    where
        T: std::any::Any + Send + Sync,
    {
        if !self.frozen {
            return Err(RouteError::NotInitialized);
        }
        let node = self
            .nodes
            .get(id.0)
            .ok_or_else(|| RouteError::StateNotFound(format!("#{}", id.0)))?;
        let mut data = node.data.write().unwrap_or_else(PoisonError::into_inner);
        if data.contains_key(key) {
            return Err(RouteError::DataKeyExists {
                state: node.full_name.clone(),
                key: key.to_string(),
            });
        }
        data.insert(key.to_string(), StateValue::new(value));
        Ok(())
    }

    pub(crate) fn node(&self, id: StateId) -> &StateNode {
        &self.nodes[id.0]
    }

    pub(crate) fn full_name(&self, id: StateId) -> &str {
        &self.nodes[id.0].full_name
    }
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("initialized", &self.frozen)
            .field("states", &self.by_name.len())
            .field("leaves", &self.leaves.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Read-only view of one state in an initialized tree.
#[derive(Clone, Copy)]
pub struct StateView<'a> {
    tree: &'a StateTree,
    id: StateId,
}

impl<'a> StateView<'a> {
    pub(crate) fn new(tree: &'a StateTree, id: StateId) -> Self {
        Self { tree, id }
    }

    fn node(&self) -> &'a StateNode {
        self.tree.node(self.id)
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    /// Name among siblings.
    pub fn name(&self) -> &'a str {
        &self.node().name
    }

    /// Dotted name from the root, e.g. `blog.articles.edit`.
    pub fn full_name(&self) -> &'a str {
        &self.node().full_name
    }

    /// `/`-joined template from the root, e.g. `/blog/articles/:id/edit`.
    pub fn full_path(&self) -> String {
        self.node().route.path()
    }

    pub fn template(&self) -> &'a PathTemplate {
        &self.node().template
    }

    /// Path params declared by this state itself.
    pub fn own_params(&self) -> Vec<&'a str> {
        self.node().template.params().collect()
    }

    /// Query params declared by this state itself.
    pub fn own_query_params(&self) -> &'a [String] {
        &self.node().template.query
    }

    pub fn parent(&self) -> Option<StateView<'a>> {
        self.node().parent.map(|p| StateView::new(self.tree, p))
    }

    pub fn children(&self) -> Vec<StateView<'a>> {
        self.node()
            .children
            .iter()
            .map(|&c| StateView::new(self.tree, c))
            .collect()
    }

    pub fn is_leaf(&self) -> bool {
        self.node().children.is_empty()
    }

    pub fn data(&self, key: &str) -> Option<StateValue> {
        self.tree.data(self.id, key)
    }
}

impl fmt::Debug for StateView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateView")
            .field("id", &self.id)
            .field("full_name", &self.full_name())
            .finish()
    }
}
