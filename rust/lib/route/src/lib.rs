//! Route: hierarchical state router.
//!
//! Maps URL path/query strings to a tree of named states and moves the
//! application between them with ordered exit/enter callbacks.
//!
//! # Building Blocks
//!
//! - `State`: one node, with its path template, callbacks and data
//! - `StateTree`: the hierarchy; `init` freezes it and derives full names,
//!   full paths and the leaf map
//! - `PathMatcher`: path/query to leaf and back (`TrieMatcher` by default)
//! - `Router`: resolves targets and runs transitions
//!
//! # Transitions
//!
//! Only leaf states are targets. Going from `blog.articles.show` to
//! `blog.articles.edit` exits `show` and enters `edit`; `blog.articles`
//! stays put unless one of its own params changed, in which case it is
//! exited and re-entered too. Prerequisites of every state involved are
//! awaited concurrently before any callback runs. A newer request cancels
//! the running one and starts from wherever it got to.
//!
//! # Templates
//!
//! - Static: `articles`
//! - Param: `articles/:id`
//! - Splat: `files/:path*` (rest of the path, possibly empty)
//! - Query: `articles?filter&sort`
//! - Pathless: `""` contributes nothing to the URL
//!
//! # Example
//!
//! ```ignore
//! use openerp_route::{Params, Router, State, StateTree};
//!
//! let mut tree = StateTree::new();
//! tree.add_state(
//!     "blog",
//!     State::builder("blog?filter")
//!         .child(
//!             "articles",
//!             State::builder("articles/:id")
//!                 .enter_prereqs(|params| {
//!                     let id = params.get("id").unwrap_or_default().to_string();
//!                     async move { load_article(&id).await }
//!                 })
//!                 .enter(|ctx| render(ctx.prereq::<Article>()))
//!                 .build()?,
//!         )
//!         .build()?,
//! )?;
//!
//! let router = Router::builder(tree).init("/blog/articles/33", Params::new())?;
//! router.settled().await;
//! router.transition_to("blog.articles", Params::from([("id", "34")]))?;
//! ```

pub mod config;
pub mod error;
pub mod history;
pub mod matcher;
pub mod params;
pub mod router;
pub mod signals;
pub mod state;
pub mod template;
pub mod transition;
pub mod tree;
pub mod value;

// Re-export primary types at crate root.
pub use config::{RouterConfig, UrlSync};
pub use error::{RouteError, TransitionError};
pub use history::{HistorySink, MemoryHistory};
pub use matcher::{PathMatcher, RouteMatch, TrieMatcher};
pub use params::{Params, ParamsDiff};
pub use router::{Router, RouterBuilder, StateSnapshot};
pub use signals::{Endpoint, EventHandler, EventKind, RouterEvent};
pub use state::{PrereqFuture, PrereqHook, State, StateBuilder, Step, StepContext, StepHook};
pub use template::{PathTemplate, Route, Segment};
pub use transition::{Plan, TransitionHandle, TransitionOutcome};
pub use tree::{StateId, StateTree, StateView};
pub use value::{Accumulator, StateValue, SubscriptionId};
