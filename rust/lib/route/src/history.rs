use std::sync::{PoisonError, RwLock};

/// Where committed URLs go.
///
/// The router calls `push` after every committed transition except the
/// first one and those triggered by [`crate::Router::handle_pop`]. Pops flow
/// the other way: the embedder reports them with `Router::handle_pop(url)`.
pub trait HistorySink: Send + Sync {
    fn push(&self, url: &str);
}

/// In-memory history stack, for tests and headless embedding.
///
/// ```ignore
/// let history = Arc::new(MemoryHistory::new("/blog"));
/// // ... router pushes "/blog/articles/1" ...
/// if let Some(url) = history.back() {
///     router.handle_pop(&url)?;
/// }
/// ```
pub struct MemoryHistory {
    inner: RwLock<Stack>,
}

struct Stack {
    entries: Vec<String>,
    index: usize,
}

impl MemoryHistory {
    /// Create a history whose only entry is `initial`.
    pub fn new(initial: &str) -> Self {
        Self {
            inner: RwLock::new(Stack {
                entries: vec![initial.to_string()],
                index: 0,
            }),
        }
    }

    /// URL at the current position.
    pub fn location(&self) -> String {
        let stack = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        stack.entries[stack.index].clone()
    }

    /// All entries, oldest first (including forward entries).
    pub fn entries(&self) -> Vec<String> {
        let stack = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        stack.entries.clone()
    }

    /// Move one entry back and return the URL to hand to `handle_pop`.
    pub fn back(&self) -> Option<String> {
        let mut stack = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if stack.index == 0 {
            return None;
        }
        stack.index -= 1;
        Some(stack.entries[stack.index].clone())
    }

    /// Move one entry forward, if any.
    pub fn forward(&self) -> Option<String> {
        let mut stack = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if stack.index + 1 >= stack.entries.len() {
            return None;
        }
        stack.index += 1;
        Some(stack.entries[stack.index].clone())
    }
}

impl HistorySink for MemoryHistory {
    /// Push drops any forward entries, like a browser does.
    fn push(&self, url: &str) {
        let mut stack = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let keep = stack.index + 1;
        stack.entries.truncate(keep);
        stack.entries.push(url.to_string());
        stack.index = keep;
    }
}
