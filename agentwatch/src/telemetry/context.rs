//! Ambient "current span" propagation.
//!
//! Async calls carry their link in a Tokio task-local, so concurrent
//! invocations of the same traced function each see only their own parent.
//! Synchronous calls use a thread-local slot that is restored when the
//! scope exits (including by unwinding); a sync scope cannot span an await,
//! so the slot never outlives the poll that installed it.
//!
//! The innermost scope always wins. A sync link is only visible until the
//! next async scope is polled: `with_link` hides the thread-local slot for
//! the duration of each poll, so a runtime driven from inside a sync call
//! parents its spans on their async ancestors.

use std::cell::RefCell;
use std::future::{poll_fn, Future};
use std::pin::pin;

/// Causal link handed from a parent call to its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanLink {
    pub trace_id: String,
    /// None for a bare workflow scope that has no enclosing span
    pub span_id: Option<String>,
    pub node_name: Option<String>,
    pub workflow_id: Option<String>,
}

impl SpanLink {
    /// A root link for a workflow scope: fresh trace, no parent span.
    pub fn for_workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: None,
            node_name: None,
            workflow_id: Some(workflow_id.into()),
        }
    }
}

tokio::task_local! {
    static TASK_LINK: SpanLink;
}

thread_local! {
    static SYNC_LINK: RefCell<Option<SpanLink>> = const { RefCell::new(None) };
}

/// The innermost link visible to the calling execution unit, if any.
pub fn current_link() -> Option<SpanLink> {
    let sync = SYNC_LINK.with(|slot| slot.borrow().clone());
    sync.or_else(|| TASK_LINK.try_with(|link| link.clone()).ok())
}

/// Run a future with `link` as its ambient parent.
pub async fn with_link<F: Future>(link: SpanLink, fut: F) -> F::Output {
    let mut scoped = pin!(TASK_LINK.scope(link, fut));
    poll_fn(|cx| {
        let outer = SYNC_LINK.with(|slot| slot.borrow_mut().take());
        let _restore = RestoreSyncLink(Some(outer));
        scoped.as_mut().poll(cx)
    })
    .await
}

/// Run a closure with `link` as its ambient parent on this thread.
pub fn with_sync_link<R>(link: SpanLink, f: impl FnOnce() -> R) -> R {
    let previous = SYNC_LINK.with(|slot| slot.borrow_mut().replace(link));
    let _restore = RestoreSyncLink(Some(previous));
    f()
}

struct RestoreSyncLink(Option<Option<SpanLink>>);

impl Drop for RestoreSyncLink {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            SYNC_LINK.with(|slot| *slot.borrow_mut() = previous);
        }
    }
}
