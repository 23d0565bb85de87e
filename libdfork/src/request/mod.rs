//! Asynchronous request state machines
//!
//! Submodules:
//! - `set_dirty`, `check_dirty`, `unblock`: single round-trip dirty-bit calls
//! - `reset_dirty`: multi-step drain of the dirty location set
//! - `switch`: fork mode toggle for one image or the whole pool
//! - `remove`: image teardown through the bulk throttle
//! - `transfer`: ownership handoff of every materialized object
//!
//! Each request owns its inputs and describes its progress with an explicit
//! state enum. [`RequestExecutor`] drives a request by calling
//! [`Request::step`] until it returns [`Step::Complete`], then consumes the
//! request through [`Request::finish`]. Every state issues at most one
//! outstanding remote operation.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cls;
use crate::error::{DforkError, Result, result_code};
use crate::identity::ImageIdentity;
use crate::locator;
use crate::store::{ObjectOperation, ObjectStore};

pub mod check_dirty;
pub mod remove;
pub mod reset_dirty;
pub mod set_dirty;
pub mod switch;
pub mod transfer;
pub mod unblock;

pub use check_dirty::CheckDirtyRequest;
pub use remove::RemoveRequest;
pub use reset_dirty::ResetDirtyRequest;
pub use set_dirty::SetDirtyRequest;
pub use switch::{SwitchRequest, SwitchTarget};
pub use transfer::TransferRequest;
pub use unblock::UnblockDirtyRequest;

/// Outcome of one state.
#[derive(Debug)]
pub enum Step<S> {
    Next(S),
    Complete(Result<()>),
}

impl<S> Step<S> {
    /// Advances to `next` on success, completes with the error otherwise.
    pub fn then(result: Result<()>, next: S) -> Self {
        match result {
            Ok(()) => Step::Next(next),
            Err(e) => Step::Complete(Err(e)),
        }
    }
}

#[async_trait]
pub trait Request: Send + 'static {
    type State: Debug + Send;
    type Output: Send + 'static;

    /// Short name used in logs.
    const KIND: &'static str;

    fn initial_state(&self) -> Self::State;

    async fn step(&mut self, state: Self::State) -> Step<Self::State>;

    /// Turns the terminal result into the caller's output.
    fn finish(self, result: Result<()>) -> Result<Self::Output>;
}

/// Handle to a request running on the executor.
pub struct RequestHandle {
    id: u64,
    join: JoinHandle<()>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits until the completion callback has run.
    pub async fn wait(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| DforkError::Task(format!("request {}: {e}", self.id)))
    }
}

#[derive(Clone, Default)]
pub struct RequestExecutor {
    next_id: Arc<AtomicU64>,
}

impl RequestExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Starts `req` on the runtime and returns at once. `on_finish` runs
    /// exactly once with the request's output.
    pub fn send<R, F>(&self, req: R, on_finish: F) -> RequestHandle
    where
        R: Request,
        F: FnOnce(Result<R::Output>) + Send + 'static,
    {
        let id = self.allocate_id();
        let join = tokio::spawn(async move {
            let result = drive(id, req).await;
            on_finish(result);
        });
        RequestHandle { id, join }
    }

    /// Drives `req` on the current task.
    pub async fn execute<R: Request>(&self, req: R) -> Result<R::Output> {
        drive(self.allocate_id(), req).await
    }
}

async fn drive<R: Request>(id: u64, mut req: R) -> Result<R::Output> {
    let mut state = req.initial_state();
    debug!(request = id, kind = R::KIND, state = ?state, "request started");
    loop {
        match req.step(state).await {
            Step::Next(next) => {
                debug!(request = id, kind = R::KIND, state = ?next, "state transition");
                state = next;
            }
            Step::Complete(result) => {
                let r = result_code(&result);
                if r < 0 && r != -libc::ENOENT {
                    warn!(request = id, kind = R::KIND, r, "request failed");
                } else {
                    debug!(request = id, kind = R::KIND, r, "request complete");
                }
                return req.finish(result);
            }
        }
    }
}

/// Looks up the id of an image addressed by name. Already resolved
/// identities are left untouched.
pub async fn resolve_id(store: &dyn ObjectStore, image: &mut ImageIdentity) -> Result<()> {
    if image.is_resolved() {
        return Ok(());
    }
    let mut op = ObjectOperation::new();
    cls::get_id_start(&mut op);
    let out = store
        .read(&locator::id_object_name(image.name()), op)
        .await?;
    let id = cls::get_id_finish(&out)?;
    debug!(image = image.name(), id = %id, "resolved image id");
    image.resolve(id);
    Ok(())
}

/// Keeps the first error of a best-effort sequence.
pub(crate) fn record_error(first: &mut Option<DforkError>, result: Result<()>) {
    if first.is_none() {
        *first = result.err();
    }
}
