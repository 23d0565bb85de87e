use std::sync::Arc;

use async_trait::async_trait;

use crate::cls;
use crate::error::Result;
use crate::identity::ImageIdentity;
use crate::protocol::DirtyProtocol;
use crate::request::{Request, Step, resolve_id};
use crate::store::{ObjectOperation, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockState {
    ResolveId,
    Unblock,
}

/// Lifts the write block armed by a blocking dirty check.
pub struct UnblockDirtyRequest {
    store: Arc<dyn ObjectStore>,
    protocol: DirtyProtocol,
    image: ImageIdentity,
}

impl UnblockDirtyRequest {
    pub fn new(store: Arc<dyn ObjectStore>, protocol: DirtyProtocol, image: ImageIdentity) -> Self {
        Self {
            store,
            protocol,
            image,
        }
    }
}

#[async_trait]
impl Request for UnblockDirtyRequest {
    type State = UnblockState;
    type Output = ();
    const KIND: &'static str = "unblock_dirty";

    fn initial_state(&self) -> UnblockState {
        if self.image.is_resolved() {
            UnblockState::Unblock
        } else {
            UnblockState::ResolveId
        }
    }

    async fn step(&mut self, state: UnblockState) -> Step<UnblockState> {
        match state {
            UnblockState::ResolveId => Step::then(
                resolve_id(self.store.as_ref(), &mut self.image).await,
                UnblockState::Unblock,
            ),
            UnblockState::Unblock => {
                let mut op = ObjectOperation::new();
                cls::unblock_dirty(&mut op);
                let target = self.protocol.unblock_target(self.image.id());
                Step::Complete(self.store.write(&target, op).await)
            }
        }
    }

    fn finish(self, result: Result<()>) -> Result<()> {
        result
    }
}
