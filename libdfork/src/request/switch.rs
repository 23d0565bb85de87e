use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cls;
use crate::error::{DforkError, Result};
use crate::identity::ImageIdentity;
use crate::locator::{self, ALL_IMAGES_ID};
use crate::request::{Request, Step, resolve_id};
use crate::store::{ObjectOperation, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchTarget {
    Image(ImageIdentity),
    /// Every image of the pool. Only switching off is supported.
    All,
}

impl fmt::Display for SwitchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchTarget::Image(image) => write!(f, "{image}"),
            SwitchTarget::All => f.write_str("all images"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    ResolveId,
    Switch,
}

/// Turns fork mode of an image on or off. `is_child` marks the image as a
/// fork child, whose writes are never dirty-tracked.
pub struct SwitchRequest {
    store: Arc<dyn ObjectStore>,
    target: SwitchTarget,
    on: bool,
    is_child: bool,
}

impl SwitchRequest {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        target: SwitchTarget,
        on: bool,
        is_child: bool,
    ) -> Result<Self> {
        if on && target == SwitchTarget::All {
            return Err(DforkError::NotSupported(
                "switching on dfork mode for all images".into(),
            ));
        }
        Ok(Self {
            store,
            target,
            on,
            is_child,
        })
    }

    async fn switch(&mut self) -> Result<()> {
        let (image_id, all) = match &self.target {
            SwitchTarget::Image(image) => (image.id(), false),
            SwitchTarget::All => (ALL_IMAGES_ID, true),
        };
        let mut op = ObjectOperation::new();
        cls::dfork_switch(&mut op, self.on, all, self.is_child)?;
        self.store
            .write(&locator::header_object_name(image_id), op)
            .await
    }
}

#[async_trait]
impl Request for SwitchRequest {
    type State = SwitchState;
    type Output = ();
    const KIND: &'static str = "switch";

    fn initial_state(&self) -> SwitchState {
        match &self.target {
            SwitchTarget::Image(image) if !image.is_resolved() => SwitchState::ResolveId,
            _ => SwitchState::Switch,
        }
    }

    async fn step(&mut self, state: SwitchState) -> Step<SwitchState> {
        match state {
            SwitchState::ResolveId => {
                let r = match &mut self.target {
                    SwitchTarget::Image(image) => resolve_id(self.store.as_ref(), image).await,
                    SwitchTarget::All => Ok(()),
                };
                Step::then(r, SwitchState::Switch)
            }
            SwitchState::Switch => Step::Complete(self.switch().await),
        }
    }

    fn finish(self, result: Result<()>) -> Result<()> {
        result
    }
}
