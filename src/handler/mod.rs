//! Handler chain pipeline.
//!
//! A [`HandlerPipeline`] holds two disjoint, ordered segments of handlers:
//! PRE runs before the main operation (publish, or nothing on the receive
//! path), POST runs after it. Pipelines are built once and shared.
//!
//! A [`HandlerChain`] is a cursor over one pipeline, created fresh for every
//! run. `start_pre`/`start_post` select a segment and rewind; `handle` runs
//! the selected segment in insertion order until it is exhausted, a handler
//! returns [`HandlerFlow::Stop`], or a handler fails.
//!
//! ```ignore
//! let pipeline = HandlerPipeline::builder()
//!     .pre(AcquireChannel)
//!     .post(DeliverToListener::new(listener))
//!     .build();
//!
//! let mut chain = HandlerChain::new(pipeline);
//! chain.start_post();
//! chain.handle(&mut ctx).await?;
//! ```

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::broker::BrokerError;
use crate::context::MessageContext;

pub use common::{
    AcquireChannel, DeliverToListener, LogMessages, MessageListener, TypeFilter, ValidateBodySize,
};

/// Errors raised by handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler '{handler}' rejected the message: {reason}")]
    Rejected { handler: String, reason: String },

    #[error("Handler '{handler}' failed: {reason}")]
    Failed { handler: String, reason: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Pipeline segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Post,
}

/// What the chain does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFlow {
    Continue,
    /// Skip the remaining handlers of the current segment.
    Stop,
}

/// One processing step of a pipeline segment.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, HandlerError>;
}

/// Immutable PRE and POST handler segments.
#[derive(Default)]
pub struct HandlerPipeline {
    pre: Vec<Arc<dyn MessageHandler>>,
    post: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerPipeline {
    pub fn builder() -> HandlerPipelineBuilder {
        HandlerPipelineBuilder::default()
    }

    /// Pipeline with no handlers in either segment.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn segment(&self, stage: Stage) -> &[Arc<dyn MessageHandler>] {
        match stage {
            Stage::Pre => &self.pre,
            Stage::Post => &self.post,
        }
    }
}

/// Builder for [`HandlerPipeline`].
#[derive(Default)]
pub struct HandlerPipelineBuilder {
    pre: Vec<Arc<dyn MessageHandler>>,
    post: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerPipelineBuilder {
    pub fn pre(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.pre.push(Arc::new(handler));
        self
    }

    pub fn pre_shared(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.pre.push(handler);
        self
    }

    pub fn post(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.post.push(Arc::new(handler));
        self
    }

    pub fn post_shared(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.post.push(handler);
        self
    }

    pub fn build(self) -> Arc<HandlerPipeline> {
        Arc::new(HandlerPipeline {
            pre: self.pre,
            post: self.post,
        })
    }
}

/// Cursor over a [`HandlerPipeline`] for a single run.
pub struct HandlerChain {
    pipeline: Arc<HandlerPipeline>,
    stage: Stage,
    cursor: usize,
}

impl HandlerChain {
    /// New chain positioned at the start of PRE.
    pub fn new(pipeline: Arc<HandlerPipeline>) -> Self {
        Self {
            pipeline,
            stage: Stage::Pre,
            cursor: 0,
        }
    }

    pub fn start_pre(&mut self) {
        self.stage = Stage::Pre;
        self.cursor = 0;
    }

    pub fn start_post(&mut self) {
        self.stage = Stage::Post;
        self.cursor = 0;
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Whether the active segment has no handlers left to run.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.pipeline.segment(self.stage).len()
    }

    /// Run the active segment from the cursor.
    ///
    /// Returns `Stop` if a handler halted the segment. After this returns the
    /// segment is exhausted; running it again requires `start_pre`/`start_post`.
    pub async fn handle(&mut self, ctx: &mut MessageContext) -> Result<HandlerFlow, HandlerError> {
        let pipeline = Arc::clone(&self.pipeline);
        let handlers = pipeline.segment(self.stage);

        while let Some(handler) = handlers.get(self.cursor) {
            self.cursor += 1;
            match handler.handle(ctx).await {
                Ok(HandlerFlow::Continue) => {}
                Ok(HandlerFlow::Stop) => {
                    debug!(
                        handler = handler.name(),
                        stage = ?self.stage,
                        "Handler stopped the chain"
                    );
                    self.cursor = handlers.len();
                    return Ok(HandlerFlow::Stop);
                }
                Err(e) => {
                    self.cursor = handlers.len();
                    return Err(e);
                }
            }
        }

        Ok(HandlerFlow::Continue)
    }
}
