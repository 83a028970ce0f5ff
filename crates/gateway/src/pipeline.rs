use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::aggregator::AggregatedResponse;
use crate::audit::AuditScope;
use crate::error::GatewayError;

/// The unit of work flowing through the pipeline. Layers may rewrite it before
/// passing it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub input: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub session_id: String,
    pub response: AggregatedResponse,
}

/// Per-call state shared by every layer.
pub struct CallContext {
    request_id: String,
    cancel: CancellationToken,
    admitted: AtomicBool,
    audit: OnceLock<AuditScope>,
}

impl CallContext {
    pub fn new(request_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            request_id: request_id.into(),
            cancel,
            admitted: AtomicBool::new(false),
            audit: OnceLock::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Marks the call as admitted to the core handler. The first admission
    /// writes the audit start record.
    pub fn admit(&self, call: &Call) {
        if self.admitted.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(scope) = self.audit.get() {
            scope.started(call.session_id.as_deref(), &call.input);
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.admitted.load(Ordering::SeqCst)
    }

    pub fn attach_audit(&self, scope: AuditScope) -> bool {
        self.audit.set(scope).is_ok()
    }

    pub fn audit_scope(&self) -> Option<&AuditScope> {
        self.audit.get()
    }
}

/// The innermost step of the pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, call: Call, ctx: &CallContext) -> Result<Reply, GatewayError>;
}

/// A layer wrapping everything registered after it.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        call: Call,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<Reply, GatewayError>;
}

/// The remainder of the pipeline from the point of view of one layer.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub fn run(
        self,
        call: Call,
        ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<Reply, GatewayError>> {
        match self.layers.split_first() {
            Some((layer, rest)) => layer.handle(
                call,
                ctx,
                Next {
                    layers: rest,
                    handler: self.handler,
                },
            ),
            None => {
                let handler = self.handler;
                Box::pin(async move {
                    ctx.admit(&call);
                    handler.call(call, ctx).await
                })
            }
        }
    }
}

/// Ordered layers around a core handler. The first registered layer is the
/// outermost one.
#[derive(Clone)]
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn builder(handler: Arc<dyn Handler>) -> PipelineBuilder {
        PipelineBuilder {
            layers: Vec::new(),
            handler,
        }
    }

    /// Layer names from outermost to innermost.
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    pub async fn run(&self, call: Call, ctx: &CallContext) -> Result<Reply, GatewayError> {
        Next {
            layers: &self.layers,
            handler: self.handler.as_ref(),
        }
        .run(call, ctx)
        .await
    }
}

pub struct PipelineBuilder {
    layers: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
}

impl PipelineBuilder {
    pub fn layer(mut self, layer: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            layers: self.layers,
            handler: self.handler,
        }
    }
}
