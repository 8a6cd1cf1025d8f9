//! Ordered around-advice pipeline wrapping handler invocation.
//!
//! The chain is a fold over an ordered list of middlewares with the handler
//! as the implicit innermost node. Each middleware may run code before and
//! after `next`, transform the context, suppress `next` entirely (recording
//! its decision via [`MessageContext::set_outcome`]), or catch errors from
//! further in. A middleware that throws is equivalent to the handler
//! throwing at that point. Global middlewares run before subscriber-local
//! ones; the list is frozen once the runtime starts, so concurrent
//! deliveries share it without locking.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::handler::{Handler, MessageContext};

/// One node of the processing pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()>;
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Invoke the remaining chain; the handler runs when no middlewares are
    /// left.
    pub fn run<'b>(self, ctx: &'b mut MessageContext) -> BoxFuture<'b, anyhow::Result<()>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((head, rest)) => {
                    head.call(
                        ctx,
                        Next {
                            middlewares: rest,
                            handler: self.handler,
                        },
                    )
                    .await
                }
                None => self.handler.handle(ctx).await,
            }
        })
    }
}

/// Run a full chain over a context.
pub async fn run_chain(
    middlewares: &[Arc<dyn Middleware>],
    handler: &dyn Handler,
    ctx: &mut MessageContext,
) -> anyhow::Result<()> {
    Next { middlewares, handler }.run(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EnvelopeOptions};
    use crate::handler::{handler_fn, Outcome};
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn call(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            let result = next.run(ctx).await;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn call(&self, ctx: &mut MessageContext, _next: Next<'_>) -> anyhow::Result<()> {
            ctx.set_outcome(Outcome::Ack);
            Ok(())
        }
    }

    fn test_ctx() -> MessageContext {
        MessageContext::new(
            Envelope::build(json!({}), EnvelopeOptions::default()),
            "test.app.topic",
        )
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder { name: "outer", log: log.clone() }),
            Arc::new(Recorder { name: "inner", log: log.clone() }),
        ];
        let log_handler = log.clone();
        let handler = handler_fn(move |_| {
            let log = log_handler.clone();
            async move {
                log.lock().unwrap().push("handler".to_string());
                Ok(())
            }
        });

        run_chain(&chain, &handler, &mut test_ctx()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["outer:before", "inner:before", "handler", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ShortCircuit),
            Arc::new(Recorder { name: "never", log: log.clone() }),
        ];
        let handler = handler_fn(|_| async { panic!("handler must not run") });

        let mut ctx = test_ctx();
        run_chain(&chain, &handler, &mut ctx).await.unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(ctx.take_outcome(), Some(Outcome::Ack));
    }

    #[tokio::test]
    async fn middleware_error_propagates_like_handler_error() {
        struct Thrower;

        #[async_trait]
        impl Middleware for Thrower {
            async fn call(&self, _ctx: &mut MessageContext, _next: Next<'_>) -> anyhow::Result<()> {
                anyhow::bail!("middleware exploded")
            }
        }

        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Thrower)];
        let handler = handler_fn(|_| async { Ok(()) });
        let err = run_chain(&chain, &handler, &mut test_ctx()).await.unwrap_err();
        assert!(err.to_string().contains("middleware exploded"));
    }

    #[tokio::test]
    async fn middleware_can_catch_handler_error() {
        struct Catcher;

        #[async_trait]
        impl Middleware for Catcher {
            async fn call(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
                if next.run(ctx).await.is_err() {
                    ctx.set_outcome(Outcome::DeadLetter { reason: "caught".into() });
                }
                Ok(())
            }
        }

        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Catcher)];
        let handler = handler_fn(|_| async { anyhow::bail!("boom") });

        let mut ctx = test_ctx();
        run_chain(&chain, &handler, &mut ctx).await.unwrap();
        assert!(matches!(ctx.take_outcome(), Some(Outcome::DeadLetter { .. })));
    }
}
