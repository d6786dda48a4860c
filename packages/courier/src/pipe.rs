//! Send pipe: ordered middleware every outgoing message passes through.
//!
//! A pipe is a chain of [`Filter`]s. Each filter receives the message's
//! [`SendContext`] and a [`Next`] handle for the rest of the chain; it may
//! adjust headers before calling `next`, observe the outcome after, or drop
//! the message by not calling `next` at all.
//!
//! ```text
//! send ─► filter 1 ─► filter 2 ─► ... ─► transport
//!            │            │
//!            └─ may stop ─┘   (message is filtered out)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut configurator = PipeConfigurator::new();
//! configurator.use_execute(|ctx| {
//!     ctx.headers.insert("tenant".into(), "acme".into());
//! });
//! configurator.use_execute_async(|ctx| {
//!     let message_id = ctx.message_id;
//!     async move {
//!         audit::record_send(message_id).await?;
//!         Ok(())
//!     }
//!     .boxed()
//! });
//! let pipe = configurator.build();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Address, TrackingNumber};
use crate::error::CourierError;

/// The JSON content type every courier message is sent with.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// =============================================================================
// Send Context
// =============================================================================

/// What an outgoing message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A routing slip on its way to an execute address.
    Execute,
    /// A routing slip on its way to a compensate address.
    Compensate,
    /// A routing slip lifecycle event.
    Event,
}

/// Headers and addressing for one outgoing message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendContext {
    pub message_id: Uuid,
    pub request_id: Option<Uuid>,
    /// Tracking number of the routing slip the message belongs to.
    pub correlation_id: Option<TrackingNumber>,
    pub source_address: Option<Address>,
    pub destination_address: Address,
    pub response_address: Option<Address>,
    pub fault_address: Option<Address>,
    /// How long the message stays valid after `sent_time`.
    pub time_to_live: Option<Duration>,
    pub sent_time: DateTime<Utc>,
    pub content_type: String,
    pub durable: bool,
    pub headers: IndexMap<String, String>,
    pub message_kind: MessageKind,
}

impl SendContext {
    pub fn new(destination_address: Address, message_kind: MessageKind) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            request_id: None,
            correlation_id: None,
            source_address: None,
            destination_address,
            response_address: None,
            fault_address: None,
            time_to_live: None,
            sent_time: Utc::now(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            durable: true,
            headers: IndexMap::new(),
            message_kind,
        }
    }

    pub fn with_correlation(mut self, tracking_number: TrackingNumber) -> Self {
        self.correlation_id = Some(tracking_number);
        self
    }

    pub fn with_source(mut self, source_address: Address) -> Self {
        self.source_address = Some(source_address);
        self
    }

    /// When the message stops being valid, if it has a time-to-live.
    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.time_to_live?).ok()?;
        self.sent_time.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time().is_some_and(|expires| now >= expires)
    }
}

// =============================================================================
// Filters
// =============================================================================

/// One stage of the send pipe.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    /// Handle the message. Call `next.send(context)` to pass it on.
    async fn send(&self, context: &mut SendContext, next: Next<'_>) -> Result<()>;
}

/// The remainder of the pipe after the current filter.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Filter>],
    delivered: &'a AtomicBool,
}

impl<'a> Next<'a> {
    pub fn send<'c>(self, context: &'c mut SendContext) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
    {
        Box::pin(async move {
            match self.remaining.split_first() {
                Some((filter, rest)) => {
                    let next = Next {
                        remaining: rest,
                        delivered: self.delivered,
                    };
                    filter.send(context, next).await
                }
                None => {
                    self.delivered.store(true, Ordering::Release);
                    Ok(())
                }
            }
        })
    }
}

/// Filter that runs a synchronous closure over the context.
struct DelegateFilter<F> {
    callback: F,
}

#[async_trait]
impl<F> Filter for DelegateFilter<F>
where
    F: Fn(&mut SendContext) + Send + Sync + 'static,
{
    async fn send(&self, context: &mut SendContext, next: Next<'_>) -> Result<()> {
        (self.callback)(context);
        next.send(context).await
    }
}

/// Filter that awaits a future built from the context before continuing.
struct AsyncDelegateFilter<F> {
    callback: F,
}

#[async_trait]
impl<F> Filter for AsyncDelegateFilter<F>
where
    F: Fn(&SendContext) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
{
    async fn send(&self, context: &mut SendContext, next: Next<'_>) -> Result<()> {
        (self.callback)(context).await?;
        next.send(context).await
    }
}

// =============================================================================
// Pipe
// =============================================================================

/// A built, immutable send pipe. Cheap to clone.
#[derive(Clone)]
pub struct Pipe {
    filters: Arc<[Arc<dyn Filter>]>,
}

impl Pipe {
    /// A pipe with no filters.
    pub fn empty() -> Self {
        Self {
            filters: Arc::from(Vec::new()),
        }
    }

    /// Run `context` through every filter.
    ///
    /// Fails with [`CourierError::SendFiltered`] if a filter stopped the
    /// message without an error of its own.
    pub async fn send(&self, context: &mut SendContext) -> Result<()> {
        let delivered = AtomicBool::new(false);
        let next = Next {
            remaining: &self.filters[..],
            delivered: &delivered,
        };
        next.send(context).await?;

        if !delivered.load(Ordering::Acquire) {
            return Err(CourierError::SendFiltered {
                address: context.destination_address.clone(),
            }
            .into());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("filter_count", &self.filters.len())
            .finish()
    }
}

/// Collects filter specifications and builds a [`Pipe`].
#[derive(Default)]
pub struct PipeConfigurator {
    filters: Vec<Arc<dyn Filter>>,
}

impl PipeConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` on every outgoing message, then continue.
    pub fn use_execute<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&mut SendContext) + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(DelegateFilter { callback }));
        self
    }

    /// Await the future `callback` returns for every outgoing message. An
    /// error stops the message and is returned to the sender.
    pub fn use_execute_async<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&SendContext) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(AsyncDelegateFilter { callback }));
        self
    }

    pub fn add_filter(&mut self, filter: Arc<dyn Filter>) -> &mut Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> Pipe {
        Pipe {
            filters: self.filters.into(),
        }
    }
}

impl std::fmt::Debug for PipeConfigurator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConfigurator")
            .field("filter_count", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::FutureExt;

    use super::*;

    fn context() -> SendContext {
        SendContext::new(
            Address::parse("loopback://localhost/execute_Test").unwrap(),
            MessageKind::Execute,
        )
    }

    struct Swallow;

    #[async_trait]
    impl Filter for Swallow {
        async fn send(&self, _context: &mut SendContext, _next: Next<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_pipe_delivers() {
        let pipe = Pipe::empty();
        let mut ctx = context();
        pipe.send(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_filters_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut configurator = PipeConfigurator::new();

        let first = order.clone();
        configurator.use_execute(move |ctx| {
            first.lock().unwrap().push("first");
            ctx.headers.insert("stage".into(), "first".into());
        });
        let second = order.clone();
        configurator.use_execute(move |ctx| {
            second.lock().unwrap().push("second");
            assert_eq!(ctx.headers.get("stage").map(String::as_str), Some("first"));
        });

        let pipe = configurator.build();
        let mut ctx = context();
        pipe.send(&mut ctx).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_filter_that_skips_next_filters_message() {
        let mut configurator = PipeConfigurator::new();
        configurator.add_filter(Arc::new(Swallow));
        let pipe = configurator.build();

        let err = pipe.send(&mut context()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CourierError>(),
            Some(CourierError::SendFiltered { .. })
        ));
    }

    #[tokio::test]
    async fn test_async_filter_error_stops_send() {
        let mut configurator = PipeConfigurator::new();
        configurator
            .use_execute_async(|_ctx| async { Err::<(), _>(anyhow::anyhow!("audit store down")) }.boxed());
        let reached = Arc::new(AtomicBool::new(false));
        let flag = reached.clone();
        configurator.use_execute(move |_ctx| flag.store(true, Ordering::SeqCst));

        let pipe = configurator.build();
        let err = pipe.send(&mut context()).await.unwrap_err();
        assert_eq!(err.to_string(), "audit store down");
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_time_to_live_expiry() {
        let mut ctx = context();
        assert!(!ctx.is_expired(Utc::now()));

        ctx.time_to_live = Some(Duration::from_millis(50));
        assert!(!ctx.is_expired(ctx.sent_time));
        assert!(ctx.is_expired(ctx.sent_time + chrono::Duration::milliseconds(50)));
    }
}
