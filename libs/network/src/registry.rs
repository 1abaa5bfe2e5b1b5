//! Message handler registry
//!
//! Maps an application message type to the handler invoked by workers. The
//! registry is filled before a daemon starts and shared read-only afterwards.

use crate::error::{Result, TransportError};
use linkmq_codec::{Frame, TYPE_MAX};
use std::fmt;
use std::sync::Arc;

/// Handler for one application message type
///
/// Runs on a shared worker thread; implementations must not block for long.
/// Returning an error counts the frame as failed, nothing more.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg_type: u16, node_id: u32, payload: &[u8]) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(u16, u32, &[u8]) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, msg_type: u16, node_id: u32, payload: &[u8]) -> anyhow::Result<()> {
        self(msg_type, node_id, payload)
    }
}

/// Result of dispatching one frame
#[derive(Debug)]
pub enum Dispatch {
    Handled,
    /// No handler for the type and no default handler
    Unregistered,
    Failed(anyhow::Error),
}

/// Type-indexed handler table
pub struct HandlerRegistry {
    handlers: Vec<Option<Arc<dyn MessageHandler>>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: vec![None; TYPE_MAX as usize],
            fallback: None,
        }
    }

    /// Register `handler` for `msg_type`
    ///
    /// Fails when the type is outside `0..TYPE_MAX` or already taken.
    pub fn register<H>(&mut self, msg_type: u16, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        let slot = self.handlers.get_mut(msg_type as usize).ok_or_else(|| {
            TransportError::registry(msg_type, format!("type must be below {}", TYPE_MAX))
        })?;
        if slot.is_some() {
            return Err(TransportError::registry(msg_type, "already registered"));
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    /// Handler for types nobody registered
    pub fn register_default<H>(&mut self, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        if self.fallback.is_some() {
            return Err(TransportError::registry(
                TYPE_MAX,
                "default handler already registered",
            ));
        }
        self.fallback = Some(Arc::new(handler));
        Ok(())
    }

    /// Explicitly registered types
    pub fn registered_count(&self) -> usize {
        self.handlers.iter().filter(|h| h.is_some()).count()
    }

    pub fn dispatch(&self, frame: &Frame) -> Dispatch {
        let msg_type = frame.msg_type();
        let handler = self
            .handlers
            .get(msg_type as usize)
            .and_then(Option::as_ref)
            .or(self.fallback.as_ref());

        match handler {
            Some(h) => match h.handle(msg_type, frame.node_id(), frame.payload()) {
                Ok(()) => Dispatch::Handled,
                Err(e) => Dispatch::Failed(e),
            },
            None => Dispatch::Unregistered,
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered", &self.registered_count())
            .field("has_default", &self.fallback.is_some())
            .finish()
    }
}
