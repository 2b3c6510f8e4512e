//! Middleware applied to every letter before the handler runs.

use crate::Letter;

/// A transform or guard run over each [`Letter`] ahead of the subscription
/// handler.
///
/// Stages run in the order they were registered. A stage may mutate the
/// letter's handling state (for example nack it) and decide whether dispatch
/// continues.
///
/// ## Example
///
/// ```rust
/// use letterbox::{Flow, Letter, Middleware};
///
/// /// Drops messages that have already been redelivered once.
/// struct DiscardRedelivered;
///
/// #[async_trait::async_trait]
/// impl Middleware for DiscardRedelivered {
///     async fn handle(&self, letter: &mut Letter) -> Flow {
///         if letter.redelivered() {
///             letter.nack(false).await;
///             return Flow::Halt;
///         }
///         Flow::Continue
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, letter: &mut Letter) -> Flow;
}

/// Outcome of one middleware stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the remaining stages and the handler.
    Continue,
    /// Skip the remaining stages and the handler. The halting stage is
    /// expected to have settled the letter itself.
    Halt,
}
