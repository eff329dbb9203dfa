//! Error types for the Pulsarcast protocol.
//!
//! Fallible public APIs return `anyhow::Result`; the variants below are the
//! typed failures callers can downcast to. Each variant maps to one of the
//! protocol's failure categories:
//!
//! | Variant | Category |
//! |---------|----------|
//! | `Validation` | Malformed or non-conforming record/message |
//! | `NotFound` | Content store has no value for a referenced CID |
//! | `Connection` | Dial/send to a peer failed after bounded retries |
//! | `NotStarted` / `AlreadyStarted` | Lifecycle precondition violated |
//! | `RootCannotLeave` | Topic author tried to unsubscribe its own topic |
//! | `NoRouteToAuthor` | No peer in the routing view to join through |

use thiserror::Error;

use crate::dag::Cid;
use crate::identity::Identity;

/// Typed failures surfaced by the Pulsarcast node.
///
/// An unauthorized publish is deliberately NOT an error: it transitions the
/// event into the request-to-publish flow and the caller gets back an
/// unpublished [`EventNode`](crate::dag::EventNode) with no CID.
#[derive(Error, Debug)]
pub enum PulsarcastError {
    /// A record or inbound message failed validation. Inbound messages that
    /// hit this are dropped and logged; the connection stays up.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The content store has no value under the given key.
    #[error("no record found for {0}")]
    NotFound(Cid),

    /// A peer could not be reached after the configured number of attempts.
    #[error("connection to {peer:?} failed after {attempts} attempts")]
    Connection { peer: Identity, attempts: usize },

    /// An operation was attempted before `start()`.
    #[error("node is not started")]
    NotStarted,

    /// `start()` was called on a node that is already running.
    #[error("node is already started")]
    AlreadyStarted,

    /// The topic author cannot leave its own dissemination tree.
    #[error("topic root cannot unsubscribe from its own topic {0}")]
    RootCannotLeave(Cid),

    /// The local routing view has no peer to route a join through.
    #[error("no known peer to reach the author of topic {0}")]
    NoRouteToAuthor(Cid),
}
