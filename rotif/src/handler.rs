//! The message-handler trait a subscriber implements, mirroring the
//! teacher's `celerity_helpers::consumers::MessageHandler` shape but over a
//! single concrete `Message` type instead of a generic metadata parameter,
//! since Rotif has exactly one wire format.

use std::error::Error as StdError;

use async_trait::async_trait;

use crate::types::Message;

pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Implemented by subscribers to process a single message. Returning `Err`
/// triggers the retry engine (spec.md §4.6): the message is scheduled for
/// another attempt until `maxRetries` is exceeded, at which point it is
/// moved to the dead-letter queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self)(message.clone()).await
    }
}
