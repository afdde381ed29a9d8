/// The key under which a Rotif context ID (correlation ID) is stashed on a
/// span when a message carries one in its trace context. Useful for tracing
/// a message from publish through retries to its terminal outcome.
pub const ROTIF_CONTEXT_ID_KEY: &str = "rotif.context-id";
