//! Outbound webhook delivery: signing, retry with backoff, the observability
//! forwarder, per-execution callbacks and the dead-letter store.

pub mod backoff;
pub mod dead_letter;
pub mod execution_webhooks;
pub mod forwarder;
pub mod normalize;
pub mod retry;
pub mod signer;
pub mod transport;

pub use backoff::RetryPolicy;
pub use dead_letter::DeadLetterManager;
pub use execution_webhooks::ExecutionWebhookDispatcher;
pub use forwarder::ObservabilityForwarder;
pub use retry::{DeliveryOutcome, DeliveryPool, DeliveryReport, DeliveryState, WebhookDelivery};
pub use signer::{SIGNATURE_HEADER, sign, verify};
pub use transport::{HttpTransport, WebhookRequest, WebhookTransport};
