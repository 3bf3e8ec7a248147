pub mod ingest;
pub mod notify;
pub mod route;

pub use butlerhub_core::{ButlerError, ErrorEnvelope, RequestId};
pub use ingest::{IngestControl, IngestEvent, IngestPayload, IngestResponseV1, IngestSender, IngestSource, IngestV1};
pub use notify::{DeliveryChannel, DeliveryIntent, DeliveryRequest, DeliveryResult, NotifyResponseV1, NotifyV1};
pub use route::{RequestContext, RouteInput, RouteResponseV1, RouteTarget, RouteV1};
