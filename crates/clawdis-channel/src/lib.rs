//! Channel abstraction for the Clawdis dispatch core.
//!
//! Defines the normalized envelope, the adapter contract every surface
//! implements, the allow/policy gate, pairing, and the outbound delivery
//! pipeline. Adapters never import each other and never depend on the run
//! scheduler; shared helpers live in the registry module.

pub mod adapters;
pub mod channel_chunker;
pub mod channel_contract;
pub mod channel_directives;
pub mod channel_envelope;
pub mod channel_media;
pub mod channel_outbound;
pub mod channel_pairing;
pub mod channel_policy;
pub mod channel_registry;

pub use channel_chunker::chunk_markdown_text;
pub use channel_contract::{
    AccountContext, ChannelAdapter, ChannelCapabilities, ChannelDock, ChannelRuntimeStatus,
    ChannelTransport, DeliveryMode, HeartbeatReadiness, SendError, SendErrorKind, SendReceipt,
    StatusHandle, StatusIssue, TargetMode, TransportCell, TransportFactory,
};
pub use channel_directives::{parse_directives, Directive, ParsedDirectives};
pub use channel_envelope::{
    expand_template, extract_media_hints, ChannelEnvelope, ChannelSurface, ChatType,
    EnvelopeMedia, OutboundPayload, TemplatePlaceholder,
};
pub use channel_media::{prepare_media, sniff_mime, MediaKind, MediaLimits, PreparedMedia};
pub use channel_outbound::{deliver_payloads, DeliveryAbort, OutboundDeliveryReport};
pub use channel_pairing::{PairingRequest, PairingStore, MAX_PENDING_PAIRING_PER_CHANNEL};
pub use channel_policy::{evaluate_inbound_policy, PolicyDecision};
pub use channel_registry::ChannelRegistry;
