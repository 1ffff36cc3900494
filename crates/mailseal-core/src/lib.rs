//! MailSeal Core - S/MIME protection pipeline
//!
//! This crate resolves recipient certificates, applies signing and
//! enveloping in the order a protection mode requires, and assembles the
//! final message handed to the transport.

pub mod compose;
pub mod smime;

pub use compose::ComposedMessage;
pub use smime::{
    ProtectedBody, ProtectionMode, ProtectionPipeline, ProtectionRequest, RecipientCache,
    RecipientKeyResolver, SigningIdentity, SmimeCertificate,
};
