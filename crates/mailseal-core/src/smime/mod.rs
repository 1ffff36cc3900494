//! S/MIME protection for outbound mail
//!
//! Recipient certificates are resolved and policy-checked first; signing and
//! enveloping run only after every precondition holds.

mod address;
mod certificate;
pub mod chain;
mod envelope;
pub mod mime;
pub mod oids;
mod pipeline;
mod policy;
pub mod reader;
mod resolver;
mod signer;
mod source;

#[cfg(test)]
pub(crate) mod fixtures;

pub use address::{canonicalize, canonicalize_subject, merge_recipients, CanonicalAddress};
pub use certificate::SmimeCertificate;
pub use chain::{ChainError, TrustStore};
pub use envelope::envelope;
pub use mime::MessageBoundaries;
pub use pipeline::{
    ProtectedBody, ProtectionMode, ProtectionPipeline, ProtectionRequest, ENVELOPED_CONTENT_TYPE,
};
pub use policy::{CertificateValidator, PolicyRejection};
pub use reader::{Layer, OpenedMessage, SignatureInfo};
pub use resolver::{RecipientCache, RecipientKeyResolver, Resolution, ResolvedRecipient};
pub use signer::{multipart_signed_content_type, sign, SigningIdentity};
pub use source::{CertificateSource, InMemoryCertificateSource, PemDirectorySource};
