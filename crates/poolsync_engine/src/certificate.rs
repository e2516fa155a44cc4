//! Peer certificate validation boundary.
//!
//! TLS itself lives behind [`crate::RpcChannel`]. The connection only asks a
//! validator whether the certificate a channel presents is acceptable.

/// Facts about a peer certificate that a validator decides on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Subject name.
    pub subject: String,
    /// Hex fingerprint.
    pub fingerprint: String,
    /// Whether the issuer is the subject.
    pub self_signed: bool,
    /// Whether the validity period has ended.
    pub expired: bool,
}

/// Which otherwise-invalid certificates may be accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertificatePolicy {
    /// Accept certificates the peer signed itself.
    pub accept_self_signed: bool,
    /// Accept certificates past their validity period.
    pub accept_expired: bool,
}

impl CertificatePolicy {
    /// A policy that accepts self-signed certificates, as freshly installed hosts present.
    pub fn permissive_self_signed() -> Self {
        Self {
            accept_self_signed: true,
            accept_expired: false,
        }
    }
}

/// Outcome of a validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Continue the handshake.
    Accept,
    /// Abort the handshake, with a reason.
    Reject(String),
}

/// Decides whether to trust a peer certificate.
pub trait CertificateValidator: Send + Sync {
    /// Validates a certificate.
    fn validate(&self, certificate: &Certificate) -> Verdict;
}

/// A validator driven purely by a [`CertificatePolicy`].
#[derive(Debug, Clone, Default)]
pub struct PolicyValidator {
    policy: CertificatePolicy,
}

impl PolicyValidator {
    /// Creates a validator.
    pub fn new(policy: CertificatePolicy) -> Self {
        Self { policy }
    }
}

impl CertificateValidator for PolicyValidator {
    fn validate(&self, certificate: &Certificate) -> Verdict {
        if certificate.expired && !self.policy.accept_expired {
            return Verdict::Reject(format!("certificate for {} has expired", certificate.subject));
        }
        if certificate.self_signed && !self.policy.accept_self_signed {
            return Verdict::Reject(format!(
                "certificate for {} is self-signed ({})",
                certificate.subject, certificate.fingerprint
            ));
        }
        Verdict::Accept
    }
}
