//! Parsing and representation for onion service descriptors.
//!
//! An onion service descriptor is a three-layer document: an outer layer
//! (self-signed, holds the signing-key certificate), a middle layer
//! (reachable only by clients that know the right authentication key, once
//! client auth is in use), and an inner layer (the list of introduction
//! points and associated information). See the individual submodules for
//! each layer's parsing and validation rules.

pub(crate) mod build;
pub(crate) mod desc_enc;
pub(crate) mod inner;
pub(crate) mod middle;
pub(crate) mod outer;
pub(crate) mod pow;

pub(crate) use desc_enc::DecryptionError;

use tor_hscrypto::pk::{HsIntroPtSessionIdKey, HsSvcNtorKey};
use tor_linkspec::EncodedLinkSpec;
use tor_llcrypto::pk::curve25519;

/// A single client authorization method that an onion service may accept when
/// a client is connecting through one of its introduction points.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub(crate) enum IntroAuthType {
    /// Authenticate using an Ed25519 signature.
    Ed25519,
    /// Authenticate using a shared password.
    Passwd,
}

/// Information about a single introduction point, as given in an onion
/// service descriptor's inner document.
#[derive(Clone, Debug)]
pub struct IntroPointDesc {
    /// The link specifiers to use when extending a circuit to this
    /// introduction point.
    pub(crate) link_specifiers: Vec<EncodedLinkSpec>,
    /// The introduction point's ntor onion key, used to extend a circuit to it.
    pub(crate) ipt_ntor_key: curve25519::PublicKey,
    /// The introduction point's session id key (`KP_hs_ipt_sid`), used to
    /// identify it across descriptor refreshes and as the recipient identity
    /// in the INTRODUCE1/INTRODUCE_ACK exchange.
    pub(crate) ipt_sid_key: HsIntroPtSessionIdKey,
    /// The key to use for the hs_ntor handshake with the service itself
    /// (`KP_hss_ntor`).
    pub(crate) svc_ntor_key: HsSvcNtorKey,
}

impl IntroPointDesc {
    /// Return the link specifiers to use when extending a circuit to this
    /// introduction point.
    pub fn link_specifiers(&self) -> &[EncodedLinkSpec] {
        &self.link_specifiers
    }
    /// Return the introduction point's ntor onion key.
    pub fn ipt_ntor_key(&self) -> &curve25519::PublicKey {
        &self.ipt_ntor_key
    }
    /// Return the introduction point's session id key.
    pub fn ipt_sid_key(&self) -> &HsIntroPtSessionIdKey {
        &self.ipt_sid_key
    }
    /// Return the key to use for the hs_ntor handshake with the service.
    pub fn svc_ntor_key(&self) -> &HsSvcNtorKey {
        &self.svc_ntor_key
    }
}

/// An error that occurred while decrypting one of the encrypted layers of an
/// onion service descriptor.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub(crate) enum HsDescError {
    /// We had a decryption key, but it was the wrong one.
    #[error("wrong decryption key for this layer")]
    WrongDecryptionKey,
    /// We had a decryption key, and it was (or might have been) the right
    /// one, but decryption still failed.
    #[error("decryption failed")]
    DecryptionFailed,
    /// We had no decryption key to try with this layer.
    #[error("no decryption key available for this layer")]
    MissingDecryptionKey,
}
