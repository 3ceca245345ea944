//! Key type wrappers of various kinds used in onion services.
//
// NOTE: We define wrappers here as a safety net against confusing one kind of
// key for another: without a system like this, it can get pretty hard making
// sure that each key is used only in the right way.

// TODO hs: for each of these key types, we should impl AsRef<> to get at its inner type.
// We should impl From to convert to and from the inner types.
// TODO hs: These are so similar to one another that we probably want to define a local
// macro that declares them as appropriate.

use std::hash::{Hash, Hasher};

use tor_llcrypto::pk::{curve25519, ed25519};

use crate::time::TimePeriod;

/// The identity of a v3 onion service, in compact form.
///
/// This is the decoded and validated ed25519 public key that is encoded as a
/// `${base32}.onion` address.  When expanded, it is a public key whose
/// corresponding secret key is controlled by the onion service.
///
/// Stable across time periods; used as the top-level lookup key for
/// everything this crate's clients remember about a service.
#[derive(Copy, Clone, Eq, PartialEq, Debug, derive_more::From, derive_more::Into)]
pub struct HsId([u8; 32]);

impl Hash for HsId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// The identity of a v3 onion service, expanded into a public key.
///
/// This key is not used to sign or validate anything on its own; instead, it is
/// used to derive an [`HsBlindIdKey`] for a given [`TimePeriod`].
//
// NOTE: This is called the "master" key in rend-spec-v3, but we're deprecating
// that vocabulary generally.
#[derive(Clone, Debug)]
pub struct HsIdKey(ed25519::PublicKey);

impl From<ed25519::PublicKey> for HsIdKey {
    fn from(pk: ed25519::PublicKey) -> Self {
        HsIdKey(pk)
    }
}

impl HsIdKey {
    /// Derive the blinded key and subcredential for this identity during `cur_period`.
    pub fn compute_blinded_key(
        &self,
        cur_period: &TimePeriod,
    ) -> (HsBlindIdKey, crate::Subcredential) {
        let _ = cur_period;
        todo!() // TODO hs.  The underlying crypto lives in tor_llcrypto::pk::keymanip.
    }
}

/// The "blinded" identity of a v3 onion service, in compact form.
///
/// Used as an index into the HSDir ring, and as a key into the HSDir-tried
/// history and the descriptor cache for the current time period.
#[derive(Copy, Clone, Eq, PartialEq, Debug, derive_more::From, derive_more::Into)]
pub struct HsBlindId([u8; 32]);

impl Hash for HsBlindId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl AsRef<[u8]> for HsBlindId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<ed25519::Ed25519Identity> for HsBlindId {
    fn from(id: ed25519::Ed25519Identity) -> Self {
        HsBlindId(*id.as_bytes())
    }
}

/// The "blinded" identity of a v3 onion service, expanded into a public key.
///
/// This key is derived via a one-way transformation from an [`HsIdKey`] and
/// the current time period. It is used to verify that a descriptor's
/// signing-key certificate was actually issued by the service.
#[derive(Clone, Debug)]
pub struct HsBlindIdKey(ed25519::PublicKey);

impl From<ed25519::PublicKey> for HsBlindIdKey {
    fn from(pk: ed25519::PublicKey) -> Self {
        HsBlindIdKey(pk)
    }
}

impl HsBlindIdKey {
    /// Return the compact form of this key.
    pub fn to_blind_id(&self) -> HsBlindId {
        HsBlindId((*self.0.as_bytes()).into())
    }
}

/// A key used to sign onion service descriptors.
///
/// It is authenticated with an [`HsBlindIdKey`] to prove that it belongs to
/// the right onion service, and is used in turn to sign the descriptor that
/// tells clients what they need to know about contacting an onion service.
#[derive(Clone, Debug)]
pub struct HsDescSigningKey(ed25519::PublicKey);

impl From<ed25519::PublicKey> for HsDescSigningKey {
    fn from(pk: ed25519::PublicKey) -> Self {
        HsDescSigningKey(pk)
    }
}

/// A key used to identify and authenticate an onion service at a single
/// introduction point.
///
/// This key is included in the onion service's descriptor; a different one is
/// used at each introduction point.  Introduction points don't know the
/// relation of this key to the onion service: they only recognize the same key
/// when they see it again.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct HsIntroPtSessionIdKey(ed25519::PublicKey);

impl From<ed25519::PublicKey> for HsIntroPtSessionIdKey {
    fn from(pk: ed25519::PublicKey) -> Self {
        HsIntroPtSessionIdKey(pk)
    }
}

impl AsRef<ed25519::PublicKey> for HsIntroPtSessionIdKey {
    fn as_ref(&self) -> &ed25519::PublicKey {
        &self.0
    }
}

/// A key used in the HsNtor handshake between the client and the onion service.
///
/// This is `KP_hss_ntor`, as published in the service's descriptor; it is all
/// a client ever sees of the service's ntor keypair. The service's own side
/// of the keypair is [`HsSvcNtorKeypair`].
#[derive(Clone, Debug, derive_more::From, derive_more::Into)]
pub struct HsSvcNtorKey(curve25519::PublicKey);

impl std::ops::Deref for HsSvcNtorKey {
    type Target = curve25519::PublicKey;
    fn deref(&self) -> &curve25519::PublicKey {
        &self.0
    }
}

/// A service-side keypair for the key used in the HsNtor handshake.
#[derive(Clone)]
pub struct HsSvcNtorKeypair {
    /// Public part
    public: curve25519::PublicKey,
    /// Secret part
    secret: curve25519::StaticSecret,
}

impl std::fmt::Debug for HsSvcNtorKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsSvcNtorKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl HsSvcNtorKeypair {
    /// Build a keypair from a secret key, deriving the public key.
    pub fn from_secret_key(secret: curve25519::StaticSecret) -> Self {
        let public = curve25519::PublicKey::from(&secret);
        HsSvcNtorKeypair { public, secret }
    }

    /// Return the secret half of this keypair.
    pub fn secret(&self) -> &curve25519::StaticSecret {
        &self.secret
    }

    /// Return the public half of this keypair, in the form published in a descriptor.
    pub fn public(&self) -> HsSvcNtorKey {
        HsSvcNtorKey(self.public)
    }
}

/// First type of client authorization key, used for the introduction protocol.
///
/// This is used to sign a nonce included in an extension in the encrypted
/// portion of an introduce cell.
#[derive(Clone, Debug)]
pub struct HsClientIntroAuthKeypair {
    /// The keypair's secret half
    secret: ed25519::ExpandedSecretKey,
    /// The keypair's public half
    public: ed25519::PublicKey,
}

impl From<ed25519::SecretKey> for HsClientIntroAuthKeypair {
    fn from(secret: ed25519::SecretKey) -> Self {
        let expanded = ed25519::ExpandedSecretKey::from(&secret);
        let public = ed25519::PublicKey::from(&secret);
        HsClientIntroAuthKeypair {
            secret: expanded,
            public,
        }
    }
}

impl HsClientIntroAuthKeypair {
    /// Return this keypair's public part.
    pub fn public(&self) -> &ed25519::PublicKey {
        &self.public
    }
}

/// Second type of client authorization key, used for onion descriptor
/// decryption.
///
/// Any client who knows the secret key corresponding to this key can decrypt
/// the inner layer of the onion service descriptor.
#[derive(Clone, Debug)]
pub struct HsClientDescEncKeypair {
    /// The keypair's secret half
    secret: curve25519::StaticSecret,
    /// The keypair's public half
    public: curve25519::PublicKey,
}

impl From<curve25519::StaticSecret> for HsClientDescEncKeypair {
    fn from(secret: curve25519::StaticSecret) -> Self {
        let public = curve25519::PublicKey::from(&secret);
        HsClientDescEncKeypair { secret, public }
    }
}

impl HsClientDescEncKeypair {
    /// Return this keypair's public part.
    pub fn public(&self) -> &curve25519::PublicKey {
        &self.public
    }

    /// Return this keypair's secret part.
    pub fn secret(&self) -> &curve25519::StaticSecret {
        &self.secret
    }
}

/// The public half of [`HsClientDescEncKeypair`]: `KP_hss_desc_enc`, published
/// by the service so that authorized clients can perform a Diffie-Hellman
/// exchange to decrypt the middle layer of its descriptor.
pub type HsSvcDescEncKey = curve25519::PublicKey;

/// The secret half of a client's descriptor-decryption authorization keypair:
/// `KS_hsc_desc_enc`. Any onion service descriptor that lists the
/// corresponding public key as an authorized client can be decrypted by
/// whoever holds this.
#[derive(Clone)]
pub struct HsClientDescEncSecretKey(curve25519::StaticSecret);

impl From<curve25519::StaticSecret> for HsClientDescEncSecretKey {
    fn from(secret: curve25519::StaticSecret) -> Self {
        HsClientDescEncSecretKey(secret)
    }
}

impl AsRef<curve25519::StaticSecret> for HsClientDescEncSecretKey {
    fn as_ref(&self) -> &curve25519::StaticSecret {
        &self.0
    }
}
