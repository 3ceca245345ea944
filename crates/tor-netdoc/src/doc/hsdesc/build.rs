//! Functionality for encoding onion service descriptors.
//!
//! This is the inverse of the parsing machinery in the sibling `inner`,
//! `middle`, and `outer` modules (not the `build::inner`/`build::middle`/
//! `build::outer` ones declared here, which are the encoders).

pub(crate) mod inner;
pub(crate) mod middle;
pub(crate) mod outer;

use crate::doc::hsdesc::middle::AuthClient;
use crate::doc::hsdesc::desc_enc::HsDescEncNonce;
use tor_llcrypto::pk::curve25519::PublicKey;

/// Client authorization parameters for the middle document of an onion
/// service descriptor.
///
/// Present only when the service has client authorization enabled; see
/// `HsDescMiddleBuilder::client_auth`.
pub(crate) struct ClientAuth {
    /// The ephemeral x25519 public key used to derive each authorized
    /// client's descriptor-cookie key.
    pub(crate) ephemeral_key: Box<PublicKey>,
    /// One encrypted-cookie entry per authorized client.
    pub(crate) auth_clients: Vec<AuthClient>,
    /// The descriptor cookie (`N_hs_desc_enc`) used to encrypt the inner
    /// document, in cleartext. Each `AuthClient` entry in `auth_clients` is
    /// this same value, encrypted under a key only that client can derive.
    pub(crate) descriptor_cookie: HsDescEncNonce,
}
