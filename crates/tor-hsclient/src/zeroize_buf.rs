//! Wrappers enforcing drop-triggered zeroization of sensitive intermediates.
//!
//! `BlindedKey`, `Subcredential` and the handshake's derived key material all
//! live only as long as the operation that needs them; this module gives them
//! a common, narrow acquire/drop discipline instead of sprinkling manual
//! `zeroize()` calls at every return path.

use tor_hscrypto::pk::{HsBlindId, HsBlindIdKey};
use tor_hscrypto::Subcredential;
use zeroize::Zeroizing;

/// A [`HsBlindIdKey`] whose backing bytes are wiped when this value is dropped.
///
/// `HsBlindIdKey` itself holds only a public key, which is not secret in the
/// usual sense; but it's still zeroed on release, since an attacker who can
/// observe process memory after a connection attempt should not be able to
/// tell which service a client was trying to reach merely by scraping a
/// stale blinded key out of freed memory.
#[derive(Clone)]
pub(crate) struct ZeroOnDropBlindedKey(Zeroizing<[u8; 32]>, HsBlindIdKey);

impl ZeroOnDropBlindedKey {
    /// Wrap a freshly computed blinded key.
    pub(crate) fn new(bytes: [u8; 32], key: HsBlindIdKey) -> Self {
        ZeroOnDropBlindedKey(Zeroizing::new(bytes), key)
    }

    /// Access the wrapped key.
    pub(crate) fn key(&self) -> &HsBlindIdKey {
        &self.1
    }

    /// Return the compact form of the wrapped key.
    ///
    /// Unlike [`Self::key`], this doesn't borrow: `HsBlindId` is a plain
    /// copyable identifier, fine to hand out and carry around on its own.
    pub(crate) fn id(&self) -> HsBlindId {
        self.1.to_blind_id()
    }
}

/// A [`Subcredential`] whose backing bytes are wiped when this value is dropped.
pub(crate) struct ZeroOnDropSubcredential(Zeroizing<Subcredential>);

impl ZeroOnDropSubcredential {
    /// Wrap a freshly computed subcredential.
    pub(crate) fn new(sc: Subcredential) -> Self {
        ZeroOnDropSubcredential(Zeroizing::new(sc))
    }

    /// Access the wrapped subcredential.
    pub(crate) fn get(&self) -> &Subcredential {
        &self.0
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn subcredential_roundtrips() {
        let sc: Subcredential = [7u8; 32].into();
        let wrapped = ZeroOnDropSubcredential::new(sc);
        assert_eq!(wrapped.get().as_ref(), &[7u8; 32]);
    }

    #[test]
    fn blinded_key_roundtrips() {
        use tor_llcrypto::pk::ed25519;

        let keypair = ed25519::Keypair::generate(&mut rand::thread_rng());
        let public_key = keypair.verifying_key();
        let blind_key = HsBlindIdKey::from(public_key);
        let id = blind_key.to_blind_id();
        let bytes: [u8; 32] = id.into();

        let wrapped = ZeroOnDropBlindedKey::new(bytes, blind_key);
        assert_eq!(wrapped.id(), id);
        assert_eq!(wrapped.key().to_blind_id(), id);
    }
}
