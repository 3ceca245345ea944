//! The HSDir picker: choose which hidden service directory to ask for a
//! descriptor next.

use base64ct::{Base64Unpadded, Encoding as _};
use rand::Rng;

use tor_hscrypto::pk::HsBlindId;
use tor_hscrypto::time::TimePeriod;
use tor_netdir::{NetDir, Relay};

use crate::cache::HsDirTriedHistory;

/// Return the key under which [`HsDirTriedHistory`] records attempts for
/// `blinded_id`.
///
/// This is the same encoding `tor_dirclient::request::HsDescDownloadRequest`
/// uses for the request path, so a lookup key here always matches the
/// descriptor request it was picked for.
pub(crate) fn tried_lookup_key(blinded_id: &HsBlindId) -> String {
    Base64Unpadded::encode_string(blinded_id.as_ref())
}

/// Pick the next HSDir to ask for `blinded_id`'s descriptor at `period`, out
/// of `netdir`'s current hash-ring neighborhood for that identity, skipping
/// any directory already tried (per `history`) during this lookup.
///
/// Returns `None` once every responsible HSDir has been tried; the caller
/// turns that into [`crate::gate::FetchStatus::NoHsdirs`].
pub(crate) fn pick_hsdir<'r, R: Rng>(
    netdir: &'r NetDir,
    blinded_id: HsBlindId,
    period: TimePeriod,
    history: &mut HsDirTriedHistory,
    rng: &mut R,
) -> Result<Option<Relay<'r>>, tor_error::Bug> {
    let candidates = netdir.hs_dirs_download(blinded_id, period, rng)?;
    let lookup_key = tried_lookup_key(&blinded_id);

    let pick = candidates
        .into_iter()
        .find(|relay| !history.was_tried(&lookup_key, relay.rsa_id()));

    if let Some(ref relay) = pick {
        history.note_tried(lookup_key, *relay.rsa_id());
    }

    Ok(pick)
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn lookup_key_matches_request_path_encoding() {
        let blinded_id: HsBlindId = [0x42u8; 32].into();
        let key = tried_lookup_key(&blinded_id);
        // No padding, and every byte's worth of base64 present.
        assert!(!key.contains('='));
        assert_eq!(key, Base64Unpadded::encode_string(&[0x42u8; 32]));
    }
}
