//! The descriptor fetch coordinator: issue anonymous directory requests for
//! onion service descriptors, and validate what comes back.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use tor_circmgr::hspool::HsCircKind;
use tor_circmgr::CircMgr;
use tor_dirclient::request::HsDescDownloadRequest;
use tor_hscrypto::pk::{HsBlindId, HsId};
use tor_hscrypto::time::TimePeriod;
use tor_hscrypto::Subcredential;
use tor_linkspec::OwnedCircTarget;
use tor_netdir::{NetDir, NetDirProvider, Timeliness};
use tor_rtcompat::Runtime;

use crate::cache::{ClientContext, DescriptorRecord};
use crate::config::HsClientConfig;
use crate::err::DescriptorErrorDetail;
use crate::gate::{can_fetch, FetchStatus};
use crate::hsdir;
use crate::ipt_select::DescriptorIntroPoints;

/// Decodes and validates a raw descriptor body.
///
/// This core doesn't implement descriptor decoding itself: `blind`,
/// `subcredential`, and certificate/signature validation live in the
/// descriptor codec, the same outside collaborator the fetch-eligibility
/// gate's neighbor operations call out to. A real connector wires this to
/// `tor_netdoc::doc::hsdesc`; tests wire it to a stub.
pub(crate) trait DescriptorCodec {
    /// The decoded, validated descriptor type this codec produces.
    type Desc;

    /// Decode and validate `body`, which purports to be the descriptor for
    /// `blinded_id`, encrypted under `subcredential`.
    ///
    /// Implementations must check that the signing-key certificate is
    /// cross-signed by `blinded_id` and time-valid as of `now`; a descriptor
    /// that fails either check must be rejected, since without these checks
    /// anyone who knows the subcredential could forge one.
    fn decode_and_validate(
        &self,
        body: &str,
        blinded_id: &HsBlindId,
        subcredential: &Subcredential,
        now: SystemTime,
    ) -> Result<Self::Desc, DescriptorErrorDetail>;
}

/// Check whether a fetch for `hsid` may be launched, and if so, resolve the
/// network view it should be launched against.
///
/// Splits cleanly from the actual network request (see [`run_fetch`]) so the
/// eligibility decision stays synchronous and easy to test on its own.
pub(crate) fn refetch<Desc: DescriptorIntroPoints, C>(
    hsid: HsId,
    config: &HsClientConfig,
    netdir_provider: &Arc<dyn NetDirProvider>,
    ctx: &mut ClientContext<Desc, C>,
    pending: &[HsId],
) -> Result<(Arc<NetDir>, TimePeriod), FetchStatus> {
    let status = can_fetch(hsid, config, netdir_provider, ctx, pending);
    if status != FetchStatus::Ok {
        return Err(status);
    }
    let netdir = netdir_provider
        .netdir(Timeliness::Timely)
        .map_err(|_| FetchStatus::MissingInfo)?;
    let period = netdir.hs_time_period();
    Ok((netdir, period))
}

/// Run a previously-approved fetch over the network: build an anonymous
/// circuit to `hsdir_target`, open a directory stream on it, and send `req`.
pub(crate) async fn run_fetch<RT: Runtime>(
    runtime: &RT,
    circmgr: &Arc<CircMgr<RT>>,
    netdir: &NetDir,
    hsdir_target: OwnedCircTarget,
    req: &HsDescDownloadRequest,
) -> Result<String, DescriptorErrorDetail> {
    let pool = tor_circmgr::hspool::HsCircPool::new(circmgr);
    let circ = pool
        .get_or_launch_specific(netdir, HsCircKind::ClientHsDir, hsdir_target)
        .await
        .map_err(DescriptorErrorDetail::Circuit)?;
    let mut stream = circ
        .begin_dir_stream()
        .await
        .map_err(DescriptorErrorDetail::Stream)?;
    let resp = tor_dirclient::send_request(runtime, req, &mut stream, None)
        .await
        .map_err(directory_error_detail)?;
    resp.into_output_string()
        .map_err(|e| DescriptorErrorDetail::Directory(e.error))
}

/// Translate a `tor_dirclient::Error` (which also covers circuit-build
/// failure) into the narrower `DescriptorErrorDetail` taxonomy.
fn directory_error_detail(e: tor_dirclient::Error) -> DescriptorErrorDetail {
    use tor_dirclient::Error as DE;
    match e {
        DE::CircMgr(e) => DescriptorErrorDetail::Circuit(e),
        DE::RequestFailed(rfe) => DescriptorErrorDetail::Directory(rfe.error),
        DE::Bug(b) => DescriptorErrorDetail::Bug(b),
    }
}

/// Handle a descriptor body that just arrived for `hsid`.
///
/// Decodes and validates it via `codec`, and installs it in the cache on
/// success.
pub(crate) fn on_descriptor_fetched<Codec: DescriptorCodec, C>(
    hsid: HsId,
    period: TimePeriod,
    blinded_id: &HsBlindId,
    subcredential: &Subcredential,
    body: &str,
    codec: &Codec,
    ctx: &mut ClientContext<Codec::Desc, C>,
) -> Result<(), DescriptorErrorDetail> {
    let desc = codec.decode_and_validate(body, blinded_id, subcredential, SystemTime::now())?;
    debug!(?hsid, "installed onion service descriptor");
    ctx.descriptors
        .insert(hsid, DescriptorRecord::new(desc, period));
    Ok(())
}

/// Handle a fetch attempt that failed, per `status`.
///
/// If `status` is in the closing set, every waiter parked on `hsid` should
/// be torn down by the caller with `RESOLVEFAILED`, and the HSDir-tried
/// history for `hsid` is purged so a subsequent attempt starts fresh.
/// Returns whether `status` was in the closing set.
pub(crate) fn on_descriptor_failed<Desc, C>(
    blinded_id: &HsBlindId,
    status: FetchStatus,
    ctx: &mut ClientContext<Desc, C>,
) -> bool {
    if status.is_fatal() {
        warn!(?status, "onion service descriptor fetch failed");
        ctx.hsdir_history.reset(&hsdir::tried_lookup_key(blinded_id));
        true
    } else {
        false
    }
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
    use std::time::Duration;
    use tor_llcrypto::pk::{ed25519, rsa::RsaIdentity};

    struct StubCodec {
        accept: bool,
    }

    /// A codec that performs the one check a stub can't paper over: that the
    /// descriptor signing-key certificate is actually cross-signed by the
    /// blinded id it claims to belong to.
    ///
    /// `body` here isn't a real descriptor, just a base64-encoded
    /// [`tor_cert::Ed25519Cert`] standing in for the
    /// `descriptor-signing-key-cert` field.
    struct CrossSignCheckingCodec;

    impl DescriptorCodec for CrossSignCheckingCodec {
        type Desc = ();

        fn decode_and_validate(
            &self,
            body: &str,
            blinded_id: &HsBlindId,
            _subcredential: &Subcredential,
            now: SystemTime,
        ) -> Result<Self::Desc, DescriptorErrorDetail> {
            use base64ct::{Base64Unpadded, Encoding as _};
            use tor_checkable::{SelfSigned, Timebound};

            let cert_bytes =
                Base64Unpadded::decode_vec(body).map_err(|_| DescriptorErrorDetail::Timeout)?;
            let cert = tor_cert::Ed25519Cert::decode(&cert_bytes)
                .map_err(|_| DescriptorErrorDetail::Timeout)?;

            let blinded_id_bytes: [u8; 32] = blinded_id
                .as_ref()
                .try_into()
                .expect("HsBlindId is 32 bytes");
            let blinded_identity = ed25519::Ed25519Identity::from(blinded_id_bytes);

            let cert = cert
                .should_be_signed_with(&blinded_identity)
                .and_then(SelfSigned::check_signature)
                .map_err(|_| DescriptorErrorDetail::Timeout)?
                .check_valid_at(&now)
                .map_err(|_| DescriptorErrorDetail::Timeout)?;
            let _ = cert;
            Ok(())
        }
    }

    fn signed_signing_cert(signer: &ed25519::Keypair) -> String {
        use base64ct::{Base64Unpadded, Encoding as _};
        use tor_cert::CertifiedKey;

        let subject = ed25519::Keypair::generate(&mut rand::thread_rng());
        let encoded = tor_cert::Ed25519Cert::constructor()
            .expiration(SystemTime::now() + Duration::from_secs(86400 * 30))
            .cert_key(CertifiedKey::Ed25519(subject.verifying_key().into()))
            .cert_type(tor_cert::CertType::HS_BLINDED_ID_V_SIGNING)
            .encode_and_sign(signer)
            .expect("well-formed certificate");
        Base64Unpadded::encode_string(&encoded)
    }

    #[test]
    fn cert_cross_signed_by_blinded_key_is_accepted() {
        let blinded_keypair = ed25519::Keypair::generate(&mut rand::thread_rng());
        let blinded_id: HsBlindId =
            ed25519::Ed25519Identity::from(blinded_keypair.verifying_key()).into();
        let body = signed_signing_cert(&blinded_keypair);

        let codec = CrossSignCheckingCodec;
        let sc: Subcredential = [9u8; 32].into();
        assert!(codec
            .decode_and_validate(&body, &blinded_id, &sc, SystemTime::now())
            .is_ok());
    }

    #[test]
    fn cert_not_cross_signed_by_blinded_key_is_rejected() {
        let blinded_keypair = ed25519::Keypair::generate(&mut rand::thread_rng());
        let blinded_id: HsBlindId =
            ed25519::Ed25519Identity::from(blinded_keypair.verifying_key()).into();
        let impostor_keypair = ed25519::Keypair::generate(&mut rand::thread_rng());
        // Signed by a key that has nothing to do with the blinded id the
        // fetch was made for.
        let body = signed_signing_cert(&impostor_keypair);

        let codec = CrossSignCheckingCodec;
        let sc: Subcredential = [9u8; 32].into();
        assert!(codec
            .decode_and_validate(&body, &blinded_id, &sc, SystemTime::now())
            .is_err());
    }

    impl DescriptorCodec for StubCodec {
        type Desc = &'static str;
        fn decode_and_validate(
            &self,
            _body: &str,
            _blinded_id: &HsBlindId,
            _subcredential: &Subcredential,
            _now: SystemTime,
        ) -> Result<Self::Desc, DescriptorErrorDetail> {
            if self.accept {
                Ok("a fine descriptor")
            } else {
                Err(DescriptorErrorDetail::Timeout)
            }
        }
    }

    #[test]
    fn fetched_descriptor_lands_in_cache() {
        let mut ctx: ClientContext<&'static str, ()> = ClientContext::default();
        let hsid: HsId = [5u8; 32].into();
        let blinded: HsBlindId = [6u8; 32].into();
        let sc: Subcredential = [7u8; 32].into();
        let codec = StubCodec { accept: true };
        let period = first_period();

        on_descriptor_fetched(hsid, period, &blinded, &sc, "dummy", &codec, &mut ctx).unwrap();
        assert!(ctx.descriptors.get(hsid, period).is_some());
    }

    #[test]
    fn rejected_descriptor_is_not_cached() {
        let mut ctx: ClientContext<&'static str, ()> = ClientContext::default();
        let hsid: HsId = [5u8; 32].into();
        let blinded: HsBlindId = [6u8; 32].into();
        let sc: Subcredential = [7u8; 32].into();
        let codec = StubCodec { accept: false };
        let period = first_period();

        assert!(on_descriptor_fetched(hsid, period, &blinded, &sc, "dummy", &codec, &mut ctx).is_err());
        assert!(ctx.descriptors.get(hsid, period).is_none());
    }

    #[test]
    fn failure_reset_only_on_closing_set() {
        let mut ctx: ClientContext<(), ()> = ClientContext::default();
        let blinded: HsBlindId = [1u8; 32].into();
        let hsdir_id = RsaIdentity::from_bytes(&[2u8; 20]).unwrap();
        let key = hsdir::tried_lookup_key(&blinded);
        ctx.hsdir_history.note_tried(key.clone(), hsdir_id);

        assert!(!on_descriptor_failed(&blinded, FetchStatus::Pending, &mut ctx));
        assert!(ctx.hsdir_history.was_tried(&key, &hsdir_id));

        assert!(on_descriptor_failed(&blinded, FetchStatus::NoHsdirs, &mut ctx));
        assert!(!ctx.hsdir_history.was_tried(&key, &hsdir_id));
    }

    /// A placeholder time period, since `TimePeriod::new`'s arithmetic isn't
    /// implemented yet.
    fn first_period() -> TimePeriod {
        TimePeriod::from_parts(0, 86400)
    }
}
