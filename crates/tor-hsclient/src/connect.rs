//! Main implementation of the connection functionality: the orchestration
//! layer that ties the fetch-eligibility gate (C1), the HSDir picker (C2),
//! the descriptor fetch coordinator (C3), the introduction point selector
//! (C4), the rendezvous state machine (C5) and the waiter registry (C6)
//! together into one connection attempt.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future;
use retry_error::RetryError;
use tor_error::{internal, Report};
use tracing::debug;

use tor_cell::chancell::msg::DestroyReason;
use tor_circmgr::hspool::{HsCircKind, HsCircPool};
use tor_hscrypto::pk::{HsBlindId, HsId, HsIdKey};
use tor_hscrypto::time::TimePeriod;
use tor_hscrypto::Subcredential;
use tor_linkspec::{CircTarget, OwnedCircTarget};
use tor_netdir::{NetDir, Timeliness};
use tor_netdoc::doc::hsdesc::IntroPointDesc;
use tor_llcrypto::pk::rsa::RsaIdentity;
use tor_proto::circuit::handshake::{HandshakeRole, RelayProtocol};
use tor_proto::circuit::{CircParameters, ClientCirc};
use tor_rtcompat::Runtime;

use crate::cache::{ClientContext, IntroFailureKind};
use crate::desc_fetch::{on_descriptor_failed, on_descriptor_fetched, refetch, run_fetch, DescriptorCodec};
use crate::err::{DescriptorError, DescriptorErrorDetail, FailedAttemptError, IntroPtIndex};
use crate::gate::FetchStatus;
use crate::ipt_select::{self, DescriptorIntroPoints};
use crate::rend_handshake::{self, PairState, RendPair};
use crate::relay_info;
use crate::state::MockableConnectorData;
use crate::zeroize_buf::{ZeroOnDropBlindedKey, ZeroOnDropSubcredential};
use crate::{HsClientConnError, HsClientConnector, HsClientSecretKeys};

/// Number of distinct introduction points we're willing to try in a row
/// before giving up on a connection attempt entirely.
const MAX_INTRO_ATTEMPTS: u32 = 5;

/// The decoded introduction points of a cached onion service descriptor.
///
/// Full onion descriptor parsing (decrypting the outer/middle/inner layers
/// and validating their certificates) is left out of scope here, the same
/// way [`HsIdKey::compute_blinded_key`] is left unimplemented: `tor-netdoc`
/// doesn't currently expose a public entry point for it. This is what
/// [`RealDescriptorCodec`] would produce once that lands.
#[derive(Clone, Debug)]
pub(crate) struct RealDesc {
    /// The introduction points this descriptor advertised.
    intro_points: Vec<IntroPointDesc>,
}

impl DescriptorIntroPoints for RealDesc {
    fn intro_points(&self) -> &[IntroPointDesc] {
        &self.intro_points
    }
}

/// Decodes and validates onion service descriptor bodies using the real
/// on-the-wire format.
struct RealDescriptorCodec;

impl DescriptorCodec for RealDescriptorCodec {
    type Desc = RealDesc;

    fn decode_and_validate(
        &self,
        _body: &str,
        _blinded_id: &HsBlindId,
        _subcredential: &Subcredential,
        _now: std::time::SystemTime,
    ) -> Result<Self::Desc, DescriptorErrorDetail> {
        // tor_netdoc::doc::hsdesc's outer/middle/inner decryption pipeline
        // has no public entry point yet, and bottoms out in
        // HsIdKey::compute_blinded_key, which isn't implemented either.
        todo!()
    }
}

/// Per-service state kept across connection attempts.
///
/// Most of what a real connector needs to remember about an onion service
/// is process-wide rather than per-service, and lives in
/// [`crate::cache::ClientContext`] on the connector instead (descriptor
/// cache, HSDir-tried history, introduction point failure tracking). This
/// is `state.rs`'s per-service slot, and has nothing of its own to add.
#[derive(Default, Debug)]
pub struct Data {}

/// Derive the blinded identity key and subcredential for `hsid` at `period`.
///
/// `hsid` is an onion address's raw 32 bytes; not every such value is a valid
/// ed25519 point, so this can fail on a malformed identity.
///
/// The rest of this function is unreachable in practice:
/// [`HsIdKey::compute_blinded_key`] is a `todo!()` stub, so nothing
/// downstream of this function can run end to end yet.
fn blinded_id_and_subcredential(
    hsid: HsId,
    period: TimePeriod,
) -> Result<(ZeroOnDropBlindedKey, Subcredential), HsClientConnError> {
    let identity = tor_llcrypto::pk::ed25519::Ed25519Identity::from(<[u8; 32]>::from(hsid));
    let public_key = tor_llcrypto::pk::ed25519::PublicKey::try_from(identity)
        .map_err(|_| HsClientConnError::InvalidHsId)?;
    let id_key = HsIdKey::from(public_key);
    let (blind_key, subcredential) = id_key.compute_blinded_key(&period);
    let bytes: [u8; 32] = blind_key.to_blind_id().into();
    Ok((ZeroOnDropBlindedKey::new(bytes, blind_key), subcredential))
}

/// Obtain a usable cached descriptor for `hsid`, fetching one if necessary.
///
/// Implements the C1/C2/C3 half of the control flow: check the
/// fetch-eligibility gate, and if a fetch is needed, keep asking the HSDir
/// picker for the next candidate until one succeeds or the picker is
/// exhausted.
async fn obtain_descriptor<R: Runtime, D: MockableConnectorData>(
    connector: &HsClientConnector<R, D>,
    hsid: HsId,
    blinded_id: HsBlindId,
    subcredential: &Subcredential,
    ctx: &Mutex<ClientContext<RealDesc, RendPair>>,
) -> Result<Arc<RealDesc>, HsClientConnError> {
    let codec = RealDescriptorCodec;
    let mut attempts = RetryError::in_attempt_to("download onion service descriptor");

    loop {
        {
            let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
            let period = match connector.netdir_provider.netdir(Timeliness::Timely) {
                Ok(netdir) => netdir.hs_time_period(),
                Err(_) => return Err(HsClientConnError::NoHsDirs),
            };
            // A cached descriptor is only a fast path if at least one of its
            // introduction points is still usable; a descriptor whose intro
            // points have all failed needs the same refetch a missing one
            // would, which `refetch` below will trigger.
            if let Some(desc) = guard.descriptors.get(hsid, period).map(|rec| Arc::clone(&rec.desc)) {
                let has_usable_intro = desc.intro_points().iter().any(|ipt| {
                    let key = ipt_select::failure_key(hsid, ipt);
                    ipt_select::is_usable(&key, &mut guard.intro_failures, &connector.config)
                });
                if has_usable_intro {
                    return Ok(desc);
                }
            }
        }

        let fetch_target = {
            let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
            refetch(hsid, &connector.config, &connector.netdir_provider, &mut guard, &[])
        };

        let (netdir, period) = match fetch_target {
            Ok(pair) => pair,
            Err(status) => {
                let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
                on_descriptor_failed::<RealDesc, RendPair>(&blinded_id, status, &mut guard);
                return Err(match status {
                    FetchStatus::NotAllowed => internal!("onion service fetching disabled by configuration").into(),
                    FetchStatus::NoHsdirs => HsClientConnError::NoHsDirs,
                    FetchStatus::HaveDesc | FetchStatus::Pending | FetchStatus::MissingInfo => {
                        internal!("descriptor fetch not ready to retry").into()
                    }
                });
            }
        };

        let hsdir = {
            let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
            let mut rng = rand::thread_rng();
            crate::hsdir::pick_hsdir(&netdir, blinded_id, period, &mut guard.hsdir_history, &mut rng)?
        };

        let Some(hsdir) = hsdir else {
            let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
            on_descriptor_failed::<RealDesc, RendPair>(&blinded_id, FetchStatus::NoHsdirs, &mut guard);
            return Err(if attempts.is_empty() {
                HsClientConnError::NoHsDirs
            } else {
                HsClientConnError::DescriptorDownload(attempts)
            });
        };

        let hsdir_identity = *hsdir.id();
        let target = OwnedCircTarget::from_circ_target(&hsdir);
        let req = tor_dirclient::request::HsDescDownloadRequest::new(blinded_id);

        let fetch_result = run_fetch(&connector.runtime, &connector.circmgr, &netdir, target, &req).await;

        let body = match fetch_result {
            Ok(body) => body,
            Err(error) => {
                attempts.push(Report(DescriptorError {
                    hsdir: hsdir_identity.into(),
                    error,
                }));
                continue;
            }
        };

        let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
        match on_descriptor_fetched(hsid, period, &blinded_id, subcredential, &body, &codec, &mut guard) {
            Ok(()) => {
                let rec = guard
                    .descriptors
                    .get(hsid, period)
                    .ok_or_else(|| internal!("descriptor vanished right after insertion"))?;
                return Ok(Arc::clone(&rec.desc));
            }
            Err(error) => {
                drop(guard);
                attempts.push(Report(DescriptorError {
                    hsdir: hsdir_identity.into(),
                    error,
                }));
                continue;
            }
        }
    }
}

/// Make one attempt at reaching the service through a single introduction
/// point, once a usable descriptor is in hand: build the rendezvous and
/// introduction circuits, run the handshake, and join the rendezvous
/// circuit to the service's virtual hop.
///
/// Implements the C4/C5 half of the control flow.
async fn attempt_rendezvous<R: Runtime>(
    connector: &HsClientConnector<R>,
    netdir: &NetDir,
    hsid: HsId,
    desc: &RealDesc,
    subcredential: Subcredential,
    exclude_set: &[RsaIdentity],
    ctx: &Mutex<ClientContext<RealDesc, RendPair>>,
) -> Result<ClientCirc, FailedAttemptError> {
    let pool = HsCircPool::new(&connector.circmgr);

    let (ipt, mut intro_index) = {
        let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
        let mut rng = rand::thread_rng();
        let pick = ipt_select::pick_intro(
            hsid,
            desc,
            netdir,
            &mut guard.intro_failures,
            &connector.config,
            exclude_set,
            false,
            &mut rng,
        );
        match pick {
            Some(Ok((ipt, _target))) => {
                let index = desc
                    .intro_points
                    .iter()
                    .position(|candidate| candidate.ipt_sid_key().as_ref() == ipt.ipt_sid_key().as_ref())
                    .unwrap_or(0);
                (ipt, IntroPtIndex(index))
            }
            Some(Err(error)) => {
                return Err(FailedAttemptError::UnusableIntro {
                    error,
                    intro_index: IntroPtIndex(0),
                })
            }
            None => return Err(FailedAttemptError::Bug(internal!("no usable introduction points"))),
        }
    };

    let target = relay_info::ipt_to_circtarget(&ipt, netdir)
        .map_err(|error| FailedAttemptError::UnusableIntro { error, intro_index })?;
    let mut owned_target = OwnedCircTarget::from_circ_target(&target);

    let mut rng = rand::thread_rng();

    let (rend_result, intro_result) = future::join(
        pool.get_or_launch_client_rend(netdir),
        pool.get_or_launch_specific(netdir, HsCircKind::ClientIntro, owned_target.clone()),
    )
    .await;

    let (rend_circuit, rend_pt) =
        rend_result.map_err(|error| FailedAttemptError::RendezvousObtainCircuit { error })?;
    let rend_pt_id = crate::err::rend_pt_identity_for_error(&rend_pt);

    let intro_circuit =
        intro_result.map_err(|error| FailedAttemptError::IntroObtainCircuit { error, intro_index })?;

    let (cookie, established_rx, rend2_rx) =
        rend_handshake::establish_rendezvous(&rend_circuit, &rend_pt_id, &mut rng).await?;

    let mut pair = RendPair {
        state: PairState::RendEstablishing,
        cookie,
        ntor_seed: None,
        intro_index,
        last_progress: std::time::Instant::now(),
    };
    {
        let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
        guard.circuits.insert(*cookie.as_ref(), ());
    }

    established_rx
        .recv(|error| FailedAttemptError::RendezvousEstablish {
            error,
            rend_pt: rend_pt_id.clone(),
        })
        .await?;
    pair.state = PairState::RendReady;

    // Drive the introduction phase to a conclusion: send INTRODUCE1, and if
    // the service rejects it, re-extend this same introduction circuit to a
    // different introduction point and try again rather than abandoning the
    // whole attempt (the rend circuit and its cookie registration stay put
    // throughout).
    let mut ipt = ipt;
    let mut excluded_here: Vec<RsaIdentity> = exclude_set.to_vec();
    let hs_ntor = loop {
        let rend_link_specifiers = owned_target
            .linkspecs()
            .map_err(|error| FailedAttemptError::Bug(internal!("rendezvous point has bad link specifiers: {}", error)))?;

        let (ack_rx, hs_ntor) = rend_handshake::send_introduce1(
            &intro_circuit,
            intro_index,
            &ipt,
            cookie,
            &rend_link_specifiers,
            owned_target.ntor_onion_key(),
            subcredential,
            &mut rng,
        )
        .await?;
        pair.state = PairState::IntroAckWait;

        let ack = ack_rx
            .recv(|error| FailedAttemptError::IntroSendFailed { error, intro_index })
            .await?;

        match rend_handshake::on_introduce_ack(&mut pair, &ack) {
            rend_handshake::StateMachineOutcome::Success => {
                rend_handshake::mark_for_close(&intro_circuit, DestroyReason::FINISHED);
                break hs_ntor;
            }
            rend_handshake::StateMachineOutcome::Transient => break hs_ntor,
            rend_handshake::StateMachineOutcome::Permanent => {
                if let Some(rsa_id) = ipt_select::legacy_rsa_id(&ipt) {
                    excluded_here.push(rsa_id);
                }

                let pick = {
                    let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
                    guard.intro_failures.note_failure(
                        ipt_select::failure_key(hsid, &ipt),
                        std::time::Instant::now(),
                        IntroFailureKind::Generic,
                    );
                    let mut rng = rand::thread_rng();
                    ipt_select::pick_intro(
                        hsid,
                        desc,
                        netdir,
                        &mut guard.intro_failures,
                        &connector.config,
                        &excluded_here,
                        true,
                        &mut rng,
                    )
                };

                let Some(Ok((new_ipt, new_target))) = pick else {
                    // Flip ack-wait to IntroAcked before closing, so a
                    // timeout or other late event for this same circuit
                    // doesn't note a second intro-point failure.
                    pair.state = PairState::IntroAcked;
                    let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
                    guard.circuits.remove(&*cookie.as_ref());
                    drop(guard);
                    rend_handshake::mark_for_close(&intro_circuit, DestroyReason::FINISHED);
                    rend_handshake::mark_for_close(&rend_circuit, DestroyReason::FINISHED);
                    pair.state = PairState::Failed;
                    return Err(FailedAttemptError::Bug(internal!(
                        "no usable introduction points remain after rejection"
                    )));
                };

                let new_index = desc
                    .intro_points
                    .iter()
                    .position(|candidate| candidate.ipt_sid_key().as_ref() == new_ipt.ipt_sid_key().as_ref())
                    .map(IntroPtIndex)
                    .unwrap_or(intro_index);
                let new_owned_target = OwnedCircTarget::from_circ_target(&new_target);

                match rend_handshake::reextend_intro(&mut pair, &intro_circuit, &new_owned_target, new_index).await {
                    Ok(()) => {
                        ipt = new_ipt;
                        intro_index = new_index;
                        owned_target = new_owned_target;
                    }
                    Err(error) => {
                        pair.state = PairState::IntroAcked;
                        let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
                        guard.circuits.remove(&*cookie.as_ref());
                        drop(guard);
                        rend_handshake::mark_for_close(&intro_circuit, DestroyReason::FINISHED);
                        rend_handshake::mark_for_close(&rend_circuit, DestroyReason::FINISHED);
                        pair.state = PairState::Failed;
                        return Err(error);
                    }
                }
            }
        }
    };

    let rend2 = rend2_rx
        .recv(|error| FailedAttemptError::RendezvousCircuitCompletionExpected {
            error,
            intro_index,
            rend_pt: rend_pt_id.clone(),
        })
        .await?;

    let keygen = match rend_handshake::handle_rendezvous2(&hs_ntor, &rend2, intro_index, rend_pt_id.clone()) {
        Ok(keygen) => keygen,
        Err(error) => {
            let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
            guard.circuits.remove(&*cookie.as_ref());
            drop(guard);
            rend_handshake::mark_for_close(&rend_circuit, DestroyReason::PROTOCOL);
            return Err(error);
        }
    };

    if !matches!(
        rend_handshake::on_rendezvous2(&mut pair, keygen),
        rend_handshake::StateMachineOutcome::Success
    ) {
        let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
        guard.circuits.remove(&*cookie.as_ref());
        drop(guard);
        rend_handshake::mark_for_close(&rend_circuit, DestroyReason::PROTOCOL);
        return Err(FailedAttemptError::Bug(internal!(
            "RENDEZVOUS2 arrived in an unexpected circuit state"
        )));
    }

    {
        let mut guard = ctx.lock().map_err(|_| internal!("HS client context poisoned"))?;
        guard.circuits.remove(&*cookie.as_ref());
    }

    let keygen = pair
        .ntor_seed
        .take()
        .ok_or_else(|| FailedAttemptError::Bug(internal!("rendezvous joined with no key seed installed")))?;

    rend_circuit
        .extend_virtual(
            RelayProtocol::HsV3,
            HandshakeRole::Initiator,
            keygen,
            &CircParameters::default(),
            &tor_protover::Protocols::default(),
        )
        .await
        .map_err(|error| FailedAttemptError::RendezvousCircuitCompletionExpected {
            error,
            intro_index,
            rend_pt: rend_pt_id,
        })?;

    Ok(rend_circuit)
}

/// Actually make a HS connection, updating our recorded state as necessary
///
/// This function handles all necessary retrying of fallible operations
/// (and, therefore, must also limit the total work done for a particular call).
pub(crate) async fn connect<R: Runtime>(
    connector: &HsClientConnector<R, Data>,
    hsid: HsId,
    _data: &mut Data,
    _secret_keys: HsClientSecretKeys,
) -> Result<ClientCirc, HsClientConnError> {
    let netdir = connector
        .netdir_provider
        .netdir(Timeliness::Timely)
        .map_err(|_| HsClientConnError::NoHsDirs)?;
    let period = netdir.hs_time_period();
    let (blinded_key, subcredential) = blinded_id_and_subcredential(hsid, period)?;
    let blinded_id = blinded_key.id();
    let subcredential = ZeroOnDropSubcredential::new(subcredential);

    let desc = obtain_descriptor(connector, hsid, blinded_id, subcredential.get(), &connector.ctx).await?;
    // `blinded_key` stays alive for the rest of the attempt so its backing
    // bytes are wiped only once the connection either succeeds or this
    // function gives up, not the moment `blinded_id` was copied out of it.
    let _blinded_key = blinded_key;

    if desc.intro_points.is_empty() {
        return Err(HsClientConnError::NoUsableIntroPoints);
    }

    let mut attempts = RetryError::in_attempt_to("connect to onion service");
    let mut excluded: Vec<RsaIdentity> = Vec::new();
    for _ in 0..MAX_INTRO_ATTEMPTS {
        match attempt_rendezvous(connector, &netdir, hsid, &desc, *subcredential.get(), &excluded, &connector.ctx)
            .await
        {
            Ok(circuit) => return Ok(circuit),
            Err(error) => {
                debug!("onion service connection attempt failed: {}", error);
                // Exclude the introduction point this attempt just used, so
                // a retry doesn't immediately pick the same one again.
                if let Some(rsa_id) = error
                    .intro_index()
                    .and_then(|idx| desc.intro_points.get(idx.0))
                    .and_then(ipt_select::legacy_rsa_id)
                {
                    excluded.push(rsa_id);
                }
                attempts.push(Report(error));
            }
        }
    }
    Err(HsClientConnError::Failed(attempts))
}

#[async_trait]
impl MockableConnectorData for Data {
    type ClientCirc = ClientCirc;
    type MockGlobalState = ();

    async fn connect<R: Runtime>(
        connector: &HsClientConnector<R, Self>,
        hsid: HsId,
        data: &mut Self,
        secret_keys: HsClientSecretKeys,
    ) -> Result<Self::ClientCirc, HsClientConnError> {
        connect(connector, hsid, data, secret_keys).await
    }

    fn circuit_is_ok(circuit: &Self::ClientCirc) -> bool {
        !circuit.is_closing()
    }
}
