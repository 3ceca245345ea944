//! The rendezvous state machine (C5): drives one introduction/rendezvous
//! circuit pair from the moment both circuits are open through to a joined,
//! end-to-end encrypted virtual circuit.
//!
//! Each pair is tracked independently; the intro circuit's and the rend
//! circuit's own events may arrive in either order, and this module accepts
//! both orderings and reaches the same terminal state either way.

use std::time::Instant;

use rand::{CryptoRng, RngCore};

use tor_bytes::Writer;
use tor_cell::chancell::msg::DestroyReason;
use tor_cell::relaycell::hs::{
    AuthKeyType, EstablishRendezvous, Introduce1, IntroduceAck, IntroduceAckStatus, Rendezvous2,
    RendezvousEstablished,
};
use tor_cell::relaycell::msg::AnyRelayMsg;
use tor_cell::relaycell::{RelayCmd, UnparsedRelayMsg};
use tor_error::internal;
use tor_hscrypto::pk::{HsIntroPtSessionIdKey, HsSvcNtorKey};
use tor_hscrypto::RendCookie;
use tor_linkspec::{CircTarget, EncodedLinkSpec};
use tor_llcrypto::pk::curve25519;
use tor_netdoc::doc::hsdesc::IntroPointDesc;
use tor_proto::circuit::{CircParameters, ClientCirc, MetaCellDisposition, MsgHandler, TargetHop};
use tor_proto::crypto::handshake::hs_ntor::{
    HsNtorClientState, HsNtorHkdfKeyGenerator, HsNtorServiceInfo,
};

use crate::err::{FailedAttemptError, IntroPtIndex};
use crate::proto_oneshot;
use crate::zeroize_buf::ZeroOnDropSubcredential;

/// Where one intro/rend circuit pair currently stands.
///
/// Mirrors the intro circuit's and the rend circuit's combined purpose, the
/// way C Tor tracks them as a pair of circuit-purpose fields rather than as
/// one joint enum; kept as a single enum here since every transition this
/// module implements changes both at once.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum PairState {
    /// Intro circuit built; `INTRODUCE1` not yet sent.
    Introducing,
    /// `INTRODUCE1` sent; awaiting `INTRODUCE_ACK`.
    IntroAckWait,
    /// Ack received (success path); intro circuit closing.
    IntroAcked,
    /// Rend circuit built; `ESTABLISH_RENDEZVOUS` sent.
    RendEstablishing,
    /// `RENDEZVOUS_ESTABLISHED` received; awaiting `RENDEZVOUS2`.
    RendReady,
    /// Same as `RendReady`, but the ack was already observed.
    RendReadyIntroAcked,
    /// `RENDEZVOUS2` authenticated; end-to-end keys installed; handed off.
    RendJoined,
    /// Both circuits marked for close.
    Failed,
}

/// Outcome of a state machine entry point, as returned to its caller.
///
/// The three variants correspond directly to the three failure codes this
/// component's entry points are specified to return.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum StateMachineOutcome {
    /// Success, or transition queued successfully.
    Success,
    /// Recovery action (refetch, re-extend) has been scheduled; caller
    /// should leave the pair parked rather than treat this as fatal.
    Transient,
    /// Both circuits have been marked for close.
    Permanent,
}

/// Everything this module needs to know about one intro/rend circuit pair.
///
/// Built by `connect.rs` once both circuits exist, and driven forward by the
/// functions in this module as events arrive on either circuit.
pub(crate) struct RendPair {
    /// State of the pair.
    pub(crate) state: PairState,
    /// The rendezvous cookie this pair was registered under in the
    /// [`crate::cache::CircuitMap`].
    pub(crate) cookie: RendCookie,
    /// The rendezvous point's virtual-hop key seed, once `RENDEZVOUS2` has
    /// been authenticated.
    pub(crate) ntor_seed: Option<HsNtorHkdfKeyGenerator>,
    /// Index of the introduction point currently in use, for error reporting.
    pub(crate) intro_index: IntroPtIndex,
    /// When this pair last made progress; used for building-expiry checks by
    /// the caller.
    pub(crate) last_progress: Instant,
}

/// Build a fresh, random rendezvous cookie.
pub(crate) fn fresh_cookie<R: RngCore + CryptoRng>(rng: &mut R) -> RendCookie {
    let mut bytes = [0_u8; EstablishRendezvous::COOKIE_LEN];
    rng.fill_bytes(&mut bytes);
    RendCookie::from(bytes)
}

/// Two-stage message handler installed on a rend circuit's control
/// conversation.
///
/// `RENDEZVOUS_ESTABLISHED` arrives first; delivering it must *not* end the
/// conversation, since the same conversation is later used to deliver
/// `RENDEZVOUS2` once the introduction has gone through. Composes two
/// one-shot senders rather than reusing a single [`proto_oneshot::Sender`],
/// since that type only ever expects one message.
pub(crate) struct RendCircHandler {
    /// Still `Some` until `RENDEZVOUS_ESTABLISHED` has been delivered.
    established: Option<proto_oneshot::Sender<RendezvousEstablished>>,
    /// Delivered once `RENDEZVOUS2` arrives; ends the conversation.
    rend2: proto_oneshot::Sender<Rendezvous2>,
}

impl RendCircHandler {
    /// Wrap a pair of senders into a handler ready to install on a rend
    /// circuit's conversation.
    pub(crate) fn new(
        established: proto_oneshot::Sender<RendezvousEstablished>,
        rend2: proto_oneshot::Sender<Rendezvous2>,
    ) -> Self {
        RendCircHandler {
            established: Some(established),
            rend2,
        }
    }
}

impl MsgHandler for RendCircHandler {
    fn handle_msg(&mut self, msg: UnparsedRelayMsg) -> tor_proto::Result<MetaCellDisposition> {
        match (msg.cmd(), self.established.as_ref()) {
            (RelayCmd::RENDEZVOUS_ESTABLISHED, Some(_)) => {
                let any = msg.decode::<AnyRelayMsg>()?.into_msg();
                let mut sender = self
                    .established
                    .take()
                    .expect("established sender checked Some above");
                sender.deliver_expected_message(any, MetaCellDisposition::Consumed)
            }
            (RelayCmd::RENDEZVOUS2, _) => {
                let any = msg.decode::<AnyRelayMsg>()?.into_msg();
                self.rend2
                    .deliver_expected_message(any, MetaCellDisposition::ConversationFinished)
            }
            (cmd, _) => Err(tor_proto::Error::CircProto(format!(
                "unexpected {cmd} on rendezvous circuit"
            ))),
        }
    }
}

/// *Rend circuit opened* transition: send `ESTABLISH_RENDEZVOUS` with a fresh
/// cookie, and install the handler that will later receive
/// `RENDEZVOUS_ESTABLISHED` and `RENDEZVOUS2`.
///
/// Returns the cookie the caller should register the pair under in the
/// `CircuitMap`, along with the receivers the caller awaits on.
pub(crate) async fn establish_rendezvous<R: RngCore + CryptoRng>(
    rend_circuit: &ClientCirc,
    rend_pt: &safelog::Redacted<tor_llcrypto::pk::rsa::RsaIdentity>,
    rng: &mut R,
) -> Result<
    (
        RendCookie,
        proto_oneshot::Receiver<RendezvousEstablished>,
        proto_oneshot::Receiver<Rendezvous2>,
    ),
    FailedAttemptError,
> {
    let cookie = fresh_cookie(rng);
    let (established_tx, established_rx) = proto_oneshot::channel();
    let (rend2_tx, rend2_rx) = proto_oneshot::channel();
    let handler = RendCircHandler::new(established_tx, rend2_tx);

    let establish = EstablishRendezvous::new(*cookie.as_ref());
    rend_circuit
        .start_conversation(
            Some(AnyRelayMsg::EstablishRendezvous(establish)),
            handler,
            TargetHop::LastHop,
        )
        .await
        .map_err(|error| FailedAttemptError::RendezvousEstablish {
            error,
            rend_pt: rend_pt.clone(),
        })?;

    Ok((cookie, established_rx, rend2_rx))
}

/// Build the plaintext body that goes into an `INTRODUCE1` cell's encrypted
/// field, per rend-spec-v3's `INTRODUCE1`/`INTRODUCE2` payload layout:
/// `RENDEZVOUS_COOKIE` (20 bytes), `N_EXTENSIONS` (1 byte, always 0 here),
/// the onion key type/length/bytes, and the rendezvous point's link
/// specifiers.
///
/// No typed encoder for this exists anywhere in the corpus — the cell codec
/// (`tor_cell::relaycell::hs`) only frames the outer `INTRODUCE1`/`INTRODUCE2`
/// structure, leaving this inner payload to whoever drives the handshake.
fn encode_introduce1_plaintext(
    cookie: RendCookie,
    rend_link_specifiers: &[EncodedLinkSpec],
    rend_onion_key: &curve25519::PublicKey,
) -> Result<Vec<u8>, tor_bytes::EncodeError> {
    /// Onion key type for a ntor key, per rend-spec-v3 section 3.2.2.
    const ONION_KEY_TYPE_NTOR: u8 = 0x01;

    let mut body = Vec::new();
    body.write(&cookie)?;
    body.write_u8(0); // N_EXTENSIONS: none defined.
    body.write_u8(ONION_KEY_TYPE_NTOR);
    body.write_u16(u16::try_from(rend_onion_key.as_bytes().len())
        .map_err(|_| tor_bytes::EncodeError::BadLengthValue)?);
    body.write_all(rend_onion_key.as_bytes());
    body.write_u8(
        u8::try_from(rend_link_specifiers.len())
            .map_err(|_| tor_bytes::EncodeError::BadLengthValue)?,
    );
    for ls in rend_link_specifiers {
        body.write(ls)?;
    }
    Ok(body)
}

/// Reconstruct the associated-data prefix that `Introduce::encode_onto`
/// writes ahead of the encrypted field, so it can be fed to
/// [`HsNtorClientState::client_send_intro`] as `intro_header` (it is
/// authenticated but never itself encrypted).
fn introduce1_header(auth_key: &HsIntroPtSessionIdKey) -> Result<Vec<u8>, tor_bytes::EncodeError> {
    let auth_key_bytes = auth_key.as_ref().as_bytes();
    let mut header = Vec::new();
    header.write_all(&[0_u8; 20]); // legacy_key_id, always zero for v3.
    header.write_u8(AuthKeyType::ED25519_SHA3_256.get());
    header.write_u16(
        u16::try_from(auth_key_bytes.len()).map_err(|_| tor_bytes::EncodeError::BadLengthValue)?,
    );
    header.write_all(auth_key_bytes);
    header.write_u8(0); // n_ext: no INTRODUCE1 extensions.
    Ok(header)
}

/// `hs_client_send_introduce1`: build and send the `INTRODUCE1` cell for a
/// ready intro/rend pair, and install the handler awaiting its
/// `INTRODUCE_ACK`.
///
/// `ipt` is the introduction point resolved from the descriptor; `rng` seeds
/// the ephemeral hs_ntor keypair. On success, returns the ack receiver the
/// caller should await, and the client-side handshake state needed to
/// process the later `RENDEZVOUS2`.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn send_introduce1<R: RngCore + CryptoRng>(
    intro_circuit: &ClientCirc,
    intro_index: IntroPtIndex,
    ipt: &IntroPointDesc,
    cookie: RendCookie,
    rend_link_specifiers: &[EncodedLinkSpec],
    rend_onion_key: &curve25519::PublicKey,
    subcredential: tor_hscrypto::Subcredential,
    rng: &mut R,
) -> Result<
    (
        proto_oneshot::Receiver<IntroduceAck>,
        HsNtorClientState,
    ),
    FailedAttemptError,
> {
    let bug = |e: tor_bytes::EncodeError| {
        FailedAttemptError::Bug(internal!("failed to encode INTRODUCE1 payload: {}", e))
    };

    let plaintext = encode_introduce1_plaintext(cookie, rend_link_specifiers, rend_onion_key)
        .map_err(bug)?;
    let header = introduce1_header(ipt.ipt_sid_key()).map_err(bug)?;

    let service_info = HsNtorServiceInfo::new(
        svc_ntor_key(ipt),
        ipt.ipt_sid_key().clone(),
        *ZeroOnDropSubcredential::new(subcredential).get(),
    );
    let hs_ntor = HsNtorClientState::new(rng, service_info);

    let encrypted = hs_ntor
        .client_send_intro(&header, &plaintext)
        .map_err(|error| FailedAttemptError::Bug(internal!("hs_ntor intro encryption failed: {}", error)))?;

    let auth_key = ipt.ipt_sid_key().as_ref().as_bytes().to_vec();
    let introduce1 = Introduce1::new(AuthKeyType::ED25519_SHA3_256, auth_key, encrypted);

    let (ack_tx, ack_rx) = proto_oneshot::channel();
    intro_circuit
        .start_conversation(
            Some(AnyRelayMsg::Introduce1(introduce1)),
            IntroAckHandler::new(ack_tx),
            TargetHop::LastHop,
        )
        .await
        .map_err(|error| FailedAttemptError::IntroSendFailed { error, intro_index })?;

    Ok((ack_rx, hs_ntor))
}

/// Single-shot message handler for an intro circuit's control conversation:
/// delivers the one `INTRODUCE_ACK` it expects, then ends the conversation.
struct IntroAckHandler(proto_oneshot::Sender<IntroduceAck>);

impl IntroAckHandler {
    /// Wrap a sender into a handler ready to install on an intro circuit's
    /// conversation.
    fn new(sender: proto_oneshot::Sender<IntroduceAck>) -> Self {
        IntroAckHandler(sender)
    }
}

impl MsgHandler for IntroAckHandler {
    fn handle_msg(&mut self, msg: UnparsedRelayMsg) -> tor_proto::Result<MetaCellDisposition> {
        match msg.cmd() {
            RelayCmd::INTRODUCE_ACK => {
                let any = msg.decode::<AnyRelayMsg>()?.into_msg();
                self.0
                    .deliver_expected_message(any, MetaCellDisposition::ConversationFinished)
            }
            cmd => Err(tor_proto::Error::CircProto(format!(
                "unexpected {cmd} on introduction circuit"
            ))),
        }
    }
}

/// The `KP_hss_ntor` key for an introduction point. Pulled out as its own
/// function only so the borrow in [`send_introduce1`] stays short-lived.
fn svc_ntor_key(ipt: &IntroPointDesc) -> HsSvcNtorKey {
    ipt.svc_ntor_key().clone()
}

/// Process a `RENDEZVOUS2` cell once it arrives, completing the hs_ntor
/// handshake and returning the key seed to install as the rend circuit's
/// virtual hop.
///
/// The MAC check (the handshake's "security-critical gate") happens inside
/// [`HsNtorClientState::client_receive_rend`] itself, in constant time; a
/// mismatch surfaces here as an ordinary handshake error.
pub(crate) fn handle_rendezvous2(
    hs_ntor: &HsNtorClientState,
    rend2: &Rendezvous2,
    intro_index: IntroPtIndex,
    rend_pt: safelog::Redacted<tor_llcrypto::pk::rsa::RsaIdentity>,
) -> Result<HsNtorHkdfKeyGenerator, FailedAttemptError> {
    hs_ntor
        .client_receive_rend(rend2.message())
        .map_err(|error| FailedAttemptError::RendezvousCircuitCompletionExpected {
            error,
            intro_index,
            rend_pt,
        })
}

/// Outcome of processing an `INTRODUCE_ACK`, for the caller to act on.
pub(crate) enum IntroAckOutcome {
    /// The service accepted the introduction; wait for `RENDEZVOUS2` on the
    /// paired rend circuit.
    Accepted,
    /// The introduction point reported failure (malformed cell, or no
    /// circuit from the service); caller should record the failure and try
    /// to re-extend to a different introduction point.
    Rejected,
    /// An ack status we don't recognize; logged, no state change.
    Unrecognized(IntroduceAckStatus),
}

/// Classify an `INTRODUCE_ACK`'s status code.
pub(crate) fn classify_introduce_ack(ack: &IntroduceAck) -> IntroAckOutcome {
    match ack.status() {
        s if s == IntroduceAckStatus::SUCCESS => IntroAckOutcome::Accepted,
        s if s == IntroduceAckStatus::NOT_RECOGNIZED
            || s == IntroduceAckStatus::BAD_MESSAGE_FORMAT
            || s == IntroduceAckStatus::CANT_RELAY =>
        {
            IntroAckOutcome::Rejected
        }
        other => IntroAckOutcome::Unrecognized(other),
    }
}

/// *`INTRODUCE_ACK` received* transition: fold the ack's outcome into the
/// pair's state.
///
/// `RENDEZVOUS2` is treated as authoritative proof of success in its own
/// right (see [`on_rendezvous2`]); this function only ever moves the pair
/// *towards* `RendJoined`, never past it, so it is safe to call even if
/// `RENDEZVOUS2` already arrived first.
pub(crate) fn on_introduce_ack(pair: &mut RendPair, ack: &IntroduceAck) -> StateMachineOutcome {
    match classify_introduce_ack(ack) {
        IntroAckOutcome::Accepted => {
            pair.last_progress = Instant::now();
            match pair.state {
                PairState::IntroAckWait => {
                    pair.state = PairState::IntroAcked;
                    StateMachineOutcome::Success
                }
                PairState::RendReady => {
                    pair.state = PairState::RendReadyIntroAcked;
                    StateMachineOutcome::Success
                }
                // RENDEZVOUS2 already joined the pair before the ack caught
                // up with it; nothing left to do.
                PairState::RendJoined => StateMachineOutcome::Success,
                _ => StateMachineOutcome::Transient,
            }
        }
        IntroAckOutcome::Rejected => {
            pair.state = PairState::Failed;
            StateMachineOutcome::Permanent
        }
        // An ack status we don't recognize: log and leave the pair as it is,
        // waiting for whichever comes first.
        IntroAckOutcome::Unrecognized(_) => StateMachineOutcome::Transient,
    }
}

/// *`RENDEZVOUS2` received* transition: install the derived key seed and
/// join the pair.
///
/// A validated `RENDEZVOUS2` is accepted as proof of success regardless of
/// whether `INTRODUCE_ACK` has been seen yet: the rendezvous point only ever
/// relays `RENDEZVOUS2` after the service has processed the client's
/// `INTRODUCE2`, so its arrival implies the introduction succeeded even if
/// the ack itself is still in flight or was lost.
pub(crate) fn on_rendezvous2(
    pair: &mut RendPair,
    keygen: HsNtorHkdfKeyGenerator,
) -> StateMachineOutcome {
    match pair.state {
        PairState::RendJoined => {}
        PairState::Introducing | PairState::RendEstablishing | PairState::Failed => {
            // RENDEZVOUS2 arriving before the rend circuit reported itself
            // ready, or after the pair already failed, is a protocol
            // violation from whichever side sent it; reject the join.
            return StateMachineOutcome::Permanent;
        }
        _ => {
            pair.ntor_seed = Some(keygen);
            pair.state = PairState::RendJoined;
        }
    }
    pair.last_progress = Instant::now();
    StateMachineOutcome::Success
}

/// *Re-extend to a different introduction point* transition, taken after an
/// `INTRODUCE_ACK` rejection.
///
/// Extends the already-open introduction circuit to `new_target` in place,
/// reusing whatever `RELAY_EARLY` cells it has left, rather than tearing the
/// pair down and starting a fresh circuit: the caller is expected to retry
/// `send_introduce1` over the same `intro_circuit` immediately afterward.
/// Refreshes `last_progress` and returns the pair to `Introducing`, so it
/// stays open rather than transitioning to `Failed`.
pub(crate) async fn reextend_intro<Tg: CircTarget>(
    pair: &mut RendPair,
    intro_circuit: &ClientCirc,
    new_target: &Tg,
    new_intro_index: IntroPtIndex,
) -> Result<(), FailedAttemptError> {
    extend_to_new_exit(intro_circuit, new_target, new_intro_index).await?;
    pair.intro_index = new_intro_index;
    pair.last_progress = Instant::now();
    pair.state = PairState::Introducing;
    Ok(())
}

/// Extend `circ` to `target` as a new last hop.
///
/// Used both for the ordinary forward build (via [`ClientCirc::extend`]) and,
/// here, to fold a freshly re-picked introduction point into an
/// already-open introduction circuit instead of abandoning it.
async fn extend_to_new_exit<Tg: CircTarget>(
    circ: &ClientCirc,
    target: &Tg,
    intro_index: IntroPtIndex,
) -> Result<(), FailedAttemptError> {
    circ.extend(target, CircParameters::default())
        .await
        .map_err(|error| FailedAttemptError::IntroReextend { error, intro_index })
}

/// Mark `circ` for close with `reason`, and log it.
///
/// Every terminal path through a rendezvous attempt ends with both circuits
/// of the pair marked for close exactly once, each with the reason that best
/// describes why that particular circuit is done: `FINISHED` when it served
/// its purpose (or ran out of introduction points to try), `PROTOCOL` when
/// the peer on the other end misbehaved.
pub(crate) fn mark_for_close(circ: &ClientCirc, reason: DestroyReason) {
    tracing::debug!("{}: closing circuit. Reason: {}", circ.unique_id(), reason);
    circ.terminate();
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
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn cookies_are_fresh_each_time() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let a = fresh_cookie(&mut rng);
        let b = fresh_cookie(&mut rng);
        assert_ne!(a.as_ref(), b.as_ref());
    }

    #[test]
    fn introduce1_plaintext_starts_with_cookie_and_has_no_extensions() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let cookie = fresh_cookie(&mut rng);
        let key = curve25519::StaticSecret::random_from_rng(&mut rng);
        let pubkey = curve25519::PublicKey::from(&key);

        let body = encode_introduce1_plaintext(cookie, &[], &pubkey).unwrap();
        assert_eq!(&body[0..20], cookie.as_ref());
        assert_eq!(body[20], 0); // n_extensions
        assert_eq!(body[21], 0x01); // onion key type
    }

    #[test]
    fn ack_status_classification() {
        assert!(matches!(
            classify_introduce_ack(&IntroduceAck::new(IntroduceAckStatus::SUCCESS)),
            IntroAckOutcome::Accepted
        ));
        assert!(matches!(
            classify_introduce_ack(&IntroduceAck::new(IntroduceAckStatus::CANT_RELAY)),
            IntroAckOutcome::Rejected
        ));
        assert!(matches!(
            classify_introduce_ack(&IntroduceAck::new(IntroduceAckStatus::from(999_u16))),
            IntroAckOutcome::Unrecognized(_)
        ));
    }

    fn fresh_pair(state: PairState) -> RendPair {
        RendPair {
            state,
            cookie: fresh_cookie(&mut ChaCha20Rng::seed_from_u64(3)),
            ntor_seed: None,
            intro_index: IntroPtIndex(0),
            last_progress: Instant::now(),
        }
    }

    fn fake_keygen() -> HsNtorHkdfKeyGenerator {
        HsNtorHkdfKeyGenerator::new(vec![0_u8; 32].into())
    }

    #[test]
    fn introduce_ack_success_advances_whichever_half_is_waiting() {
        let mut pair = fresh_pair(PairState::IntroAckWait);
        assert_eq!(
            on_introduce_ack(&mut pair, &IntroduceAck::new(IntroduceAckStatus::SUCCESS)),
            StateMachineOutcome::Success
        );
        assert_eq!(pair.state, PairState::IntroAcked);

        let mut pair = fresh_pair(PairState::RendReady);
        assert_eq!(
            on_introduce_ack(&mut pair, &IntroduceAck::new(IntroduceAckStatus::SUCCESS)),
            StateMachineOutcome::Success
        );
        assert_eq!(pair.state, PairState::RendReadyIntroAcked);
    }

    #[test]
    fn introduce_ack_rejection_fails_the_pair() {
        let mut pair = fresh_pair(PairState::IntroAckWait);
        assert_eq!(
            on_introduce_ack(&mut pair, &IntroduceAck::new(IntroduceAckStatus::CANT_RELAY)),
            StateMachineOutcome::Permanent
        );
        assert_eq!(pair.state, PairState::Failed);
    }

    #[test]
    fn rendezvous2_joins_even_if_ack_has_not_arrived_yet() {
        let mut pair = fresh_pair(PairState::RendReady);
        assert_eq!(
            on_rendezvous2(&mut pair, fake_keygen()),
            StateMachineOutcome::Success
        );
        assert_eq!(pair.state, PairState::RendJoined);
        assert!(pair.ntor_seed.is_some());
    }

    #[test]
    fn rendezvous2_before_rend_established_is_rejected() {
        let mut pair = fresh_pair(PairState::Introducing);
        assert_eq!(
            on_rendezvous2(&mut pair, fake_keygen()),
            StateMachineOutcome::Permanent
        );
        assert_eq!(pair.state, PairState::Introducing);
    }

    // `reextend_intro` now drives a real circuit extension and needs a live
    // `ClientCirc` to do it, which this crate's unit tests have no way to
    // build; the failure-kind bookkeeping it relies on (a `Generic` failure
    // excluding a point at once) is covered directly in cache.rs and
    // ipt_select.rs, and the full re-extension path is left to
    // connector-level integration tests.
}
