//! The waiter registry and orchestration layer (C6): keeps user-originated
//! streams parked against the right coarse state while their onion service
//! connection attempt makes progress, and wakes them when it does.
//!
//! Ownership of streams themselves belongs to the surrounding stream
//! subsystem; this module only ever reads a stream's onion identity and
//! moves its coarse state, the same division of labor `state.rs`'s
//! `MockableConnectorData` draws between this crate and its caller.

use tor_hscrypto::pk::HsId;

use crate::cache::{ClientContext, IntroPointFailureState};
use crate::config::HsClientConfig;
use crate::err::WaiterCloseReason;
use crate::ipt_select::{self, DescriptorIntroPoints};

/// Coarse state of one user-originated connection waiting on an onion
/// service, mirroring the `WaiterStream` states named in the glossary.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum WaiterState {
    /// Parked: no usable cached descriptor yet, waiting for one to arrive.
    AwaitingDescriptor,
    /// Parked: descriptor in hand, waiting for the circuit attacher to join
    /// it to an established rendezvous.
    AwaitingCircuit,
    /// Handed off to the circuit attacher; no longer this module's concern.
    Attached,
}

/// The stream-subsystem seam this core drives streams through.
///
/// A real connector implements this over its own stream bookkeeping; this
/// crate never constructs a stream itself, only ever queries and mutates
/// ones the implementation already owns.
pub trait WaiterRegistry {
    /// An opaque handle identifying one waiting stream.
    type Stream: Clone;

    /// The onion identity `stream` is waiting on.
    fn identity(&self, stream: &Self::Stream) -> HsId;

    /// Every stream currently in `state`.
    ///
    /// Scanned rather than indexed by identity, mirroring the "scan over
    /// stream connections filtered by state" this component is specified to
    /// do; a real implementation is free to keep a smarter index underneath.
    fn streams_in_state(&self, state: WaiterState) -> Vec<Self::Stream>;

    /// Move `stream` into `state`, refreshing its "parked since" timestamp.
    fn set_state(&mut self, stream: &Self::Stream, state: WaiterState);

    /// Detach `stream` from this connection attempt, for the given reason.
    fn close(&mut self, stream: &Self::Stream, reason: WaiterCloseReason);
}

/// Park every stream waiting on `identity` into `AwaitingDescriptor`,
/// removing it from the circuit-attacher's pending set in the process (by
/// virtue of no longer being `AwaitingCircuit`).
pub(crate) fn park_for_descriptor<R: WaiterRegistry>(registry: &mut R, identity: HsId) {
    for stream in registry.streams_in_state(WaiterState::AwaitingCircuit) {
        if registry.identity(&stream) == identity {
            registry.set_state(&stream, WaiterState::AwaitingDescriptor);
        }
    }
}

/// React to a newly cached descriptor for `identity`: wake every waiter
/// parked on it.
///
/// If the descriptor turns out to have no usable introduction point, every
/// waiter is closed with [`WaiterCloseReason::ResolveFailed`] and the
/// HSDir-tried history for `identity` is purged, so a subsequent attempt by
/// the user isn't blocked by a lookup this descriptor already exhausted.
/// Otherwise every waiter is moved to `AwaitingCircuit` for the circuit
/// attacher to pick up.
pub(crate) fn wake_on_descriptor<R: WaiterRegistry, Desc: DescriptorIntroPoints>(
    registry: &mut R,
    identity: HsId,
    desc: &Desc,
    intro_failures: &mut IntroPointFailureState,
    config: &HsClientConfig,
    lookup_key: &str,
    hsdir_history: &mut crate::cache::HsDirTriedHistory,
) {
    let has_usable_intro = desc.intro_points().iter().any(|ipt| {
        let key = ipt_select::failure_key(identity, ipt);
        ipt_select::is_usable(&key, intro_failures, config)
    });

    for stream in registry.streams_in_state(WaiterState::AwaitingDescriptor) {
        if registry.identity(&stream) != identity {
            continue;
        }
        if has_usable_intro {
            registry.set_state(&stream, WaiterState::AwaitingCircuit);
        } else {
            registry.close(&stream, WaiterCloseReason::ResolveFailed);
        }
    }

    if !has_usable_intro {
        hsdir_history.reset(lookup_key);
    }
}

/// React to a directory-info-improvement tick: reissue a fetch for every
/// identity with a waiter still parked in `AwaitingDescriptor`.
///
/// `refetch` is the caller-supplied closure driving the actual eligibility
/// check and fetch launch (see [`crate::desc_fetch::refetch`]); keeping it
/// injected here, rather than importing `desc_fetch` directly, avoids this
/// module needing to know the fetch coordinator's generic parameters.
pub(crate) fn retry_all_on_dir_info_changed<R: WaiterRegistry>(
    registry: &R,
    mut refetch: impl FnMut(HsId),
) {
    let mut seen = std::collections::HashSet::new();
    for stream in registry.streams_in_state(WaiterState::AwaitingDescriptor) {
        let identity = registry.identity(&stream);
        if seen.insert(identity) {
            refetch(identity);
        }
    }
}

/// React to the user's "new identity" privacy signal: tear down everything
/// that could link future activity to past activity.
///
/// Order matters: fetches are cancelled first (via `cancel_fetch`, which
/// marks the underlying directory connection for close) so that the cache
/// purges that follow can't race with a response body that was already on
/// its way in. Waiters themselves are left parked in `AwaitingDescriptor`;
/// they'll refetch on the next directory-info-changed tick.
pub(crate) fn purge_remote_detectable_state<R: WaiterRegistry, Desc, C>(
    registry: &R,
    mut cancel_fetch: impl FnMut(HsId),
    ctx: &mut ClientContext<Desc, C>,
) {
    let mut seen = std::collections::HashSet::new();
    for stream in registry.streams_in_state(WaiterState::AwaitingDescriptor) {
        let identity = registry.identity(&stream);
        if seen.insert(identity) {
            cancel_fetch(identity);
        }
    }

    ctx.intro_failures = IntroPointFailureState::default();
    ctx.descriptors = crate::cache::DescriptorCache::default();
    ctx.hsdir_history = crate::cache::HsDirTriedHistory::default();
}

/// Record that a connection attempt for `lookup_key` succeeded, so future
/// attempts aren't blocked by the HSDir-tried history this lookup built up.
///
/// Deliberately leaves per-introduction-point failure state untouched:
/// having successfully reached the service once says nothing about whether
/// any particular introduction point is still usable.
pub(crate) fn note_connection_succeeded(
    hsdir_history: &mut crate::cache::HsDirTriedHistory,
    lookup_key: &str,
) {
    hsdir_history.reset(lookup_key);
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
    use std::cell::RefCell;
    use tor_netdoc::doc::hsdesc::IntroPointDesc;

    #[derive(Default)]
    struct StubRegistry {
        streams: RefCell<Vec<(u32, HsId, WaiterState)>>,
        closed: RefCell<Vec<(u32, WaiterCloseReason)>>,
    }

    impl WaiterRegistry for StubRegistry {
        type Stream = u32;

        fn identity(&self, stream: &Self::Stream) -> HsId {
            self.streams
                .borrow()
                .iter()
                .find(|(id, ..)| id == stream)
                .unwrap()
                .1
        }

        fn streams_in_state(&self, state: WaiterState) -> Vec<Self::Stream> {
            self.streams
                .borrow()
                .iter()
                .filter(|(_, _, s)| *s == state)
                .map(|(id, ..)| *id)
                .collect()
        }

        fn set_state(&mut self, stream: &Self::Stream, state: WaiterState) {
            for entry in self.streams.borrow_mut().iter_mut() {
                if entry.0 == *stream {
                    entry.2 = state;
                }
            }
        }

        fn close(&mut self, stream: &Self::Stream, reason: WaiterCloseReason) {
            self.closed.borrow_mut().push((*stream, reason));
            self.streams.borrow_mut().retain(|(id, ..)| id != stream);
        }
    }

    struct EmptyDesc;
    impl DescriptorIntroPoints for EmptyDesc {
        fn intro_points(&self) -> &[IntroPointDesc] {
            &[]
        }
    }

    #[test]
    fn park_for_descriptor_moves_only_matching_identity() {
        let hsid_a: HsId = [1u8; 32].into();
        let hsid_b: HsId = [2u8; 32].into();
        let mut registry = StubRegistry {
            streams: RefCell::new(vec![
                (1, hsid_a, WaiterState::AwaitingCircuit),
                (2, hsid_b, WaiterState::AwaitingCircuit),
            ]),
            closed: RefCell::new(vec![]),
        };

        park_for_descriptor(&mut registry, hsid_a);

        let states = registry.streams.borrow();
        assert_eq!(states[0].2, WaiterState::AwaitingDescriptor);
        assert_eq!(states[1].2, WaiterState::AwaitingCircuit);
    }

    #[test]
    fn wake_on_descriptor_closes_waiters_when_no_usable_intro_points() {
        let hsid: HsId = [3u8; 32].into();
        let mut registry = StubRegistry {
            streams: RefCell::new(vec![(1, hsid, WaiterState::AwaitingDescriptor)]),
            closed: RefCell::new(vec![]),
        };
        let mut failures = IntroPointFailureState::default();
        let config = HsClientConfig::default();
        let mut hsdir_history = crate::cache::HsDirTriedHistory::default();
        hsdir_history.note_tried("lookup".into(), tor_llcrypto::pk::rsa::RsaIdentity::from_bytes(&[9u8; 20]).unwrap());

        wake_on_descriptor(
            &mut registry,
            hsid,
            &EmptyDesc,
            &mut failures,
            &config,
            "lookup",
            &mut hsdir_history,
        );

        assert!(registry.streams.borrow().is_empty());
        assert_eq!(registry.closed.borrow().len(), 1);
        assert!(!hsdir_history.was_tried(
            "lookup",
            &tor_llcrypto::pk::rsa::RsaIdentity::from_bytes(&[9u8; 20]).unwrap()
        ));
    }

    #[test]
    fn retry_all_refetches_each_identity_once() {
        let hsid: HsId = [4u8; 32].into();
        let registry = StubRegistry {
            streams: RefCell::new(vec![
                (1, hsid, WaiterState::AwaitingDescriptor),
                (2, hsid, WaiterState::AwaitingDescriptor),
            ]),
            closed: RefCell::new(vec![]),
        };

        let mut refetch_count = 0;
        retry_all_on_dir_info_changed(&registry, |_| refetch_count += 1);
        assert_eq!(refetch_count, 1);
    }

    #[test]
    fn note_connection_succeeded_purges_tried_history_only() {
        let mut hsdir_history = crate::cache::HsDirTriedHistory::default();
        let id = tor_llcrypto::pk::rsa::RsaIdentity::from_bytes(&[5u8; 20]).unwrap();
        hsdir_history.note_tried("lookup".into(), id);
        assert!(hsdir_history.was_tried("lookup", &id));

        note_connection_succeeded(&mut hsdir_history, "lookup");
        assert!(!hsdir_history.was_tried("lookup", &id));
    }
}
