//! Process-wide state shared by every connection attempt to every onion service.
//!
//! This bundles three caches that the fetch-eligibility gate, the HSDir
//! picker, the introduction-point selector and the rendezvous state machine
//! all read and write: how often we've recently failed to reach each
//! introduction point, the descriptors we already have on hand, and which
//! HSDirs we've already tried during the current lookup for each service.
//! Kept as one [`ClientContext`], the way `state.rs`'s `Services` keeps all
//! per-service state behind a single `Mutex`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tor_hscrypto::pk::HsId;
use tor_hscrypto::time::TimePeriod;
use tor_llcrypto::pk::ed25519::Ed25519Identity;
use tor_llcrypto::pk::rsa::RsaIdentity;

use crate::config::HsClientConfig;

/// Key identifying one introduction point across descriptor refreshes.
///
/// Introduction points have no identity of their own; we track failures by
/// the pair of the service they belong to and their session id key, which is
/// the only thing that stays stable for a given advertised introduction
/// point between one descriptor fetch and the next.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub(crate) struct IntroPointKey {
    /// The onion service this introduction point belongs to.
    pub(crate) hsid: HsId,
    /// The introduction point's session id key.
    pub(crate) session_id: Ed25519Identity,
}

/// Why an attempt to use an introduction point failed, as reported by
/// whatever part of the connector just tried it.
///
/// Distinguished because a `Generic` failure (the introduction point itself
/// rejected us, or told us it couldn't relay) means the point is broken right
/// now, while plain unreachability is tolerated a few times before we give up
/// on the point, in case it was transient.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum IntroFailureKind {
    /// The introduction point rejected the introduction, or otherwise
    /// reported a definite failure (an `INTRODUCE_ACK` of `NOT_RECOGNIZED`,
    /// `BAD_MESSAGE_FORMAT`, or `CANT_RELAY`).
    ///
    /// Excludes the point immediately: one such failure is enough.
    Generic,
    /// Extending to, or communicating with, the introduction point timed out.
    TimedOut,
    /// We failed to reach the introduction point at all (circuit build
    /// failure, connection refused, and the like).
    ///
    /// Tolerated up to [`HsClientConfig::max_unreachable`] times in a row.
    Unreachable,
}

/// A record of recent failures to use one introduction point.
#[derive(Clone, Debug)]
pub(crate) struct IntroPointFailureRecord {
    /// Whether a [`IntroFailureKind::Generic`] failure has been seen.
    error: bool,
    /// Whether a [`IntroFailureKind::TimedOut`] failure has been seen.
    timed_out: bool,
    /// How many [`IntroFailureKind::Unreachable`] failures have accumulated
    /// in a row.
    unreachable_count: u32,
    /// When the most recent failure happened.
    last_failure: Instant,
}

impl IntroPointFailureRecord {
    /// Make a fresh record reflecting a single failure of `kind` that just happened.
    fn first(now: Instant, kind: IntroFailureKind) -> Self {
        let mut record = IntroPointFailureRecord {
            error: false,
            timed_out: false,
            unreachable_count: 0,
            last_failure: now,
        };
        record.apply(kind);
        record
    }

    /// Fold in one more failure of `kind`.
    fn apply(&mut self, kind: IntroFailureKind) {
        match kind {
            IntroFailureKind::Generic => self.error = true,
            IntroFailureKind::TimedOut => self.timed_out = true,
            IntroFailureKind::Unreachable => self.unreachable_count += 1,
        }
    }

    /// Has this record expired as of `now`, given `ttl`?
    ///
    /// A record with no TTL configured never expires on its own; it is
    /// cleared only by [`IntroPointFailureState::note_success`].
    fn is_stale(&self, now: Instant, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => now.saturating_duration_since(self.last_failure) > ttl,
            None => false,
        }
    }

    /// Is the introduction point this record tracks still usable, given
    /// `config`'s tolerance for plain unreachability?
    fn is_usable(&self, config: &HsClientConfig) -> bool {
        !self.error && !self.timed_out && self.unreachable_count < config.max_unreachable()
    }
}

/// Tracks recent failures for every introduction point we've tried lately.
///
/// Used by the introduction-point selector to skip points that have failed
/// outright, or been unreachable too many times in a row, and cleaned out
/// lazily: a record is dropped the next time it's looked up after its TTL
/// elapses, rather than on a timer.
#[derive(Default, Debug)]
pub(crate) struct IntroPointFailureState {
    /// The per-introduction-point records.
    records: HashMap<IntroPointKey, IntroPointFailureRecord>,
}

impl IntroPointFailureState {
    /// Record a failed attempt to use `key`, of the given `kind`.
    pub(crate) fn note_failure(&mut self, key: IntroPointKey, now: Instant, kind: IntroFailureKind) {
        self.records
            .entry(key)
            .and_modify(|r| {
                r.apply(kind);
                r.last_failure = now;
            })
            .or_insert_with(|| IntroPointFailureRecord::first(now, kind));
    }

    /// Clear any failure record for `key`, since we just used it successfully.
    pub(crate) fn note_success(&mut self, key: &IntroPointKey) {
        self.records.remove(key);
    }

    /// Is `key` currently excluded from selection, per `config`?
    ///
    /// Also opportunistically drops `key`'s record if it has gone stale,
    /// so a point that's been quiet for a while becomes eligible again
    /// without needing an explicit reset.
    pub(crate) fn is_excluded(&mut self, key: &IntroPointKey, config: &HsClientConfig) -> bool {
        let now = Instant::now();
        let ttl = config.intro_failure_ttl();
        if let Some(record) = self.records.get(key) {
            if record.is_stale(now, ttl) {
                self.records.remove(key);
                return false;
            }
            !record.is_usable(config)
        } else {
            false
        }
    }
}

/// A cached, already-validated onion service descriptor, plus the introduction
/// points decoded from it.
///
/// Generic over the decoded descriptor payload type so this module doesn't
/// need to depend on exactly how the descriptor codec represents a validated
/// descriptor: the fetch coordinator fills in `Desc` with whatever type that
/// collaborator returns.
#[derive(Clone, Debug)]
pub(crate) struct DescriptorRecord<Desc> {
    /// The decoded descriptor.
    pub(crate) desc: Arc<Desc>,
    /// When we fetched this descriptor.
    pub(crate) fetched_at: Instant,
    /// The time period this descriptor was fetched for.
    pub(crate) period: TimePeriod,
}

impl<Desc> DescriptorRecord<Desc> {
    /// Wrap a freshly fetched descriptor.
    pub(crate) fn new(desc: Desc, period: TimePeriod) -> Self {
        DescriptorRecord {
            desc: Arc::new(desc),
            fetched_at: Instant::now(),
            period,
        }
    }

    /// Is this record still usable for `period`, or has the time period rolled over?
    pub(crate) fn usable_for(&self, period: TimePeriod) -> bool {
        self.period == period
    }
}

/// The descriptor cache: one slot per onion service.
#[derive(Debug)]
pub(crate) struct DescriptorCache<Desc> {
    /// The cached descriptors, by service.
    entries: HashMap<HsId, DescriptorRecord<Desc>>,
}

// Hand-written rather than `#[derive(Default)]`: the derive would add a
// spurious `Desc: Default` bound, even though an empty `HashMap` needs no
// such thing from its value type.
impl<Desc> Default for DescriptorCache<Desc> {
    fn default() -> Self {
        DescriptorCache {
            entries: HashMap::new(),
        }
    }
}

impl<Desc> DescriptorCache<Desc> {
    /// Look up a usable cached descriptor for `hsid` at `period`, if any.
    pub(crate) fn get(&self, hsid: HsId, period: TimePeriod) -> Option<&DescriptorRecord<Desc>> {
        self.entries
            .get(&hsid)
            .filter(|record| record.usable_for(period))
    }

    /// Install a newly fetched descriptor, replacing whatever was cached before.
    pub(crate) fn insert(&mut self, hsid: HsId, record: DescriptorRecord<Desc>) {
        self.entries.insert(hsid, record);
    }

    /// Discard the cached descriptor for `hsid`, if any.
    ///
    /// Used when a descriptor turns out to be unusable (no usable
    /// introduction points, or the service no longer appears reachable) and
    /// we'd rather force a refetch than hand out a record we know is bad.
    pub(crate) fn purge(&mut self, hsid: HsId) {
        self.entries.remove(&hsid);
    }
}

/// The HSDirs already tried, for one service, during the current lookup.
///
/// Reset whenever we start a fresh lookup (a new descriptor fetch attempt for
/// a service, keyed on the blinded id for the current time period); not
/// meant to persist across lookups, since by the next lookup the consensus
/// and the hash ring may have changed anyway.
#[derive(Default, Debug)]
pub(crate) struct HsDirTriedHistory {
    /// Identities of HSDirs already tried, by the base64-unpadded-encoded
    /// blinded id of the lookup they were tried for.
    tried: HashMap<String, Vec<RsaIdentity>>,
}

impl HsDirTriedHistory {
    /// Has `hsdir` already been tried for the lookup identified by `lookup_key`?
    pub(crate) fn was_tried(&self, lookup_key: &str, hsdir: &RsaIdentity) -> bool {
        self.tried
            .get(lookup_key)
            .is_some_and(|v| v.contains(hsdir))
    }

    /// Record that `hsdir` was just tried for the lookup identified by `lookup_key`.
    pub(crate) fn note_tried(&mut self, lookup_key: String, hsdir: RsaIdentity) {
        self.tried.entry(lookup_key).or_default().push(hsdir);
    }

    /// Forget everything tried for `lookup_key`, starting a fresh lookup.
    pub(crate) fn reset(&mut self, lookup_key: &str) {
        self.tried.remove(lookup_key);
    }
}

/// A table of in-progress or completed rendezvous attempts, by rendezvous cookie.
///
/// Generic over the state-machine handle type, the same way
/// [`crate::isol_map::MultikeyIsolatedMap`] is generic over its value type:
/// `rend_handshake` fills in the concrete `PairState` handle.
#[derive(Debug)]
pub(crate) struct CircuitMap<C> {
    /// The live entries, by rendezvous cookie bytes.
    entries: HashMap<[u8; 20], C>,
}

// See the note on `DescriptorCache`'s `Default` impl above.
impl<C> Default for CircuitMap<C> {
    fn default() -> Self {
        CircuitMap {
            entries: HashMap::new(),
        }
    }
}

impl<C> CircuitMap<C> {
    /// Register a new in-progress rendezvous attempt under `cookie`.
    pub(crate) fn insert(&mut self, cookie: [u8; 20], handle: C) {
        self.entries.insert(cookie, handle);
    }

    /// Look up the handle for `cookie`, if we're still tracking it.
    pub(crate) fn get_mut(&mut self, cookie: &[u8; 20]) -> Option<&mut C> {
        self.entries.get_mut(cookie)
    }

    /// Stop tracking `cookie`, returning its handle if it was present.
    pub(crate) fn remove(&mut self, cookie: &[u8; 20]) -> Option<C> {
        self.entries.remove(cookie)
    }
}

/// All of the process-wide caches bundled together.
///
/// Plain data; the connector wraps this in an `Arc<Mutex<_>>` the same way
/// `state.rs` wraps `Services`, rather than this type doing its own locking.
#[derive(Debug)]
pub(crate) struct ClientContext<Desc, C> {
    /// Recent per-introduction-point failures.
    pub(crate) intro_failures: IntroPointFailureState,
    /// Cached descriptors, one per service.
    pub(crate) descriptors: DescriptorCache<Desc>,
    /// HSDirs already tried during the current lookup, per service.
    pub(crate) hsdir_history: HsDirTriedHistory,
    /// In-progress and completed rendezvous attempts, by rendezvous cookie.
    pub(crate) circuits: CircuitMap<C>,
}

// See the note on `DescriptorCache`'s `Default` impl above.
impl<Desc, C> Default for ClientContext<Desc, C> {
    fn default() -> Self {
        ClientContext {
            intro_failures: IntroPointFailureState::default(),
            descriptors: DescriptorCache::default(),
            hsdir_history: HsDirTriedHistory::default(),
            circuits: CircuitMap::default(),
        }
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

    fn key(n: u8) -> IntroPointKey {
        IntroPointKey {
            hsid: [n; 32].into(),
            session_id: Ed25519Identity::from_bytes(&[n; 32]).unwrap(),
        }
    }

    #[test]
    fn failures_accumulate_and_exclude() {
        let config = HsClientConfig::default();
        let mut state = IntroPointFailureState::default();
        let k = key(1);
        assert!(!state.is_excluded(&k, &config));
        for _ in 0..config.max_unreachable() {
            state.note_failure(k, Instant::now(), IntroFailureKind::Unreachable);
        }
        assert!(state.is_excluded(&k, &config));
        state.note_success(&k);
        assert!(!state.is_excluded(&k, &config));
    }

    #[test]
    fn generic_failure_excludes_immediately() {
        let config = HsClientConfig::default();
        let mut state = IntroPointFailureState::default();
        let k = key(2);
        assert!(!state.is_excluded(&k, &config));
        state.note_failure(k, Instant::now(), IntroFailureKind::Generic);
        assert!(state.is_excluded(&k, &config));
    }

    #[test]
    fn hsdir_tried_history_is_scoped_per_lookup() {
        let mut h = HsDirTriedHistory::default();
        let id = RsaIdentity::from_bytes(&[3; 20]).unwrap();
        assert!(!h.was_tried("lookup-a", &id));
        h.note_tried("lookup-a".into(), id);
        assert!(h.was_tried("lookup-a", &id));
        assert!(!h.was_tried("lookup-b", &id));
        h.reset("lookup-a");
        assert!(!h.was_tried("lookup-a", &id));
    }

    #[test]
    fn circuit_map_insert_and_remove() {
        let mut m: CircuitMap<u32> = CircuitMap::default();
        let cookie = [7u8; 20];
        m.insert(cookie, 42);
        assert_eq!(m.get_mut(&cookie), Some(&mut 42));
        assert_eq!(m.remove(&cookie), Some(42));
        assert_eq!(m.remove(&cookie), None);
    }

    #[test]
    fn descriptor_cache_respects_period() {
        let mut cache: DescriptorCache<&'static str> = DescriptorCache::default();
        let hsid: HsId = [9u8; 32].into();
        let period_a = TimePeriod::from_parts(1, 86400);
        let period_b = TimePeriod::from_parts(2, 86400);

        assert!(cache.get(hsid, period_a).is_none());
        cache.insert(hsid, DescriptorRecord::new("a fine descriptor", period_a));
        assert!(cache.get(hsid, period_a).is_some());
        assert!(cache.get(hsid, period_b).is_none());

        cache.purge(hsid);
        assert!(cache.get(hsid, period_a).is_none());
    }
}
