//! The fetch-eligibility gate: decides whether a descriptor fetch may be issued now.

use std::sync::Arc;

use tor_hscrypto::pk::HsId;
use tor_hscrypto::time::TimePeriod;
use tor_netdir::{NetDirProvider, Timeliness};

use crate::cache::ClientContext;
use crate::config::HsClientConfig;
use crate::ipt_select::{self, DescriptorIntroPoints};

/// The outcome of a fetch-eligibility check, or of a fetch attempt overall.
///
/// Shared between [`can_fetch`] (which only ever returns the first five
/// variants) and the descriptor fetch coordinator, which adds `NoHsdirs` once
/// it has gone on to consult the HSDir picker.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum FetchStatus {
    /// Nothing stands in the way of issuing a fetch.
    Ok,
    /// Fetching onion service descriptors is disabled by configuration.
    ///
    /// Fatal: waiters are closed with a resolve-failed reason.
    NotAllowed,
    /// We don't have enough directory information yet (no live consensus, or
    /// not enough routers known) to pick an HSDir or validate a descriptor.
    ///
    /// Non-fatal: waiters stay parked until directory info improves.
    MissingInfo,
    /// We already have a usable cached descriptor for this service.
    ///
    /// Non-fatal: this is a normal reason to stop, not an error.
    HaveDesc,
    /// A directory request for this identity is already in flight.
    ///
    /// Non-fatal: waiters stay parked until it resolves.
    Pending,
    /// Every responsible HSDir for this identity's blinded key has already
    /// been tried during the current lookup.
    ///
    /// Fatal: waiters are closed with a resolve-failed reason.
    NoHsdirs,
}

impl FetchStatus {
    /// Should waiters parked on this identity be closed, or kept parked?
    ///
    /// Mirrors the closing set named in the fetch coordinator: `NoHsdirs`,
    /// `NotAllowed`, and (by construction, since [`can_fetch`] never produces
    /// it on its own) internal errors are fatal; `MissingInfo` and `Pending`
    /// are not.
    pub(crate) fn is_fatal(self) -> bool {
        matches!(self, FetchStatus::NotAllowed | FetchStatus::NoHsdirs)
    }
}

/// Decide whether a descriptor fetch for `hsid` may be issued right now.
///
/// Checks are ordered deliberately: cheaper, more decisive checks come
/// first, so that (for example) a disabled client never touches the network
/// view at all, and a client with no working consensus never bothers
/// consulting its own descriptor cache.
pub(crate) fn can_fetch<Desc: DescriptorIntroPoints, C>(
    hsid: HsId,
    config: &HsClientConfig,
    netdir_provider: &Arc<dyn NetDirProvider>,
    ctx: &mut ClientContext<Desc, C>,
    pending: &[HsId],
) -> FetchStatus {
    if !config.fetch_enabled() {
        return FetchStatus::NotAllowed;
    }

    let netdir = match netdir_provider.netdir(Timeliness::Timely) {
        Ok(netdir) => netdir,
        Err(_) => return FetchStatus::MissingInfo,
    };

    let period = netdir.hs_time_period();

    // A cached descriptor only counts as "have desc" if at least one of its
    // introduction points is still usable; one whose introduction points have
    // all failed needs the same refetch a missing descriptor would.
    if let Some(desc) = ctx.descriptors.get(hsid, period).map(|rec| Arc::clone(&rec.desc)) {
        let has_usable_intro = desc.intro_points().iter().any(|ipt| {
            let key = ipt_select::failure_key(hsid, ipt);
            ipt_select::is_usable(&key, &mut ctx.intro_failures, config)
        });
        if has_usable_intro {
            return FetchStatus::HaveDesc;
        }
    }

    if pending.contains(&hsid) {
        return FetchStatus::Pending;
    }

    FetchStatus::Ok
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
    fn not_allowed_short_circuits() {
        let config = crate::config::HsClientConfigBuilder::default()
            .enabled(false)
            .build()
            .unwrap();
        assert!(FetchStatus::NotAllowed.is_fatal());
        assert_eq!(config.fetch_enabled(), false);
    }

    #[test]
    fn fatality_matches_closing_set() {
        assert!(FetchStatus::NotAllowed.is_fatal());
        assert!(FetchStatus::NoHsdirs.is_fatal());
        assert!(!FetchStatus::MissingInfo.is_fatal());
        assert!(!FetchStatus::Pending.is_fatal());
        assert!(!FetchStatus::HaveDesc.is_fatal());
        assert!(!FetchStatus::Ok.is_fatal());
    }
}
