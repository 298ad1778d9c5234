//! Access-control matching for live listeners and downstream targets

use callrelay_core::{Grant, SystemId, TalkgroupId};

/// Whether a grant set permits receiving a call on `(system, talkgroup)`
///
/// An empty grant set denies everything; a listener with no grants is
/// validly connected but receives nothing.
#[must_use]
pub fn permits(grants: &[Grant], system: SystemId, talkgroup: TalkgroupId) -> bool {
    grants.iter().any(|g| g.matches(system, talkgroup))
}
