//! Continuity checks over a sequence of imported links.
//!
//! `verify_chain` walks from the newest link back to the oldest. Each link
//! names the link it expects before it, either directly (`seqno - 1` and
//! `prev`) or through its high skip. Which of the two applies is decided by
//! the input: when the element before a link sits at `seqno - 1` the chain is
//! dense there and the direct pointer is checked; when there is a gap the
//! link must carry a high skip that lands on that element. The same walk
//! therefore handles both full chains and sparse high-link-only chains.

use log::{debug, warn};

use crate::chain::error::ChainLinkError;
use crate::chain::link::{ChainLink, ChainTail};
use crate::chain::types::{ChainOwner, HighSkip, Seqno};

/// Pick the predecessor a link expects, given the element before it in the
/// input (if any).
fn expected_predecessor(link: &ChainLink, preceding: Option<&ChainLink>) -> HighSkip {
    let direct = link.prev_expectation();
    let dense = preceding.map_or(false, |p| p.seqno() == direct.seqno);
    match link.high_skip() {
        Some(high_skip) if !dense => high_skip,
        _ => direct,
    }
}

fn check_owner(link: &ChainLink, owner: &ChainOwner) -> Result<(), ChainLinkError> {
    // Stubbed links carry no payload, so nothing to check.
    if let Some(uid) = link.uid() {
        if uid != owner.uid {
            return Err(ChainLinkError::UidMismatch(format!(
                "link {} belongs to {}, expected {}",
                link.seqno(),
                uid,
                owner.uid
            )));
        }
    }
    if let Some(username) = link.username() {
        if !owner.username_matches(username) {
            return Err(ChainLinkError::UsernameMismatch(format!(
                "link {} signed by {}, expected {}",
                link.seqno(),
                username,
                owner.username
            )));
        }
    }
    Ok(())
}

/// Verify that `links` (oldest first) form an unbroken chain owned by `owner`.
///
/// The first inconsistency aborts the walk and nothing is marked. On success
/// every link is marked chain-verified.
pub fn verify_chain(links: &mut [ChainLink], owner: &ChainOwner) -> Result<(), ChainLinkError> {
    debug!(
        "+ verify_chain for {} ({} links)",
        owner.username,
        links.len()
    );

    for i in (0..links.len()).rev() {
        let curr = &links[i];
        let preceding = if i > 0 { Some(&links[i - 1]) } else { None };
        let expected = expected_predecessor(curr, preceding);

        match preceding {
            Some(prev) => {
                if prev.seqno() != expected.seqno {
                    return Err(ChainLinkError::WrongSeqno(format!(
                        "Chain seqno mismatch at seqno={} (previous={}, expected {})",
                        curr.seqno(),
                        prev.seqno(),
                        expected.seqno
                    )));
                }
                if expected.hash != Some(prev.id()) {
                    return Err(ChainLinkError::PrevHashMismatch(format!(
                        "Chain mismatch at seqno={}",
                        curr.seqno()
                    )));
                }
            }
            None => {
                if !expected.is_genesis() {
                    return Err(ChainLinkError::PrevHashMismatch(format!(
                        "Oldest link at seqno={} does not start from genesis",
                        curr.seqno()
                    )));
                }
            }
        }
        check_owner(curr, owner)?;
    }

    for link in links.iter_mut() {
        link.mark_chain_verified();
    }
    debug!("- verify_chain for {} -> ok", owner.username);
    Ok(())
}

/// Whether `links` is a full chain: seqnos 1, 2, 3, ... with no gaps.
pub fn is_dense(links: &[ChainLink]) -> bool {
    links
        .iter()
        .enumerate()
        .all(|(i, l)| l.seqno() == Seqno(i as u64 + 1))
}

/// Recompute, walking forward over a dense chain from seqno 1, the high skip
/// each link should carry, and check it against the one it does carry.
pub fn compute_high_skips(links: &mut [ChainLink]) -> Result<(), ChainLinkError> {
    let mut expected = HighSkip::genesis();
    let mut want_seqno = Seqno(1);
    for link in links.iter_mut() {
        if link.seqno() != want_seqno {
            return Err(ChainLinkError::WrongSeqno(format!(
                "high skips need a full chain; found seqno {} where {} was expected",
                link.seqno(),
                want_seqno
            )));
        }
        link.computed_high_skip = Some(expected);
        if let Some(claimed) = link.high_skip() {
            claimed.assert_equals_expected(&expected)?;
        }
        if link.is_high() {
            expected = HighSkip::new(link.seqno(), Some(link.id()));
        }
        want_seqno = Seqno(want_seqno.0 + 1);
    }
    Ok(())
}

/// Compare the local chain tail with the tail the Merkle tree commits to.
///
/// Returns whether the local chain is current. A server that has rolled back,
/// or that reports a different link at the same seqno, is an error.
pub fn check_freshness(
    local: Option<&ChainTail>,
    server: Option<&ChainTail>,
) -> Result<bool, ChainLinkError> {
    let server = match (server, local) {
        (None, Some(local)) => {
            return Err(ChainLinkError::ServerChain(format!(
                "Server claimed not to have this user in its tree (we had v={})",
                local.seqno
            )))
        }
        (None, None) => return Ok(false),
        (Some(server), _) => server,
    };
    let local = match local {
        Some(local) => local,
        None => return Ok(false),
    };

    if local.seqno > server.seqno {
        warn!(
            "Server version-rollback suspected: Local {} > {}",
            local.seqno, server.seqno
        );
        return Err(ChainLinkError::ServerChain(format!(
            "Server version-rollback suspected: Local {} > {}",
            local.seqno, server.seqno
        )));
    }
    if local.seqno == server.seqno {
        if local.link_id != server.link_id {
            return Err(ChainLinkError::ServerChain(
                "The server returned the wrong sigchain tail".to_string(),
            ));
        }
        debug!("| Local chain version is up-to-date @ version {}", server.seqno);
        return Ok(true);
    }
    debug!(
        "| Local chain version is out-of-date: {} < {}",
        local.seqno, server.seqno
    );
    Ok(false)
}
