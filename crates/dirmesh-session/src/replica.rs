//! The local replica object: RUV, CSN generator, and session token.
//!
//! One `Replica` exists per replicated subtree. Update sessions take an
//! exclusive token on it before sending anything, so only one supplier
//! feeds a replica at a time. The token carries the holder's identity
//! for busy diagnostics and an abort flag a waiting supplier can arm
//! when the holder has overstayed its release timeout.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use tracing::{debug, info, warn};

use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::csngen::CsnGenerator;
use dirmesh_model::ruv::Ruv;
use dirmesh_model::ModelError;

use crate::error::SessionError;
use crate::extop::SessionFlavor;

/// Session token state, guarded by the replica's access mutex.
#[derive(Debug, Default)]
struct AccessState {
    /// A session currently holds the replica.
    in_use: bool,
    /// Flavor of the holding session.
    flavor: Option<SessionFlavor>,
    /// Purl of the holding supplier.
    locking_purl: Option<String>,
    /// Holder identity, `conn=<id> id=<opid>`.
    locking_session: Option<String>,
    /// Connection id of the holder.
    locking_conn: Option<u64>,
    /// Set by a rejected acquirer to ask the holder to wind down.
    abort_session: bool,
}

/// A replica of one subtree, with its RUV and CSN generator.
pub struct Replica {
    rid: ReplicaId,
    root: String,
    purl: String,
    updatable: bool,
    legacy_consumer: bool,
    update_dns: Vec<String>,
    release_timeout_secs: u64,
    ruv: RwLock<Ruv>,
    generator: Mutex<CsnGenerator>,
    access: Mutex<AccessState>,
    keep_alives: Mutex<BTreeSet<ReplicaId>>,
    referral: AtomicBool,
    tombstone_reap_suspended: AtomicBool,
    being_configured: AtomicBool,
    total_excluded: AtomicBool,
    bulk_import: AtomicBool,
}

impl Replica {
    /// Creates a replica seeded with an owner-first RUV element and a
    /// generator sampled at `now`.
    pub fn new(rid: ReplicaId, root: &str, purl: &str, now: u64) -> Self {
        Replica {
            rid,
            root: root.to_string(),
            purl: purl.to_string(),
            updatable: true,
            legacy_consumer: false,
            update_dns: Vec::new(),
            release_timeout_secs: 0,
            ruv: RwLock::new(Ruv::with_local(rid, purl)),
            generator: Mutex::new(CsnGenerator::new(rid, now)),
            access: Mutex::new(AccessState::default()),
            keep_alives: Mutex::new(BTreeSet::new()),
            referral: AtomicBool::new(false),
            tombstone_reap_suspended: AtomicBool::new(false),
            being_configured: AtomicBool::new(false),
            total_excluded: AtomicBool::new(false),
            bulk_import: AtomicBool::new(false),
        }
    }

    /// This replica's id.
    pub fn rid(&self) -> ReplicaId {
        self.rid
    }

    /// Root of the replicated subtree.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// This replica's purl.
    pub fn purl(&self) -> &str {
        &self.purl
    }

    /// Whether this replica accepts and originates writes.
    pub fn is_updatable(&self) -> bool {
        self.updatable
    }

    /// Marks the replica read-only or updatable.
    pub fn set_updatable(&mut self, updatable: bool) {
        self.updatable = updatable;
    }

    /// Whether this replica only speaks the legacy protocol.
    pub fn is_legacy_consumer(&self) -> bool {
        self.legacy_consumer
    }

    /// Flags the replica as a legacy consumer.
    pub fn set_legacy_consumer(&mut self, legacy: bool) {
        self.legacy_consumer = legacy;
    }

    /// Restricts which bound identities may supply updates. An empty
    /// list allows any.
    pub fn set_update_dns(&mut self, dns: Vec<String>) {
        self.update_dns = dns;
    }

    /// Whether `bind_dn` may supply updates to this replica.
    pub fn can_update(&self, bind_dn: &str) -> bool {
        self.update_dns.is_empty()
            || self
                .update_dns
                .iter()
                .any(|dn| dn.eq_ignore_ascii_case(bind_dn))
    }

    /// Sets the session release timeout. Zero disables both the
    /// same-connection takeover and the abort request on busy.
    pub fn set_release_timeout(&mut self, secs: u64) {
        self.release_timeout_secs = secs;
    }

    // ---- session token ------------------------------------------------

    /// Takes the exclusive session token.
    ///
    /// A second acquirer on the same connection succeeds when the
    /// holder is an incremental session and a release timeout is set;
    /// the token is simply re-stamped with the new session identity.
    /// Any other contender gets `ReplicaBusy` naming the holder, and
    /// arms the holder's abort flag when a release timeout is set.
    pub fn get_exclusive_access(
        &self,
        conn_id: u64,
        op_id: u64,
        purl: &str,
        flavor: SessionFlavor,
    ) -> Result<(), SessionError> {
        let mut access = self.access.lock().expect("lock poisoned");
        if access.in_use {
            if access.flavor == Some(SessionFlavor::Incremental)
                && self.release_timeout_secs > 0
                && access.locking_conn == Some(conn_id)
            {
                debug!(
                    conn = conn_id,
                    op = op_id,
                    root = %self.root,
                    "same connection re-acquired the replica"
                );
                access.flavor = Some(flavor);
                access.locking_purl = Some(purl.to_string());
                access.locking_session = Some(format!("conn={conn_id} id={op_id}"));
                access.abort_session = false;
                return Ok(());
            }
            let holder = access.locking_purl.clone().unwrap_or_default();
            let holder_flavor = access
                .flavor
                .map(|flavor| flavor.name())
                .unwrap_or(SessionFlavor::Incremental.name());
            if self.release_timeout_secs > 0 {
                access.abort_session = true;
            }
            warn!(
                conn = conn_id,
                op = op_id,
                root = %self.root,
                holder = %holder,
                "replica busy, rejecting session"
            );
            return Err(SessionError::ReplicaBusy {
                holder,
                flavor: holder_flavor,
            });
        }
        access.in_use = true;
        access.flavor = Some(flavor);
        access.locking_purl = Some(purl.to_string());
        access.locking_session = Some(format!("conn={conn_id} id={op_id}"));
        access.locking_conn = Some(conn_id);
        access.abort_session = false;
        debug!(
            conn = conn_id,
            op = op_id,
            root = %self.root,
            flavor = flavor.name(),
            "acquired exclusive access"
        );
        Ok(())
    }

    /// Releases the session token; warns when nothing holds it.
    pub fn relinquish_exclusive_access(&self, conn_id: u64, op_id: u64) {
        let mut access = self.access.lock().expect("lock poisoned");
        if !access.in_use {
            warn!(
                conn = conn_id,
                op = op_id,
                root = %self.root,
                "Replica not in use"
            );
            return;
        }
        *access = AccessState::default();
    }

    /// Whether a session currently holds the replica.
    pub fn is_in_use(&self) -> bool {
        self.access.lock().expect("lock poisoned").in_use
    }

    /// Purl of the holding supplier, if any.
    pub fn current_holder(&self) -> Option<String> {
        self.access.lock().expect("lock poisoned").locking_purl.clone()
    }

    /// Connection id of the holding session, if any.
    pub fn locking_conn(&self) -> Option<u64> {
        self.access.lock().expect("lock poisoned").locking_conn
    }

    /// Asks the holding session to wind down at its next checkpoint.
    pub fn abort_current_session(&self) {
        let mut access = self.access.lock().expect("lock poisoned");
        if access.in_use {
            access.abort_session = true;
        }
    }

    /// Whether the holding session has been asked to wind down.
    pub fn session_abort_requested(&self) -> bool {
        self.access.lock().expect("lock poisoned").abort_session
    }

    // ---- RUV ----------------------------------------------------------

    /// A snapshot of the replica's RUV.
    pub fn ruv(&self) -> Ruv {
        self.ruv.read().expect("lock poisoned").clone()
    }

    /// Advances the RUV with a committed CSN.
    pub fn update_ruv(&self, csn: Csn, purl: &str) {
        self.ruv.write().expect("lock poisoned").update(csn, purl);
    }

    /// Folds another RUV into ours, keeping per-rid maxima.
    pub fn merge_ruv(&self, other: &Ruv) {
        self.ruv.write().expect("lock poisoned").merge(other);
    }

    /// Replaces the RUV wholesale; used when a total update reseeds us.
    pub fn install_ruv(&self, ruv: Ruv) {
        *self.ruv.write().expect("lock poisoned") = ruv;
    }

    /// Whether the RUV covers `csn`.
    pub fn covers_csn(&self, csn: &Csn) -> bool {
        self.ruv.read().expect("lock poisoned").covers_csn(csn)
    }

    /// Max CSN seen from `rid`, if any.
    pub fn max_csn_for(&self, rid: ReplicaId) -> Option<Csn> {
        self.ruv.read().expect("lock poisoned").max_csn_for(rid)
    }

    /// Drops `rid` from the RUV without the delete guards. Returns
    /// whether an element was removed.
    pub fn forget_rid(&self, rid: ReplicaId) -> bool {
        self.ruv.write().expect("lock poisoned").forget(rid)
    }

    // ---- CSN generator ------------------------------------------------

    /// Mints a CSN for a local write.
    pub fn new_csn(&self) -> Result<Csn, ModelError> {
        self.generator.lock().expect("lock poisoned").new_csn()
    }

    /// Mints a CSN with the clock pinned at `now`; test hook.
    pub fn new_csn_at(&self, now: u64) -> Result<Csn, ModelError> {
        self.generator.lock().expect("lock poisoned").new_csn_at(now)
    }

    /// Folds a remote CSN into the generator's notion of time.
    pub fn adjust_time(&self, csn: &Csn) -> Result<(), ModelError> {
        self.generator.lock().expect("lock poisoned").adjust_time(csn)
    }

    /// Disables the skew ceiling on the generator.
    pub fn set_ignore_time_skew(&self, ignore: bool) {
        self.generator
            .lock()
            .expect("lock poisoned")
            .set_ignore_time_skew(ignore);
    }

    // ---- keep-alive entries --------------------------------------------

    /// Records a keep-alive entry for `rid`; returns whether it was new.
    pub fn ensure_keep_alive(&self, rid: ReplicaId) -> bool {
        let added = self
            .keep_alives
            .lock()
            .expect("lock poisoned")
            .insert(rid);
        if added {
            info!(rid = %rid, root = %self.root, "created keep alive entry");
        }
        added
    }

    /// Removes the keep-alive entry for `rid`; returns whether one existed.
    pub fn remove_keep_alive(&self, rid: ReplicaId) -> bool {
        let removed = self
            .keep_alives
            .lock()
            .expect("lock poisoned")
            .remove(&rid);
        if removed {
            info!(rid = %rid, root = %self.root, "removed keep alive entry");
        }
        removed
    }

    /// Whether a keep-alive entry exists for `rid`.
    pub fn has_keep_alive(&self, rid: ReplicaId) -> bool {
        self.keep_alives
            .lock()
            .expect("lock poisoned")
            .contains(&rid)
    }

    // ---- state flags ----------------------------------------------------

    /// Points reads at the supplier while a total update runs.
    pub fn set_referral(&self, on: bool) {
        self.referral.store(on, Ordering::SeqCst);
    }

    /// Whether reads are being referred away.
    pub fn has_referral(&self) -> bool {
        self.referral.load(Ordering::SeqCst)
    }

    /// Pauses tombstone reaping; a running total update must not race it.
    pub fn suspend_tombstone_reap(&self) {
        self.tombstone_reap_suspended.store(true, Ordering::SeqCst);
    }

    /// Resumes tombstone reaping.
    pub fn resume_tombstone_reap(&self) {
        self.tombstone_reap_suspended.store(false, Ordering::SeqCst);
    }

    /// Whether tombstone reaping is paused.
    pub fn is_tombstone_reap_suspended(&self) -> bool {
        self.tombstone_reap_suspended.load(Ordering::SeqCst)
    }

    /// Marks the replica as mid-configuration; sessions bounce off.
    pub fn set_being_configured(&self, on: bool) {
        self.being_configured.store(on, Ordering::SeqCst);
    }

    /// Whether an administrator is reconfiguring the replica.
    pub fn is_being_configured(&self) -> bool {
        self.being_configured.load(Ordering::SeqCst)
    }

    /// Excludes the replica from total-update initialization.
    pub fn set_total_excluded(&self, on: bool) {
        self.total_excluded.store(on, Ordering::SeqCst);
    }

    /// Whether total updates are administratively excluded.
    pub fn is_total_excluded(&self) -> bool {
        self.total_excluded.load(Ordering::SeqCst)
    }

    /// Enters bulk-import mode for a total update.
    pub fn start_bulk_import(&self) {
        self.bulk_import.store(true, Ordering::SeqCst);
    }

    /// Leaves bulk-import mode.
    pub fn finish_bulk_import(&self) {
        self.bulk_import.store(false, Ordering::SeqCst);
    }

    /// Whether a bulk import is in flight.
    pub fn is_bulk_importing(&self) -> bool {
        self.bulk_import.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("rid", &self.rid)
            .field("root", &self.root)
            .field("purl", &self.purl)
            .field("updatable", &self.updatable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica() -> Replica {
        Replica::new(ReplicaId::new(1), "dc=example,dc=com", "ldap://a:389", 1_000)
    }

    #[test]
    fn test_acquire_then_contend() {
        let r = replica();
        r.get_exclusive_access(10, 1, "ldap://b:389", SessionFlavor::Incremental)
            .unwrap();
        let err = r
            .get_exclusive_access(11, 1, "ldap://c:389", SessionFlavor::Incremental)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "locked by ldap://b:389 for incremental update"
        );
        // No release timeout, so the loser must not arm an abort.
        assert!(!r.session_abort_requested());
    }

    #[test]
    fn test_total_holder_named_in_diagnostic() {
        let r = replica();
        r.get_exclusive_access(10, 1, "ldap://b:389", SessionFlavor::Total)
            .unwrap();
        let err = r
            .get_exclusive_access(11, 1, "ldap://c:389", SessionFlavor::Incremental)
            .unwrap_err();
        assert_eq!(err.to_string(), "locked by ldap://b:389 for total update");
    }

    #[test]
    fn test_same_conn_reacquire_needs_release_timeout() {
        let r = replica();
        r.get_exclusive_access(10, 1, "ldap://b:389", SessionFlavor::Incremental)
            .unwrap();
        // Without a timeout the same connection still bounces.
        assert!(r
            .get_exclusive_access(10, 2, "ldap://b:389", SessionFlavor::Incremental)
            .is_err());
    }

    #[test]
    fn test_same_conn_reacquire_with_timeout() {
        let mut r = replica();
        r.set_release_timeout(60);
        r.get_exclusive_access(10, 1, "ldap://b:389", SessionFlavor::Incremental)
            .unwrap();
        r.get_exclusive_access(10, 2, "ldap://b2:389", SessionFlavor::Incremental)
            .unwrap();
        assert_eq!(r.current_holder().as_deref(), Some("ldap://b2:389"));
        // A total holder is never taken over, even on the same conn.
        r.relinquish_exclusive_access(10, 2);
        r.get_exclusive_access(10, 3, "ldap://b:389", SessionFlavor::Total)
            .unwrap();
        assert!(r
            .get_exclusive_access(10, 4, "ldap://b:389", SessionFlavor::Incremental)
            .is_err());
    }

    #[test]
    fn test_busy_with_timeout_arms_abort() {
        let mut r = replica();
        r.set_release_timeout(60);
        r.get_exclusive_access(10, 1, "ldap://b:389", SessionFlavor::Incremental)
            .unwrap();
        let _ = r.get_exclusive_access(11, 1, "ldap://c:389", SessionFlavor::Total);
        assert!(r.session_abort_requested());
    }

    #[test]
    fn test_relinquish_clears_token() {
        let r = replica();
        r.get_exclusive_access(10, 1, "ldap://b:389", SessionFlavor::Incremental)
            .unwrap();
        r.relinquish_exclusive_access(10, 1);
        assert!(!r.is_in_use());
        assert!(r.current_holder().is_none());
        r.get_exclusive_access(11, 1, "ldap://c:389", SessionFlavor::Total)
            .unwrap();
    }

    #[test]
    fn test_relinquish_when_not_held_is_noop() {
        let r = replica();
        r.relinquish_exclusive_access(10, 1);
        assert!(!r.is_in_use());
    }

    #[test]
    fn test_update_dn_gate() {
        let mut r = replica();
        assert!(r.can_update("cn=anyone"));
        r.set_update_dns(vec!["cn=Replication Manager".to_string()]);
        assert!(r.can_update("cn=replication manager"));
        assert!(!r.can_update("cn=someone else"));
    }

    #[test]
    fn test_keep_alive_entries() {
        let r = replica();
        assert!(r.ensure_keep_alive(ReplicaId::new(3)));
        assert!(!r.ensure_keep_alive(ReplicaId::new(3)));
        assert!(r.has_keep_alive(ReplicaId::new(3)));
        assert!(r.remove_keep_alive(ReplicaId::new(3)));
        assert!(!r.remove_keep_alive(ReplicaId::new(3)));
    }

    #[test]
    fn test_ruv_snapshot_is_owner_first() {
        let r = replica();
        r.update_ruv(Csn::new(2_000, 0, ReplicaId::new(4), 0), "ldap://d:389");
        let ruv = r.ruv();
        assert_eq!(ruv.local_rid(), Some(ReplicaId::new(1)));
        assert_eq!(ruv.elements()[0].rid, ReplicaId::new(1));
        assert!(ruv.contains(ReplicaId::new(4)));
    }
}
