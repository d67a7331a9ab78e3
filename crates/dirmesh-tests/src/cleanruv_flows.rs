//! Mesh-wide rid retirement: full cleans, laggard gating, force mode,
//! aborts, and marker-driven restart resume.

use dirmesh_cleanruv::{CleanError, CleanMarker, TaskKind, TaskStatus};
use dirmesh_model::csn::ReplicaId;
use dirmesh_node::Node;
use dirmesh_session::extop::{
    RidRootPayload, CLEANRUV_CLEANING, CLEANRUV_FINISHED, EXTOP_CLEANRUV_CHECK_STATUS_OID,
};
use dirmesh_session::{ExtopRequest, Mesh, ResponseCode};

use crate::harness::{abort_entry, clean_entry, purl, wait_until, TestMesh, ROOT};

const RID: u16 = 9;

fn rid() -> ReplicaId {
    ReplicaId::new(RID)
}

fn holds_rid(node: &Node) -> bool {
    node.replica().max_csn_for(rid()).is_some()
}

async fn clean_status(mesh: &Mesh, to: &str) -> String {
    let payload = RidRootPayload {
        rid: rid(),
        root: ROOT.to_string(),
    }
    .render();
    let req = ExtopRequest::new(
        EXTOP_CLEANRUV_CHECK_STATUS_OID,
        999,
        1,
        "cn=replication manager",
        payload.into_bytes(),
    );
    let resp = mesh.send_extop(to, req).await.unwrap();
    assert_eq!(resp.code, ResponseCode::Ready);
    resp.text()
}

#[tokio::test]
async fn test_clean_retires_the_rid_across_the_mesh() {
    let tm = TestMesh::fully_meshed(&[1, 2, 3]);
    tm.seed(0, RID, 5);
    tm.converge().await;
    for node in tm.nodes() {
        assert!(holds_rid(node));
        assert_eq!(node.changelog().entry_count(), 5);
    }

    let handle = tm
        .node(0)
        .dispatcher()
        .submit(TaskKind::CleanAllRuv, &clean_entry("retire-9", RID, false))
        .await
        .unwrap();
    assert_eq!(handle.wait().await, TaskStatus::Success);

    for node in tm.nodes() {
        assert!(!holds_rid(node), "rid survived on {}", node.replica().purl());
        assert_eq!(node.changelog().entry_count(), 0);
        assert!(node.runner().markers().clean_markers().is_empty());
    }
    for id in [1u16, 2, 3] {
        assert_eq!(clean_status(tm.mesh(), &purl(id)).await, CLEANRUV_FINISHED);
    }

    // The propagated workers on the other nodes drain shortly after.
    wait_until(
        || tm.nodes().iter().all(|n| !n.runner().registry().is_retiring(rid())),
        "propagated workers to finish",
    )
    .await;
}

#[tokio::test]
async fn test_laggard_peer_gates_the_clean() {
    let tm = TestMesh::fully_meshed(&[1, 2]);
    tm.seed_range(0, RID, 0, 100);
    tm.seed_range(1, RID, 0, 90);

    let handle = tm
        .node(0)
        .dispatcher()
        .submit(TaskKind::CleanAllRuv, &clean_entry("retire-9", RID, false))
        .await
        .unwrap();

    // The task parks in the catch-up gate while the peer is behind.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(handle.status().is_none());
    assert!(holds_rid(tm.node(0)));
    assert!(holds_rid(tm.node(1)));
    assert_eq!(clean_status(tm.mesh(), &purl(1)).await, CLEANRUV_CLEANING);
    assert_eq!(clean_status(tm.mesh(), &purl(2)).await, CLEANRUV_FINISHED);

    tm.seed_range(1, RID, 90, 10);
    assert_eq!(handle.wait().await, TaskStatus::Success);
    wait_until(
        || !holds_rid(tm.node(0)) && !holds_rid(tm.node(1)),
        "both replicas to drop the rid",
    )
    .await;
}

#[tokio::test]
async fn test_second_clean_of_the_same_rid_is_refused() {
    let tm = TestMesh::fully_meshed(&[1, 2]);
    tm.seed_range(0, RID, 0, 100);
    tm.seed_range(1, RID, 0, 90);

    let first = tm
        .node(0)
        .dispatcher()
        .submit(TaskKind::CleanAllRuv, &clean_entry("first", RID, false))
        .await
        .unwrap();
    assert!(first.status().is_none());

    let err = tm
        .node(0)
        .dispatcher()
        .submit(TaskKind::CleanAllRuv, &clean_entry("second", RID, false))
        .await
        .unwrap_err();
    assert!(matches!(err, CleanError::AlreadyCleaning(_)));
    assert_eq!(err.admin_code(), 53);
}

#[tokio::test]
async fn test_force_clean_passes_an_unreachable_peer() {
    let tm = TestMesh::fully_meshed(&[1, 2]);
    tm.seed(0, RID, 3);
    tm.converge().await;
    tm.mesh().set_unreachable(&purl(2), true);

    let handle = tm
        .node(0)
        .dispatcher()
        .submit(TaskKind::CleanAllRuv, &clean_entry("force-9", RID, true))
        .await
        .unwrap();
    assert_eq!(handle.wait().await, TaskStatus::Success);

    assert!(!holds_rid(tm.node(0)));
    assert_eq!(tm.node(0).changelog().entry_count(), 0);
    // The unreachable peer never saw the task and keeps its copy.
    assert!(holds_rid(tm.node(1)));
    assert_eq!(tm.node(1).changelog().entry_count(), 3);
    assert!(tm.node(1).runner().markers().clean_markers().is_empty());
}

#[tokio::test]
async fn test_abort_unwinds_the_clean_and_keeps_the_ruv() {
    let tm = TestMesh::fully_meshed(&[1, 2]);
    tm.seed_range(0, RID, 0, 100);
    tm.seed_range(1, RID, 0, 90);

    let clean = tm
        .node(0)
        .dispatcher()
        .submit(TaskKind::CleanAllRuv, &clean_entry("retire-9", RID, false))
        .await
        .unwrap();
    assert!(clean.status().is_none());

    let abort = tm
        .node(0)
        .dispatcher()
        .submit(TaskKind::AbortCleanAllRuv, &abort_entry("stop-9", RID, true))
        .await
        .unwrap();
    assert_eq!(clean.wait().await, TaskStatus::Stopped);
    assert_eq!(abort.wait().await, TaskStatus::Success);

    assert!(holds_rid(tm.node(0)));
    assert_eq!(tm.node(0).changelog().entry_count(), 100);
    let registry = tm.node(0).runner().registry();
    assert!(!registry.is_retiring(rid()));
    assert!(!registry.is_aborted(rid()));
    assert!(tm.node(0).runner().markers().clean_markers().is_empty());
    assert!(tm.node(0).runner().markers().abort_markers().is_empty());
}

#[tokio::test]
async fn test_abort_without_a_running_clean_is_refused() {
    let tm = TestMesh::fully_meshed(&[1, 2]);
    tm.seed(0, RID, 3);

    let err = tm
        .node(0)
        .dispatcher()
        .submit(TaskKind::AbortCleanAllRuv, &abort_entry("stop-9", RID, false))
        .await
        .unwrap_err();
    assert!(matches!(err, CleanError::NotBeingCleaned(_)));
    assert_eq!(err.admin_code(), 53);
    assert_eq!(
        err.to_string(),
        "rid 9 is not being cleaned, nothing to abort"
    );
}

#[tokio::test]
async fn test_resume_finishes_an_interrupted_clean() {
    let tm = TestMesh::fully_meshed(&[1, 2]);
    tm.seed(0, RID, 4);
    tm.converge().await;

    // A marker left behind by a shutdown mid-task.
    tm.node(0).runner().markers().add_clean(&CleanMarker {
        rid: rid(),
        force: false,
        original: true,
        root: ROOT.to_string(),
    });

    tm.node(0).start().await;
    let tasks = tm.node(0).dispatcher().tasks();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].name().starts_with("restarted-"));
    assert_eq!(tasks[0].wait().await, TaskStatus::Success);

    wait_until(
        || tm.nodes().iter().all(|n| !holds_rid(n)),
        "both replicas to drop the rid",
    )
    .await;
    assert_eq!(tm.node(1).changelog().entry_count(), 0);
}
