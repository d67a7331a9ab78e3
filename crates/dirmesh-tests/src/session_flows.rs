//! Session-layer scenarios: exclusive consumer access and multi-hop
//! convergence.

use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::ruv::Ruv;
use dirmesh_session::extop::{
    EndRequest, StartRequest, EXTOP_END_OID, EXTOP_START_OID, PROTO_NSDS50_INCREMENTAL_OID,
};
use dirmesh_session::{ExtopRequest, PeerNode, ResponseCode};

use crate::harness::{purl, TestMesh, ROOT, SEED_BASE};

fn start_request(supplier_rid: u16, conn_id: u64) -> ExtopRequest {
    let rid = ReplicaId::new(supplier_rid);
    let supplier_purl = format!("ldap://supplier{supplier_rid}:389");
    let mut supplier_ruv = Ruv::with_local(rid, &supplier_purl);
    supplier_ruv.update(Csn::new(SEED_BASE, 0, rid, 0), &supplier_purl);
    let start = StartRequest {
        protocol_oid: PROTO_NSDS50_INCREMENTAL_OID.to_string(),
        root: ROOT.to_string(),
        supplier_ruv,
        referrals: vec![],
        csn: Csn::new(SEED_BASE, 0, rid, 0),
    };
    ExtopRequest::new(
        EXTOP_START_OID,
        conn_id,
        1,
        "cn=replication manager",
        start.encode().unwrap(),
    )
}

fn end_request(supplier_rid: u16, conn_id: u64) -> ExtopRequest {
    let rid = ReplicaId::new(supplier_rid);
    let supplier_purl = format!("ldap://supplier{supplier_rid}:389");
    let end = EndRequest {
        root: ROOT.to_string(),
        supplier_ruv: Ruv::with_local(rid, &supplier_purl),
    };
    ExtopRequest::new(
        EXTOP_END_OID,
        conn_id,
        2,
        "cn=replication manager",
        end.encode().unwrap(),
    )
}

#[tokio::test]
async fn test_exactly_one_supplier_acquires_the_consumer() {
    let tm = TestMesh::fully_meshed(&[1]);
    let consumer = tm.node(0);

    let first = consumer.handle_extop(start_request(7, 701));
    let second = consumer.handle_extop(start_request(8, 802));

    assert_eq!(first.code, ResponseCode::Ready);
    assert_eq!(second.code, ResponseCode::Busy);
    assert_eq!(
        second.text(),
        "locked by ldap://supplier7:389 for incremental update"
    );
}

#[tokio::test]
async fn test_release_lets_the_next_supplier_in() {
    let tm = TestMesh::fully_meshed(&[1]);
    let consumer = tm.node(0);

    assert_eq!(
        consumer.handle_extop(start_request(7, 701)).code,
        ResponseCode::Ready
    );
    assert_eq!(
        consumer.handle_extop(end_request(7, 701)).code,
        ResponseCode::ReplicaReleaseSucceeded
    );
    assert_eq!(
        consumer.handle_extop(start_request(8, 802)).code,
        ResponseCode::Ready
    );
}

#[tokio::test]
async fn test_chain_converges_end_to_end() {
    let tm = TestMesh::chained(&[1, 2, 3]);
    tm.seed(0, 1, 5);

    tm.converge().await;

    let supplier_max = tm.node(0).replica().max_csn_for(ReplicaId::new(1)).unwrap();
    for node in tm.nodes() {
        assert_eq!(node.changelog().entry_count(), 5);
        assert!(node.replica().covers_csn(&supplier_max));
    }
}

#[tokio::test]
async fn test_second_pass_ships_nothing() {
    let tm = TestMesh::fully_meshed(&[1, 2]);
    tm.seed(0, 1, 3);

    assert_eq!(tm.node(0).replicate_once().await, 3);
    assert_eq!(tm.node(0).replicate_once().await, 0);
    assert_eq!(tm.node(1).changelog().entry_count(), 3);
}

#[tokio::test]
async fn test_unreachable_consumer_does_not_stall_the_pass() {
    let tm = TestMesh::fully_meshed(&[1, 2, 3]);
    tm.seed(0, 1, 2);
    tm.mesh().set_unreachable(&purl(3), true);

    // The pass fails toward node 3 and still feeds node 2.
    tm.node(0).replicate_once().await;
    assert_eq!(tm.node(1).changelog().entry_count(), 2);
    assert_eq!(tm.node(2).changelog().entry_count(), 0);

    tm.mesh().set_unreachable(&purl(3), false);
    tm.converge().await;
    assert_eq!(tm.node(2).changelog().entry_count(), 2);
}
