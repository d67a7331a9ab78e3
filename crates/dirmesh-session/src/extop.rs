//! Extended-operation identifiers, response codes, and payload codecs.
//!
//! The OIDs and response code values are wire-compatible with the NSDS
//! replication protocol family. Session payloads (start/end) are bincode
//! framed; the CleanAllRUV family uses colon-joined text payloads.

use serde::{Deserialize, Serialize};

use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::ruv::Ruv;

use crate::error::SessionError;

/// Start of a replication session.
pub const EXTOP_START_OID: &str = "2.16.840.1.113730.3.5.3";
/// Response to a session extended operation.
pub const EXTOP_RESPONSE_OID: &str = "2.16.840.1.113730.3.5.4";
/// End of a replication session.
pub const EXTOP_END_OID: &str = "2.16.840.1.113730.3.5.5";

/// NSDS50 incremental update protocol.
pub const PROTO_NSDS50_INCREMENTAL_OID: &str = "2.16.840.1.113730.3.6.1";
/// NSDS50 total update protocol.
pub const PROTO_NSDS50_TOTAL_OID: &str = "2.16.840.1.113730.3.6.2";
/// NSDS71 total update protocol.
pub const PROTO_NSDS71_TOTAL_OID: &str = "2.16.840.1.113730.3.6.3";
/// NSDS71 incremental update protocol.
pub const PROTO_NSDS71_INCREMENTAL_OID: &str = "2.16.840.1.113730.3.6.4";

/// CleanAllRUV propagation.
pub const EXTOP_CLEANRUV_OID: &str = "2.16.840.1.113730.3.6.5";
/// CleanAllRUV abort propagation.
pub const EXTOP_ABORT_CLEANRUV_OID: &str = "2.16.840.1.113730.3.6.6";
/// Query for a peer's max CSN for a rid.
pub const EXTOP_CLEANRUV_GET_MAXCSN_OID: &str = "2.16.840.1.113730.3.6.7";
/// Query whether a peer has finished cleaning or aborting.
pub const EXTOP_CLEANRUV_CHECK_STATUS_OID: &str = "2.16.840.1.113730.3.6.8";

/// CleanAllRUV reply: the extop was admitted.
pub const CLEANRUV_ACCEPTED: &str = "accepted";
/// CleanAllRUV reply: the extop was refused.
pub const CLEANRUV_REJECTED: &str = "rejected";
/// CleanAllRUV reply: the task is done on this replica.
pub const CLEANRUV_FINISHED: &str = "finished";
/// CleanAllRUV reply: the task is still running on this replica.
pub const CLEANRUV_CLEANING: &str = "cleaning";
/// CleanAllRUV reply: an abort is still unwinding on this replica.
pub const CLEANRUV_ABORTING: &str = "aborting";
/// GetMaxCSN reply when the rid is absent from the local RUV.
pub const CLEANRUV_NO_MAXCSN: &str = "no maxcsn";

/// Session response codes, wire-compatible with the NSDS50 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseCode {
    /// The replica is locked and ready for updates.
    Ready = 0x00,
    /// The replica is held by another session or mid-configuration.
    Busy = 0x01,
    /// The supplier's clock is too far from ours.
    ExcessiveClockSkew = 0x02,
    /// The bound identity may not supply updates.
    PermissionDenied = 0x03,
    /// The request payload did not decode.
    DecodingError = 0x04,
    /// The named update protocol is not one we speak.
    UnknownUpdateProtocol = 0x05,
    /// No replica is configured for the named subtree.
    NoSuchReplica = 0x06,
    /// The consumer's resume point was trimmed away.
    BelowPurgePoint = 0x07,
    /// Unclassified consumer-side failure.
    InternalError = 0x08,
    /// The session token was released.
    ReplicaReleaseSucceeded = 0x09,
    /// The consumer only speaks the legacy protocol.
    LegacyConsumer = 0x0A,
    /// The supplier presented our own replica id.
    ReplicaIdError = 0x0B,
    /// Replication is administratively disabled.
    Disabled = 0x0C,
    /// Nothing to send.
    UpToDate = 0x0D,
    /// The supplier should retry later.
    Backoff = 0x0E,
    /// A changelog operation failed during the session.
    ChangelogError = 0x0F,
    /// The peer could not be reached.
    ConnectionError = 0x10,
    /// The peer did not answer in time.
    ConnectionTimeout = 0x11,
    /// Transient failure; retry without operator action.
    TransientError = 0x12,
    /// An RUV operation failed during the session.
    RuvError = 0x13,
    /// No response was received at all.
    NoResponse = 0xFF,
}

impl ResponseCode {
    /// Wire value of this code.
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Decodes a wire value; unknown values collapse to `NoResponse`.
    pub fn from_u8(value: u8) -> ResponseCode {
        match value {
            0x00 => ResponseCode::Ready,
            0x01 => ResponseCode::Busy,
            0x02 => ResponseCode::ExcessiveClockSkew,
            0x03 => ResponseCode::PermissionDenied,
            0x04 => ResponseCode::DecodingError,
            0x05 => ResponseCode::UnknownUpdateProtocol,
            0x06 => ResponseCode::NoSuchReplica,
            0x07 => ResponseCode::BelowPurgePoint,
            0x08 => ResponseCode::InternalError,
            0x09 => ResponseCode::ReplicaReleaseSucceeded,
            0x0A => ResponseCode::LegacyConsumer,
            0x0B => ResponseCode::ReplicaIdError,
            0x0C => ResponseCode::Disabled,
            0x0D => ResponseCode::UpToDate,
            0x0E => ResponseCode::Backoff,
            0x0F => ResponseCode::ChangelogError,
            0x10 => ResponseCode::ConnectionError,
            0x11 => ResponseCode::ConnectionTimeout,
            0x12 => ResponseCode::TransientError,
            0x13 => ResponseCode::RuvError,
            _ => ResponseCode::NoResponse,
        }
    }
}

/// One extended-operation request as carried by the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtopRequest {
    /// Operation identifier; selects the handler.
    pub oid: String,
    /// Connection the request arrived on.
    pub conn_id: u64,
    /// Operation id within the connection.
    pub op_id: u64,
    /// Identity the requester is bound as.
    pub bind_dn: String,
    /// Operation-specific payload.
    pub payload: Vec<u8>,
}

impl ExtopRequest {
    /// Builds a request for `oid` with a raw payload.
    pub fn new(oid: &str, conn_id: u64, op_id: u64, bind_dn: &str, payload: Vec<u8>) -> Self {
        ExtopRequest {
            oid: oid.to_string(),
            conn_id,
            op_id,
            bind_dn: bind_dn.to_string(),
            payload,
        }
    }

    /// The payload as text, for the colon-joined operation family.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// One extended-operation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtopResponse {
    /// Always [`EXTOP_RESPONSE_OID`].
    pub oid: String,
    /// Outcome code.
    pub code: ResponseCode,
    /// Code-specific payload: the local RUV for `Ready`, a diagnostic
    /// string for `Busy`, a text reply for the CleanAllRUV family.
    pub payload: Vec<u8>,
}

impl ExtopResponse {
    /// A bare response with no payload.
    pub fn new(code: ResponseCode) -> Self {
        ExtopResponse {
            oid: EXTOP_RESPONSE_OID.to_string(),
            code,
            payload: Vec::new(),
        }
    }

    /// A response carrying raw payload bytes.
    pub fn with_payload(code: ResponseCode, payload: Vec<u8>) -> Self {
        ExtopResponse {
            oid: EXTOP_RESPONSE_OID.to_string(),
            code,
            payload,
        }
    }

    /// A response carrying a text payload.
    pub fn with_text(code: ResponseCode, text: &str) -> Self {
        Self::with_payload(code, text.as_bytes().to_vec())
    }

    /// The payload as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// The payload decoded as an RUV, for `Ready` responses.
    pub fn ruv(&self) -> Result<Ruv, SessionError> {
        bincode::deserialize(&self.payload).map_err(|e| SessionError::Decode(e.to_string()))
    }
}

/// Payload of the session-start extended operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Update protocol the supplier wants to run.
    pub protocol_oid: String,
    /// Replicated subtree root.
    pub root: String,
    /// The supplier's RUV at session start.
    pub supplier_ruv: Ruv,
    /// Referral URLs the supplier advertises.
    pub referrals: Vec<String>,
    /// A fresh supplier CSN, used for the consumer's skew check.
    pub csn: Csn,
}

/// Payload of the session-end extended operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndRequest {
    /// Replicated subtree root.
    pub root: String,
    /// The supplier's RUV as of the update stream it just sent.
    pub supplier_ruv: Ruv,
}

impl StartRequest {
    /// Frames the request for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        bincode::serialize(self).map_err(|e| SessionError::Decode(e.to_string()))
    }

    /// Unframes a request from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        bincode::deserialize(bytes).map_err(|e| SessionError::Decode(e.to_string()))
    }
}

impl EndRequest {
    /// Frames the request for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        bincode::serialize(self).map_err(|e| SessionError::Decode(e.to_string()))
    }

    /// Unframes a request from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        bincode::deserialize(bytes).map_err(|e| SessionError::Decode(e.to_string()))
    }
}

/// Whether a protocol OID names an incremental or a total update, if any.
pub fn protocol_flavor(oid: &str) -> Option<SessionFlavor> {
    match oid {
        PROTO_NSDS50_INCREMENTAL_OID | PROTO_NSDS71_INCREMENTAL_OID => {
            Some(SessionFlavor::Incremental)
        }
        PROTO_NSDS50_TOTAL_OID | PROTO_NSDS71_TOTAL_OID => Some(SessionFlavor::Total),
        _ => None,
    }
}

/// The two kinds of update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlavor {
    /// Replay of changes the consumer has not seen.
    Incremental,
    /// Full reseed of the consumer.
    Total,
}

impl SessionFlavor {
    /// Lowercase name used in busy diagnostics and logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionFlavor::Incremental => "incremental",
            SessionFlavor::Total => "total",
        }
    }
}

/// Payload of the CleanRUV extended operation: `rid:root:maxcsn[:force]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanRuvPayload {
    /// Replica id being retired.
    pub rid: ReplicaId,
    /// Replicated subtree root.
    pub root: String,
    /// Highest CSN the rid is known to have produced; zero when none.
    pub maxcsn: Csn,
    /// Skip the liveness and catch-up gates.
    pub force: bool,
}

impl CleanRuvPayload {
    /// Renders the colon-joined wire form.
    pub fn render(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.rid.as_u16(),
            self.root,
            self.maxcsn,
            yes_no(self.force)
        )
    }

    /// Parses the wire form; a missing force field means "no".
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        let mut parts = s.splitn(4, ':');
        let rid = parse_rid(parts.next())?;
        let root = required(parts.next(), "root")?;
        let maxcsn = parse_csn(parts.next())?;
        let force = parts.next().map(is_yes).unwrap_or(false);
        Ok(CleanRuvPayload {
            rid,
            root,
            maxcsn,
            force,
        })
    }
}

/// Payload of the AbortCleanRUV extended operation: `rid:root:certify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortRuvPayload {
    /// Replica id whose clean task is being aborted.
    pub rid: ReplicaId,
    /// Replicated subtree root.
    pub root: String,
    /// Whether every peer must confirm the abort.
    pub certify: bool,
}

impl AbortRuvPayload {
    /// Renders the colon-joined wire form.
    pub fn render(&self) -> String {
        format!("{}:{}:{}", self.rid.as_u16(), self.root, yes_no(self.certify))
    }

    /// Parses the wire form.
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        let mut parts = s.splitn(3, ':');
        let rid = parse_rid(parts.next())?;
        let root = required(parts.next(), "root")?;
        let certify = parts.next().map(is_yes).unwrap_or(false);
        Ok(AbortRuvPayload { rid, root, certify })
    }
}

/// Payload of the GetMaxCSN and CheckCleanStatus operations: `rid:root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RidRootPayload {
    /// Replica id being asked about.
    pub rid: ReplicaId,
    /// Replicated subtree root.
    pub root: String,
}

impl RidRootPayload {
    /// Renders the colon-joined wire form.
    pub fn render(&self) -> String {
        format!("{}:{}", self.rid.as_u16(), self.root)
    }

    /// Parses the wire form.
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        let mut parts = s.splitn(2, ':');
        let rid = parse_rid(parts.next())?;
        let root = required(parts.next(), "root")?;
        Ok(RidRootPayload { rid, root })
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

fn is_yes(s: &str) -> bool {
    s.eq_ignore_ascii_case("yes")
}

fn required(part: Option<&str>, field: &str) -> Result<String, SessionError> {
    match part {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(SessionError::Decode(format!("missing {field}"))),
    }
}

fn parse_rid(part: Option<&str>) -> Result<ReplicaId, SessionError> {
    let text = part.ok_or_else(|| SessionError::Decode("missing rid".into()))?;
    let value: u16 = text
        .parse()
        .map_err(|_| SessionError::Decode(format!("bad rid: {text}")))?;
    Ok(ReplicaId::new(value))
}

fn parse_csn(part: Option<&str>) -> Result<Csn, SessionError> {
    let text = part.ok_or_else(|| SessionError::Decode("missing maxcsn".into()))?;
    text.parse()
        .map_err(|_| SessionError::Decode(format!("bad csn: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod response_codes {
        use super::*;

        #[test]
        fn test_wire_values_are_exact() {
            assert_eq!(ResponseCode::Ready.as_u8(), 0x00);
            assert_eq!(ResponseCode::Busy.as_u8(), 0x01);
            assert_eq!(ResponseCode::ExcessiveClockSkew.as_u8(), 0x02);
            assert_eq!(ResponseCode::PermissionDenied.as_u8(), 0x03);
            assert_eq!(ResponseCode::DecodingError.as_u8(), 0x04);
            assert_eq!(ResponseCode::UnknownUpdateProtocol.as_u8(), 0x05);
            assert_eq!(ResponseCode::NoSuchReplica.as_u8(), 0x06);
            assert_eq!(ResponseCode::BelowPurgePoint.as_u8(), 0x07);
            assert_eq!(ResponseCode::InternalError.as_u8(), 0x08);
            assert_eq!(ResponseCode::ReplicaReleaseSucceeded.as_u8(), 0x09);
            assert_eq!(ResponseCode::LegacyConsumer.as_u8(), 0x0A);
            assert_eq!(ResponseCode::ReplicaIdError.as_u8(), 0x0B);
            assert_eq!(ResponseCode::Disabled.as_u8(), 0x0C);
            assert_eq!(ResponseCode::UpToDate.as_u8(), 0x0D);
            assert_eq!(ResponseCode::Backoff.as_u8(), 0x0E);
            assert_eq!(ResponseCode::ChangelogError.as_u8(), 0x0F);
            assert_eq!(ResponseCode::ConnectionError.as_u8(), 0x10);
            assert_eq!(ResponseCode::ConnectionTimeout.as_u8(), 0x11);
            assert_eq!(ResponseCode::TransientError.as_u8(), 0x12);
            assert_eq!(ResponseCode::RuvError.as_u8(), 0x13);
            assert_eq!(ResponseCode::NoResponse.as_u8(), 0xFF);
        }

        #[test]
        fn test_round_trip_and_unknown() {
            for v in 0x00..=0x13u8 {
                assert_eq!(ResponseCode::from_u8(v).as_u8(), v);
            }
            assert_eq!(ResponseCode::from_u8(0x77), ResponseCode::NoResponse);
            assert_eq!(ResponseCode::from_u8(0xFF), ResponseCode::NoResponse);
        }
    }

    mod session_payloads {
        use super::*;

        #[test]
        fn test_start_request_round_trips() {
            let mut ruv = Ruv::with_local(ReplicaId::new(1), "ldap://a:389");
            ruv.update(Csn::new(100, 0, ReplicaId::new(1), 0), "ldap://a:389");
            let req = StartRequest {
                protocol_oid: PROTO_NSDS50_INCREMENTAL_OID.to_string(),
                root: "dc=example,dc=com".to_string(),
                supplier_ruv: ruv,
                referrals: vec!["ldap://a:389".to_string()],
                csn: Csn::new(100, 1, ReplicaId::new(1), 0),
            };
            let decoded = StartRequest::decode(&req.encode().unwrap()).unwrap();
            assert_eq!(decoded.protocol_oid, req.protocol_oid);
            assert_eq!(decoded.root, req.root);
            assert_eq!(decoded.csn, req.csn);
            assert_eq!(
                decoded.supplier_ruv.max_csn_for(ReplicaId::new(1)),
                Some(Csn::new(100, 0, ReplicaId::new(1), 0))
            );
        }

        #[test]
        fn test_garbage_fails_to_decode() {
            assert!(StartRequest::decode(b"not bincode").is_err());
            assert!(EndRequest::decode(&[0xde, 0xad]).is_err());
        }

        #[test]
        fn test_protocol_flavor() {
            assert_eq!(
                protocol_flavor(PROTO_NSDS50_INCREMENTAL_OID),
                Some(SessionFlavor::Incremental)
            );
            assert_eq!(
                protocol_flavor(PROTO_NSDS71_INCREMENTAL_OID),
                Some(SessionFlavor::Incremental)
            );
            assert_eq!(
                protocol_flavor(PROTO_NSDS50_TOTAL_OID),
                Some(SessionFlavor::Total)
            );
            assert_eq!(
                protocol_flavor(PROTO_NSDS71_TOTAL_OID),
                Some(SessionFlavor::Total)
            );
            assert_eq!(protocol_flavor("1.2.3"), None);
        }
    }

    mod clean_payloads {
        use super::*;

        #[test]
        fn test_clean_payload_round_trips() {
            let payload = CleanRuvPayload {
                rid: ReplicaId::new(7),
                root: "dc=example,dc=com".to_string(),
                maxcsn: Csn::new(100, 2, ReplicaId::new(7), 0),
                force: true,
            };
            let text = payload.render();
            assert_eq!(
                text,
                format!("7:dc=example,dc=com:{}:yes", payload.maxcsn)
            );
            assert_eq!(CleanRuvPayload::parse(&text).unwrap(), payload);
        }

        #[test]
        fn test_clean_payload_force_defaults_to_no() {
            let parsed =
                CleanRuvPayload::parse("7:dc=example,dc=com:00000064000200070000").unwrap();
            assert!(!parsed.force);
            let parsed =
                CleanRuvPayload::parse("7:dc=example,dc=com:00000064000200070000:maybe").unwrap();
            assert!(!parsed.force);
        }

        #[test]
        fn test_abort_payload_round_trips() {
            let payload = AbortRuvPayload {
                rid: ReplicaId::new(7),
                root: "dc=example,dc=com".to_string(),
                certify: false,
            };
            assert_eq!(payload.render(), "7:dc=example,dc=com:no");
            assert_eq!(AbortRuvPayload::parse(&payload.render()).unwrap(), payload);
        }

        #[test]
        fn test_rid_root_payload_round_trips() {
            let payload = RidRootPayload {
                rid: ReplicaId::new(65534),
                root: "dc=example,dc=com".to_string(),
            };
            assert_eq!(payload.render(), "65534:dc=example,dc=com");
            assert_eq!(RidRootPayload::parse(&payload.render()).unwrap(), payload);
        }

        #[test]
        fn test_malformed_payloads_rejected() {
            assert!(CleanRuvPayload::parse("x:root:00000000000000000000").is_err());
            assert!(CleanRuvPayload::parse("7").is_err());
            assert!(CleanRuvPayload::parse("7:root:zzzz").is_err());
            assert!(AbortRuvPayload::parse("99999:root:no").is_err());
            assert!(RidRootPayload::parse("7:").is_err());
        }
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_clean_payload_round_trips(
                rid in 0u16..u16::MAX,
                root in "[a-z]{1,8}=[a-z]{1,12}(,[a-z]{1,8}=[a-z]{1,12}){0,3}",
                t in 0u64..u32::MAX as u64,
                seq in 0u16..100,
                force in any::<bool>(),
            ) {
                let payload = CleanRuvPayload {
                    rid: ReplicaId::new(rid),
                    root,
                    maxcsn: Csn::new(t, seq, ReplicaId::new(rid), 0),
                    force,
                };
                let back = CleanRuvPayload::parse(&payload.render()).unwrap();
                prop_assert_eq!(back, payload);
            }

            #[test]
            fn prop_known_response_codes_round_trip(v in 0u8..=0x13) {
                prop_assert_eq!(ResponseCode::from_u8(v).as_u8(), v);
            }
        }
    }
}
