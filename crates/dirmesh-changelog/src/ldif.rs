//! LDIF-shaped import and export of the changelog.
//!
//! One block per change, attribute-per-line, blocks separated by a blank
//! line. Payload bytes are hex encoded so the file stays line oriented.
//! Export walks the open log in key order; import requires a closed log,
//! replays every block through the normal write path, and leaves the log
//! open.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::info;

use dirmesh_model::csn::Csn;

use crate::error::ChangelogError;
use crate::record::{ChangeOp, ChangeRecord};
use crate::store::{ChangeLog, LogState};

const A_CHANGETYPE: &str = "changetype";
const A_CSN: &str = "csn";
const A_DN: &str = "dn";
const A_TIME: &str = "time";
const A_CHANGE: &str = "change";

impl ChangeLog {
    /// Writes every retained change to `path` as LDIF-shaped text, in CSN
    /// order. The log must be open. Returns the number of changes written.
    pub fn export_ldif(&self, path: &Path) -> Result<u64, ChangelogError> {
        if self.state() != LogState::Open {
            return Err(ChangelogError::BadState {
                op: "export",
                state: self.state().name(),
            });
        }

        let file = File::create(path).map_err(|e| ChangelogError::SystemError(e.to_string()))?;
        let mut out = BufWriter::new(file);
        let mut written: u64 = 0;
        for (_, value) in self.scan_entries()? {
            let record = ChangeRecord::decode(&value)?;
            write_block(&mut out, &record)?;
            written += 1;
        }
        out.flush()
            .map_err(|e| ChangelogError::SystemError(e.to_string()))?;
        info!(path = %path.display(), written, "changelog exported");
        Ok(written)
    }

    /// Reads LDIF-shaped text from `path` into the log. The log must be
    /// closed; it is opened first so the bookkeeping records rebuild along
    /// the way, and stays open afterward. Returns the number of changes
    /// imported.
    pub fn import_ldif(&self, path: &Path) -> Result<u64, ChangelogError> {
        match self.state() {
            LogState::None | LogState::Closed => {}
            state => {
                return Err(ChangelogError::BadState {
                    op: "import",
                    state: state.name(),
                })
            }
        }
        self.open()?;

        let file = File::open(path).map_err(|e| ChangelogError::SystemError(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut block: Vec<String> = Vec::new();
        let mut imported: u64 = 0;
        for line in reader.lines() {
            let line = line.map_err(|e| ChangelogError::SystemError(e.to_string()))?;
            if line.trim().is_empty() {
                if !block.is_empty() {
                    self.write(&parse_block(&block)?)?;
                    imported += 1;
                    block.clear();
                }
                continue;
            }
            block.push(line);
        }
        if !block.is_empty() {
            self.write(&parse_block(&block)?)?;
            imported += 1;
        }
        info!(path = %path.display(), imported, "changelog imported");
        Ok(imported)
    }
}

fn write_block(out: &mut impl Write, record: &ChangeRecord) -> Result<(), ChangelogError> {
    writeln!(out, "{}: {}", A_CHANGETYPE, record.op.name())
        .and_then(|_| writeln!(out, "{}: {}", A_CSN, record.csn))
        .and_then(|_| writeln!(out, "{}: {}", A_DN, record.target))
        .and_then(|_| writeln!(out, "{}: {}", A_TIME, record.time))
        .and_then(|_| writeln!(out, "{}: {}", A_CHANGE, hex_encode(&record.payload)))
        .and_then(|_| writeln!(out))
        .map_err(|e| ChangelogError::SystemError(e.to_string()))
}

fn parse_block(lines: &[String]) -> Result<ChangeRecord, ChangelogError> {
    let mut op = None;
    let mut csn = None;
    let mut dn = None;
    let mut time = None;
    let mut payload = Vec::new();

    for line in lines {
        let (attr, value) = line
            .split_once(": ")
            .or_else(|| line.split_once(':'))
            .ok_or_else(|| ChangelogError::BadFormat(format!("not an attribute line: {line}")))?;
        let value = value.trim();
        match attr {
            A_CHANGETYPE => op = Some(ChangeOp::parse(value)?),
            A_CSN => {
                csn = Some(value.parse::<Csn>()?);
            }
            A_DN => dn = Some(value.to_string()),
            A_TIME => {
                time = Some(value.parse::<u64>().map_err(|e| {
                    ChangelogError::BadFormat(format!("bad time {value}: {e}"))
                })?);
            }
            A_CHANGE => payload = hex_decode(value)?,
            other => {
                return Err(ChangelogError::BadFormat(format!(
                    "unknown attribute: {other}"
                )))
            }
        }
    }

    let missing = |attr| ChangelogError::BadFormat(format!("missing attribute: {attr}"));
    Ok(ChangeRecord::new(
        csn.ok_or_else(|| missing(A_CSN))?,
        op.ok_or_else(|| missing(A_CHANGETYPE))?,
        &dn.ok_or_else(|| missing(A_DN))?,
        payload,
        time.ok_or_else(|| missing(A_TIME))?,
    ))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ChangelogError> {
    if s.len() % 2 != 0 {
        return Err(ChangelogError::BadFormat("odd hex length".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| ChangelogError::BadFormat(format!("bad hex: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryLogStore;
    use crate::store::ChangelogConfig;
    use dirmesh_model::csn::ReplicaId;
    use std::sync::Arc;

    fn record(t: u64, seq: u16, rid: u16, payload: Vec<u8>) -> ChangeRecord {
        ChangeRecord::new(
            Csn::new(t, seq, ReplicaId::new(rid), 0),
            ChangeOp::Modify,
            "cn=x,dc=example,dc=com",
            payload,
            t,
        )
    }

    fn open_log() -> ChangeLog {
        let log = ChangeLog::new(Arc::new(MemoryLogStore::new()), ChangelogConfig::default());
        log.open().unwrap();
        log
    }

    mod round_trip {
        use super::*;

        #[test]
        fn test_export_import_preserves_records() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cl.ldif");

            let log = open_log();
            log.write(&record(100, 0, 1, b"hello".to_vec())).unwrap();
            log.write(&record(100, 1, 1, vec![0x00, 0xff, 0x10])).unwrap();
            log.write(&record(101, 0, 2, Vec::new())).unwrap();
            assert_eq!(log.export_ldif(&path).unwrap(), 3);

            let restored = ChangeLog::new(
                Arc::new(MemoryLogStore::new()),
                ChangelogConfig::default(),
            );
            assert_eq!(restored.import_ldif(&path).unwrap(), 3);
            assert_eq!(restored.entry_count(), 3);
            for t in [(100, 0, 1), (100, 1, 1), (101, 0, 2)] {
                let csn = Csn::new(t.0, t.1, ReplicaId::new(t.2), 0);
                assert_eq!(restored.get(&csn).unwrap(), log.get(&csn).unwrap());
            }
            assert_eq!(
                restored.max_ruv().max_csn_for(ReplicaId::new(1)),
                Some(Csn::new(100, 1, ReplicaId::new(1), 0))
            );
        }

        #[test]
        fn test_binary_payload_survives() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cl.ldif");

            let log = open_log();
            let payload: Vec<u8> = (0..=255).collect();
            log.write(&record(100, 0, 1, payload.clone())).unwrap();
            log.export_ldif(&path).unwrap();

            let restored = ChangeLog::new(
                Arc::new(MemoryLogStore::new()),
                ChangelogConfig::default(),
            );
            restored.import_ldif(&path).unwrap();
            let got = restored
                .get(&Csn::new(100, 0, ReplicaId::new(1), 0))
                .unwrap()
                .unwrap();
            assert_eq!(got.payload, payload);
        }

        #[test]
        fn test_import_leaves_log_open() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cl.ldif");
            let log = open_log();
            log.write(&record(100, 0, 1, Vec::new())).unwrap();
            log.export_ldif(&path).unwrap();

            let restored = ChangeLog::new(
                Arc::new(MemoryLogStore::new()),
                ChangelogConfig::default(),
            );
            restored.import_ldif(&path).unwrap();
            assert_eq!(restored.state(), LogState::Open);
        }
    }

    mod state_checks {
        use super::*;

        #[test]
        fn test_export_requires_open() {
            let dir = tempfile::tempdir().unwrap();
            let log = ChangeLog::new(
                Arc::new(MemoryLogStore::new()),
                ChangelogConfig::default(),
            );
            let err = log.export_ldif(&dir.path().join("cl.ldif")).unwrap_err();
            assert_eq!(err.code(), 3);
        }

        #[test]
        fn test_import_rejected_while_open() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cl.ldif");
            std::fs::write(&path, "").unwrap();

            let log = open_log();
            let err = log.import_ldif(&path).unwrap_err();
            assert!(matches!(
                err,
                ChangelogError::BadState {
                    op: "import",
                    state: "open"
                }
            ));
        }

        #[test]
        fn test_import_into_closed_log() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cl.ldif");
            let log = open_log();
            log.write(&record(100, 0, 1, Vec::new())).unwrap();
            log.export_ldif(&path).unwrap();
            log.close().unwrap();

            assert_eq!(log.import_ldif(&path).unwrap(), 1);
            assert_eq!(log.state(), LogState::Open);
            // the record was already present; the count must not double
            assert_eq!(log.entry_count(), 1);
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_missing_attribute_is_bad_format() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cl.ldif");
            std::fs::write(&path, "changetype: modify\ncsn: 00000064000000010000\n").unwrap();

            let log = ChangeLog::new(
                Arc::new(MemoryLogStore::new()),
                ChangelogConfig::default(),
            );
            let err = log.import_ldif(&path).unwrap_err();
            assert_eq!(err.code(), 2);
        }

        #[test]
        fn test_unknown_attribute_is_bad_format() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cl.ldif");
            std::fs::write(&path, "bogus: 1\n").unwrap();

            let log = ChangeLog::new(
                Arc::new(MemoryLogStore::new()),
                ChangelogConfig::default(),
            );
            assert!(log.import_ldif(&path).is_err());
        }

        #[test]
        fn test_bad_hex_is_bad_format() {
            assert!(hex_decode("zz").is_err());
            assert!(hex_decode("abc").is_err());
            assert_eq!(hex_decode("00ff").unwrap(), vec![0x00, 0xff]);
        }
    }
}
