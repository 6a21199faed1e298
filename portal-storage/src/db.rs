use crate::{BatchOp, StateStore};
use anyhow::{anyhow, Result};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use tracing::info;

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| anyhow!("Failed to open DB: {}", e))?;
        info!("Opened portal store at {}", path.display());
        Ok(Self { db })
    }
}

impl StateStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(|e| anyhow!("DB read error: {}", e))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(|e| anyhow!("DB iteration error: {}", e))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in ops {
            match value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
        self.db.write(batch).map_err(|e| anyhow!("DB write error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot_diff;
    use portal_types::custodian::CustodianRecord;
    use portal_types::state::PortalState;

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = PortalState::default();
        state.custodians.insert("cust-a".into(), CustodianRecord::new("cust-a"));
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.commit_diff(4, &snapshot_diff(&state)).unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.tip().unwrap(), Some(4));
        assert_eq!(store.load_state(4).unwrap(), state);
        assert_eq!(store.load_state(3).unwrap(), PortalState::default());
    }
}
