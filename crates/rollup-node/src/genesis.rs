//! Genesis loading and startup recovery.

use std::path::Path;
use std::sync::Arc;

use rollup_core::GenesisAccount;
use rollup_sequencer::write_genesis;
use rollup_state::AccountStateEngine;
use rollup_storage::Storage;
use serde::Deserialize;
use tracing::{info, warn};

use crate::NodeError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenesisFile {
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
}

pub fn load_genesis(path: &Path) -> Result<GenesisFile, NodeError> {
    let raw = std::fs::read(path)?;
    serde_json::from_slice(&raw)
        .map_err(|e| NodeError::Genesis(format!("{}: {e}", path.display())))
}

/// Prepare the state engine for the sequencer.
///
/// An empty store is initialized from the genesis file (or an empty account
/// set when none is given). An existing store has its chain pointer checked
/// against the badge index and its tree rebuilt from the account records.
pub fn bootstrap(
    storage: Arc<Storage>,
    genesis_path: Option<&Path>,
) -> Result<AccountStateEngine, NodeError> {
    if storage.badge_count() == 0 {
        let genesis = match genesis_path {
            Some(path) => load_genesis(path)?,
            None => {
                warn!("no genesis file configured, starting with an empty account set");
                GenesisFile::default()
            }
        };
        let mut engine = AccountStateEngine::new(Arc::clone(&storage));
        let badge = write_genesis(&mut engine, &genesis.accounts)?;
        info!(
            badge_id = %badge.badge_id,
            accounts = genesis.accounts.len(),
            "initialized new chain"
        );
        return Ok(engine);
    }

    if storage.repair_chain_pointer()? {
        info!("chain pointer repaired from badge index");
    }
    let engine = AccountStateEngine::restore(Arc::clone(&storage))?;
    match storage.head_badge()? {
        Some(head) if head.state_root != engine.current_root() => warn!(
            badge_id = %head.badge_id,
            blocknumber = head.blocknumber,
            badge_root = %head.state_root,
            restored_root = %engine.current_root(),
            "restored state root differs from head badge"
        ),
        Some(head) => info!(
            badge_id = %head.badge_id,
            blocknumber = head.blocknumber,
            "resuming chain"
        ),
        None => {
            return Err(NodeError::Genesis(
                "badges exist but no head badge could be resolved".to_string(),
            ))
        }
    }
    Ok(engine)
}
