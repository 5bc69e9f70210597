use std::env;
use std::error::Error;

use log::{error, info, warn};
use serde_json::Value;
use tokio::fs;

use sigchain::chain::{
    compute_high_skips, import_link_value, is_dense, verify_chain, ChainOwner, KeyFamilyState,
    Uid,
};

fn usage() -> String {
    "usage: sigchain-verify <sig-get-response.json> <uid-hex> <username>".to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        return Err(usage().into());
    }
    let owner = ChainOwner::new(Uid::from_hex(&args[2])?, args[3].as_str());

    let body: Value = serde_json::from_str(&fs::read_to_string(&args[1]).await?)?;
    let sigs = body
        .get("sigs")
        .and_then(Value::as_array)
        .ok_or("response has no sigs array")?;
    info!("Importing {} links for {}", sigs.len(), owner.username);

    let mut links = Vec::with_capacity(sigs.len());
    for (i, record) in sigs.iter().enumerate() {
        match import_link_value(record, None) {
            Ok(link) => links.push(link),
            Err(e) => {
                error!("Link #{} failed to import: {}", i, e);
                return Err(e.into());
            }
        }
    }

    if let Err(e) = verify_chain(&mut links, &owner) {
        error!("Chain verification failed: {}", e);
        return Err(e.into());
    }

    // High skips can only be recomputed over a chain with no gaps.
    if is_dense(&links) {
        compute_high_skips(&mut links)?;
    } else {
        warn!("Sparse chain; skipping high skip recomputation");
    }

    let state = KeyFamilyState::from_links(&owner, &links)?;
    info!(
        "Verified {} links, tip {}, {} sibkeys, {} subkeys, {} revoked",
        links.len(),
        state.tip_seqno(),
        state.sibkeys.len(),
        state.subkeys.len(),
        state.revoked_kids.len()
    );
    if let Some(tail) = state.tail {
        info!("Chain tail {} at seqno {}", tail.link_id.short(), tail.seqno);
    }
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
