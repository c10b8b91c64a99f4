//! Signer Resolver
//!
//! The authorizing address of a transaction is derived from the public key
//! pushed after the signature in each unlocking script. Every input must
//! agree on it.

use crate::{
    error::{LedgerResult, StructuralError},
    rows::RowId,
    store::UnitOfWork,
};
use orbit_protocol::{
    p2pkh_address,
    script::{decode_hex, pushes},
    Network,
};
use std::collections::BTreeSet;

const COMPRESSED_PUBKEY_LEN: usize = 33;
const UNCOMPRESSED_PUBKEY_LEN: usize = 65;

/// Public key of a `<signature> <pubkey>` unlocking script
pub fn pubkey_from_unlock_script(script_hex: &str) -> Option<Vec<u8>> {
    let script = decode_hex(script_hex).ok()?;
    let pushes = pushes(&script).ok()?;
    match pushes.as_slice() {
        [signature, pubkey]
            if !signature.is_empty()
                && matches!(pubkey.len(), COMPRESSED_PUBKEY_LEN | UNCOMPRESSED_PUBKEY_LEN) =>
        {
            Some(pubkey.to_vec())
        }
        _ => None,
    }
}

/// The single address signing all given unlocking scripts
///
/// Scripts that carry no recognizable public key are skipped. Distinct
/// addresses across inputs abort the block.
pub fn resolve_signer<'s>(
    scripts: impl IntoIterator<Item = &'s str>,
    network: Network,
) -> LedgerResult<Option<String>> {
    let addresses: BTreeSet<String> = scripts
        .into_iter()
        .filter_map(pubkey_from_unlock_script)
        .map(|pubkey| p2pkh_address(&pubkey, network))
        .collect();

    if addresses.len() > 1 {
        return Err(StructuralError::AmbiguousSigner(addresses.into_iter().collect()).into());
    }
    Ok(addresses.into_iter().next())
}

impl<'a> UnitOfWork<'a> {
    /// Signer of a stored transaction
    pub fn signer_of(&self, tx: RowId, network: Network) -> LedgerResult<Option<String>> {
        let scripts: Vec<&str> = self
            .txins
            .find(&tx)
            .filter_map(|input| input.script.as_deref())
            .collect();
        resolve_signer(scripts, network)
    }
}
