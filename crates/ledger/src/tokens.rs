//! Token creation, transfers and balance accounting

use crate::{
    error::{checked_add, LedgerResult, RuleViolation, StructuralError},
    rows::{BalanceRow, BlockRef, RowId, TokenRow, TransferRow},
    store::UnitOfWork,
};

/// Fixed attributes of a new token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenTerms {
    pub supply: u64,
    pub decimals: u32,
    pub symbol: String,
    pub name: Option<String>,
    pub main_uri: Option<String>,
    pub image_uri: Option<String>,
}

impl<'a> UnitOfWork<'a> {
    /// Create a token at `address`, crediting the whole supply to it
    pub fn create_token(
        &mut self,
        address: &str,
        tx: RowId,
        block: BlockRef,
        terms: TokenTerms,
    ) -> LedgerResult<RowId> {
        if self.token(address).is_some() {
            return Err(RuleViolation::DuplicateToken(address.to_string()).into());
        }

        let supply = terms.supply;
        let token = self.tokens.insert(|id| TokenRow {
            id,
            address: address.to_string(),
            tx,
            created: block.id,
            updated: None,
            supply,
            decimals: terms.decimals,
            symbol: terms.symbol,
            name: terms.name,
            main_uri: terms.main_uri,
            image_uri: terms.image_uri,
        });

        self.credit(token, address, block, supply, supply)?;

        tracing::info!("Created token {} with supply {}", address, supply);
        Ok(token)
    }

    /// Move available units between two holders
    pub fn transfer(
        &mut self,
        token_address: &str,
        tx: RowId,
        block: BlockRef,
        from: &str,
        to: &str,
        units: u64,
    ) -> LedgerResult<RowId> {
        let token = self.require_token(token_address)?.id;

        if from == to {
            return Err(RuleViolation::SameAddress.into());
        }

        let sender = self
            .balance(token, from)
            .ok_or_else(|| RuleViolation::NoBalance {
                address: from.to_string(),
            })?;
        if sender.available < units {
            return Err(RuleViolation::InsufficientAvailable {
                requested: units,
                available: sender.available,
            }
            .into());
        }
        let sender = sender.id;

        self.debit(sender, block, units, units)?;
        self.credit(token, to, block, units, units)?;
        let transfer = self.record_transfer(token, tx, block, from, to, units);

        tracing::debug!("Transferred {} units of {} from {} to {}", units, token_address, from, to);
        Ok(transfer)
    }

    pub(crate) fn require_token(&self, address: &str) -> LedgerResult<&TokenRow> {
        self.token(address)
            .ok_or_else(|| RuleViolation::NoToken(address.to_string()).into())
    }

    /// Add to a holder's balance, creating the row on first credit
    pub(crate) fn credit(
        &mut self,
        token: RowId,
        address: &str,
        block: BlockRef,
        units: u64,
        available: u64,
    ) -> LedgerResult<RowId> {
        let Some(existing) = self.balance(token, address) else {
            if available > units {
                return Err(StructuralError::BalanceUnderflow { id: 0 }.into());
            }
            return Ok(self.balances.insert(|id| BalanceRow {
                id,
                token,
                address: address.to_string(),
                updated: block.id,
                units,
                available,
            }));
        };

        let id = existing.id;
        let new_units = checked_add(existing.units, units)?;
        let new_available = checked_add(existing.available, available)?;
        self.set_balance(id, block, new_units, new_available)?;
        Ok(id)
    }

    /// Subtract from a balance; both amounts must be covered
    pub(crate) fn debit(
        &mut self,
        id: RowId,
        block: BlockRef,
        units: u64,
        available: u64,
    ) -> LedgerResult<()> {
        let balance = self.balances.require(id)?;
        match (
            balance.units.checked_sub(units),
            balance.available.checked_sub(available),
        ) {
            (Some(units), Some(available)) => self.set_balance(id, block, units, available),
            _ => Err(StructuralError::BalanceUnderflow { id }.into()),
        }
    }

    /// Make already held units available
    pub(crate) fn release(&mut self, id: RowId, block: BlockRef, units: u64) -> LedgerResult<()> {
        let balance = self.balances.require(id)?;
        let available = checked_add(balance.available, units)?;
        let total = balance.units;
        self.set_balance(id, block, total, available)
    }

    fn set_balance(
        &mut self,
        id: RowId,
        block: BlockRef,
        units: u64,
        available: u64,
    ) -> LedgerResult<()> {
        if available > units {
            return Err(StructuralError::BalanceUnderflow { id }.into());
        }
        self.balances.update(id, |b| {
            b.units = units;
            b.available = available;
            b.updated = block.id;
        })
    }

    pub(crate) fn record_transfer(
        &mut self,
        token: RowId,
        tx: RowId,
        block: BlockRef,
        from: &str,
        to: &str,
        units: u64,
    ) -> RowId {
        self.transfers.insert(|id| TransferRow {
            id,
            token,
            tx,
            block: block.id,
            from: from.to_string(),
            to: to.to_string(),
            units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LedgerState;

    fn terms(supply: u64) -> TokenTerms {
        TokenTerms {
            supply,
            decimals: 2,
            symbol: "TOK".to_string(),
            name: Some("Token".to_string()),
            main_uri: None,
            image_uri: None,
        }
    }

    #[test]
    fn test_create_credits_issuer() {
        let state = LedgerState::default();
        let mut uow = state.begin();
        let block = uow.save_block("b1", 1);

        uow.create_token("issuer", 0, block, terms(1000)).unwrap();

        let balance = uow.balance_of("issuer", "issuer").unwrap();
        assert_eq!(balance.units, 1000);
        assert_eq!(balance.available, 1000);
    }

    #[test]
    fn test_transfer_moves_units() {
        let state = LedgerState::default();
        let mut uow = state.begin();
        let block = uow.save_block("b1", 1);
        uow.create_token("issuer", 0, block, terms(1000)).unwrap();
        uow.credit(1, "alice", block, 100, 100).unwrap();
        uow.debit(1, block, 100, 100).unwrap();

        uow.transfer("issuer", 0, block, "alice", "bob", 40).unwrap();

        assert_eq!(uow.balance_of("issuer", "alice").unwrap().units, 60);
        assert_eq!(uow.balance_of("issuer", "bob").unwrap().available, 40);
        assert_eq!(uow.transfers_of_token(1).count(), 1);
    }

    #[test]
    fn test_transfer_rejections() {
        let state = LedgerState::default();
        let mut uow = state.begin();
        let block = uow.save_block("b1", 1);
        uow.create_token("issuer", 0, block, terms(10)).unwrap();

        let err = uow.transfer("nope", 0, block, "a", "b", 1).unwrap_err();
        assert_eq!(err.violation(), Some(&RuleViolation::NoToken("nope".to_string())));

        let err = uow.transfer("issuer", 0, block, "a", "a", 1).unwrap_err();
        assert_eq!(err.violation(), Some(&RuleViolation::SameAddress));

        let err = uow.transfer("issuer", 0, block, "a", "b", 1).unwrap_err();
        assert!(matches!(err.violation(), Some(RuleViolation::NoBalance { .. })));

        let err = uow.transfer("issuer", 0, block, "issuer", "b", 11).unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&RuleViolation::InsufficientAvailable {
                requested: 11,
                available: 10
            })
        );
        assert!(uow.balance_of("issuer", "b").is_none());
    }

    #[test]
    fn test_debit_underflow_is_fatal() {
        let state = LedgerState::default();
        let mut uow = state.begin();
        let block = uow.save_block("b1", 1);
        uow.create_token("issuer", 0, block, terms(10)).unwrap();

        // Units may not drop below available
        let err = uow.debit(1, block, 5, 0).unwrap_err();
        assert!(err.is_fatal());
    }
}
