//! Advertisements and Registrations
//!
//! An advertisement reserves part of the issuer's available units for a
//! block window. Registrations claim against it, either immediately (free
//! distributions) or as payments to the issuer arrive at the advertised
//! exchange rate. Claimed units stay unavailable until the delivery height.

use crate::{
    error::{checked_add, LedgerResult, RuleViolation, StructuralError},
    rows::{AdvertisementRow, BlockRef, RegistrationRow, RowId, TokenRow},
    store::UnitOfWork,
};
use std::collections::BTreeMap;

/// Optional parameters of an advertisement, defaults resolved on apply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdvertisementTerms {
    pub rate: Option<i64>,
    pub units_avail: Option<u64>,
    pub units_min: Option<u64>,
    pub units_max: Option<u64>,
    pub block_begin: Option<u64>,
    pub block_end: Option<u64>,
    pub block_deliver: Option<u64>,
    pub preregister: bool,
}

/// What settling one block did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Units made available to registrants
    pub delivered: u64,
    /// Advertisements finished in this block
    pub finished: Vec<RowId>,
    /// Unclaimed units returned to issuers
    pub released: u64,
}

/// Units earned by a payment total at an exchange rate
fn entitlement(payments: u64, rate: Option<i64>) -> LedgerResult<u64> {
    match rate {
        Some(rate) if rate > 0 => payments
            .checked_mul(rate.unsigned_abs())
            .ok_or_else(|| RuleViolation::Overflow.into()),
        Some(rate) if rate < 0 => Ok(payments / rate.unsigned_abs()),
        _ => Ok(0),
    }
}

fn windows_overlap(a_begin: u64, a_end: Option<u64>, b_begin: u64, b_end: Option<u64>) -> bool {
    a_end.map_or(true, |end| b_begin <= end) && b_end.map_or(true, |end| a_begin <= end)
}

impl<'a> UnitOfWork<'a> {
    /// Reserve issuer units for a time-boxed distribution
    pub fn advertise(
        &mut self,
        token_address: &str,
        tx: RowId,
        block: BlockRef,
        terms: AdvertisementTerms,
    ) -> LedgerResult<RowId> {
        let token = self.require_token(token_address)?.clone();
        let height = block.height;

        let begins = terms.block_begin.unwrap_or(height + 1);
        if begins <= height {
            return Err(RuleViolation::InvalidBlockRange(format!(
                "begin {} is not after block {}",
                begins, height
            ))
            .into());
        }
        if let Some(end) = terms.block_end {
            if end < begins {
                return Err(RuleViolation::InvalidBlockRange(format!(
                    "end {} is before begin {}",
                    end, begins
                ))
                .into());
            }
        }
        let delivers = terms.block_deliver.unwrap_or(begins);
        if delivers < begins {
            return Err(RuleViolation::InvalidBlockRange(format!(
                "delivery {} is before begin {}",
                delivers, begins
            ))
            .into());
        }

        for ad in self.advertisements_of_token(token.id) {
            if ad.finished.is_some() {
                continue;
            }
            if windows_overlap(ad.begins, ad.ends, begins, terms.block_end) {
                return Err(RuleViolation::OverlappingAdvertisement(ad.id).into());
            }
            if terms.preregister && ad.is_preregistering_at(height) {
                return Err(RuleViolation::ConflictingPreregistration(ad.id).into());
            }
        }

        let issuer = self
            .balance(token.id, &token.address)
            .ok_or_else(|| RuleViolation::NoBalance {
                address: token.address.clone(),
            })?;
        let avail = terms.units_avail.unwrap_or(issuer.available);
        if avail > issuer.available {
            return Err(RuleViolation::InsufficientAvailable {
                requested: avail,
                available: issuer.available,
            }
            .into());
        }
        let issuer = issuer.id;

        let minimum = terms.units_min.unwrap_or(1);
        let maximum = terms.units_max.unwrap_or(avail);
        if minimum > maximum {
            return Err(RuleViolation::InvalidLimits { minimum, maximum }.into());
        }

        self.debit(issuer, block, 0, avail)?;

        let ad = self.advertisements.insert(|id| AdvertisementRow {
            id,
            token: token.id,
            tx,
            created: block.id,
            updated: block.id,
            finished: None,
            begins,
            ends: terms.block_end,
            delivers,
            available: avail,
            claimed: 0,
            rate: terms.rate,
            minimum,
            maximum,
            preregister: terms.preregister,
        });

        tracing::info!(
            "Advertisement {} on {}: {} units, blocks {}..{:?}, delivery {}",
            ad,
            token_address,
            avail,
            begins,
            terms.block_end,
            delivers
        );
        Ok(ad)
    }

    pub fn cancel_advertisement(&mut self, token_address: &str) -> LedgerResult<()> {
        tracing::error!("Cancel requested for {}", token_address);
        Err(StructuralError::Unimplemented("advertisement cancellation").into())
    }

    /// The open advertisement on a token, else its pending preregistration one
    pub fn find_eligible_advertisement(
        &self,
        token: RowId,
        height: u64,
    ) -> LedgerResult<AdvertisementRow> {
        let mut open = Vec::new();
        let mut future = Vec::new();
        for ad in self.advertisements_of_token(token) {
            if ad.is_open_at(height) {
                open.push(ad);
            } else if ad.is_preregistering_at(height) {
                future.push(ad);
            }
        }

        if open.len() + future.len() > 1 {
            return Err(StructuralError::MultipleActiveAdvertisements {
                token,
                open: open.len(),
                future: future.len(),
            }
            .into());
        }

        open.into_iter()
            .chain(future)
            .next()
            .cloned()
            .ok_or_else(|| RuleViolation::NoEligibleAdvertisement.into())
    }

    fn user_registrations(
        &self,
        advertisement: RowId,
        address: &str,
    ) -> impl Iterator<Item = &RegistrationRow> + '_ {
        let address = address.to_string();
        self.registrations_of(advertisement)
            .filter(move |r| r.address == address)
    }

    /// The single unfinished registration of `address` on an advertisement
    pub fn active_registration(&self, advertisement: RowId, address: &str) -> LedgerResult<Option<RowId>> {
        let active: Vec<RowId> = self
            .user_registrations(advertisement, address)
            .filter(|r| r.finished.is_none())
            .map(|r| r.id)
            .collect();

        match active.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(*id)),
            _ => Err(StructuralError::MultipleActiveRegistrations {
                advertisement,
                address: address.to_string(),
                count: active.len(),
            }
            .into()),
        }
    }

    /// Register `user` against the token's eligible advertisement
    pub fn register(
        &mut self,
        token_address: &str,
        tx: RowId,
        block: BlockRef,
        user: &str,
        units_max: u64,
    ) -> LedgerResult<RowId> {
        let token = self.require_token(token_address)?.clone();
        let ad = self.find_eligible_advertisement(token.id, block.height)?;

        if units_max < ad.minimum {
            return Err(RuleViolation::BelowAdvertisementMinimum {
                requested: units_max,
                minimum: ad.minimum,
            }
            .into());
        }
        let registered = self
            .user_registrations(ad.id, user)
            .fold(0u64, |sum, r| sum.saturating_add(r.maximum));
        let max_remains = ad
            .maximum
            .saturating_sub(registered)
            .min(ad.unclaimed())
            .min(units_max);

        let (claimed, finished) = if ad.rate.is_none() {
            if max_remains > 0 {
                self.grant(&ad, &token, tx, block, user, max_remains)?;
            }
            (max_remains, Some(block.id))
        } else {
            (0, None)
        };

        let registration = self.registrations.insert(|id| RegistrationRow {
            id,
            advertisement: ad.id,
            tx,
            address: user.to_string(),
            created: block.id,
            updated: block.id,
            finished,
            maximum: units_max,
            payments: 0,
            claimed,
        });

        // A second unfinished registration for the same user is an integrity
        // failure that aborts the block, not a voidable directive
        self.active_registration(ad.id, user)?;

        tracing::info!(
            "Registration {} of {} on advertisement {} (max {}, granted {})",
            registration,
            user,
            ad.id,
            units_max,
            claimed
        );
        Ok(registration)
    }

    /// Withdraw the user's active registration; nothing is refunded
    pub fn unregister(
        &mut self,
        token_address: &str,
        block: BlockRef,
        user: &str,
    ) -> LedgerResult<RowId> {
        let token = self.require_token(token_address)?.id;
        let ad = self.find_eligible_advertisement(token, block.height)?;
        let registration = self
            .active_registration(ad.id, user)?
            .ok_or(RuleViolation::NoActiveRegistration)?;

        self.registrations.update(registration, |r| {
            r.finished = Some(block.id);
            r.updated = block.id;
        })?;
        Ok(registration)
    }

    /// Move issuer units to a registrant out of the advertisement's pool
    fn grant(
        &mut self,
        ad: &AdvertisementRow,
        token: &TokenRow,
        tx: RowId,
        block: BlockRef,
        to: &str,
        units: u64,
    ) -> LedgerResult<()> {
        let issuer = self
            .balance(token.id, &token.address)
            .ok_or_else(|| RuleViolation::NoBalance {
                address: token.address.clone(),
            })?
            .id;
        let deliver_now = block.height > ad.delivers;

        self.debit(issuer, block, units, 0)?;
        self.credit(token.id, to, block, units, if deliver_now { units } else { 0 })?;
        self.record_transfer(token.id, tx, block, &token.address, to, units);

        let claimed = checked_add(self.advertisements.require(ad.id)?.claimed, units)?;
        self.advertisements.update(ad.id, |a| {
            a.claimed = claimed;
            a.updated = block.id;
        })
    }

    /// Open advertisement of the token at `address` with unfinished registrations
    ///
    /// Only payments to such an advertisement's issuer can settle anything,
    /// so nothing about the paying transaction is looked at here.
    pub fn collecting_advertisement(&self, address: &str, height: u64) -> LedgerResult<Option<RowId>> {
        let Some(token) = self.token(address) else {
            return Ok(None);
        };
        let collecting: Vec<RowId> = self
            .advertisements_of_token(token.id)
            .filter(|ad| ad.is_open_at(height))
            .filter(|ad| self.registrations_of(ad.id).any(|r| r.finished.is_none()))
            .map(|ad| ad.id)
            .collect();

        match collecting.as_slice() {
            [] => Ok(None),
            [ad] => Ok(Some(*ad)),
            _ => Err(StructuralError::MultipleActiveAdvertisements {
                token: token.id,
                open: collecting.len(),
                future: 0,
            }
            .into()),
        }
    }

    /// Registration a payment from `payer` to the token address settles, if any
    pub fn payment_registration(
        &self,
        token_address: &str,
        payer: &str,
        height: u64,
    ) -> LedgerResult<Option<RowId>> {
        match self.collecting_advertisement(token_address, height)? {
            Some(ad) => self.active_registration(ad, payer),
            None => Ok(None),
        }
    }

    /// Credit a registration for a payment of `value` satoshis to the issuer
    pub fn settle_payment(
        &mut self,
        tx: RowId,
        block: BlockRef,
        registration: RowId,
        value: u64,
    ) -> LedgerResult<u64> {
        let reg = self.registrations.require(registration)?.clone();
        let ad = self.advertisements.require(reg.advertisement)?.clone();
        let token = self.tokens.require(ad.token)?.clone();

        let payments = checked_add(reg.payments, value)?;
        let entitled = entitlement(payments, ad.rate)?;
        let cap = reg.maximum.min(ad.maximum);

        let increment = if entitled < ad.minimum {
            0
        } else {
            let claimed_by_user = self
                .user_registrations(ad.id, &reg.address)
                .fold(0u64, |sum, r| sum.saturating_add(r.claimed));
            entitled
                .saturating_sub(reg.claimed)
                .min(ad.unclaimed())
                .min(cap.saturating_sub(claimed_by_user))
        };

        if increment > 0 {
            self.grant(&ad, &token, tx, block, &reg.address, increment)?;
        }

        let claimed = checked_add(reg.claimed, increment)?;
        let finished = reg
            .finished
            .or_else(|| (entitled >= cap).then_some(block.id));
        self.registrations.update(registration, |r| {
            r.payments = payments;
            r.claimed = claimed;
            r.finished = finished;
            r.updated = block.id;
        })?;

        tracing::debug!(
            "Payment of {} to registration {}: entitled {}, credited {}",
            value,
            registration,
            entitled,
            increment
        );
        Ok(increment)
    }

    /// Deliver and expire advertisements at the end of a block
    pub fn settle_block(&mut self, block: BlockRef) -> LedgerResult<Settlement> {
        let height = block.height;
        let mut settlement = Settlement::default();
        let ads: Vec<AdvertisementRow> = self.advertisements.iter().cloned().collect();

        for ad in ads.iter().filter(|ad| ad.delivers == height) {
            let mut owed: BTreeMap<String, u64> = BTreeMap::new();
            for reg in self.registrations_of(ad.id) {
                let entry = owed.entry(reg.address.clone()).or_default();
                *entry = checked_add(*entry, reg.claimed)?;
            }

            for (address, units) in owed {
                if units == 0 {
                    continue;
                }
                let balance = self
                    .balance(ad.token, &address)
                    .ok_or(StructuralError::MissingRow {
                        table: "balance",
                        id: ad.token,
                    })?
                    .id;
                self.release(balance, block, units)?;
                settlement.delivered = checked_add(settlement.delivered, units)?;
            }
        }

        for ad in &ads {
            let ad = self.advertisements.require(ad.id)?.clone();
            let expired = ad.ends == Some(height);
            if ad.finished.is_some() || !(ad.claimed >= ad.available || expired) {
                continue;
            }

            let open: Vec<RowId> = self
                .registrations_of(ad.id)
                .filter(|r| r.finished.is_none())
                .map(|r| r.id)
                .collect();
            for id in open {
                self.registrations.update(id, |r| {
                    r.finished = Some(block.id);
                    r.updated = block.id;
                })?;
            }

            self.advertisements.update(ad.id, |a| {
                a.finished = Some(block.id);
                a.updated = block.id;
            })?;

            let unclaimed = ad.unclaimed();
            if unclaimed > 0 {
                let token = self.tokens.require(ad.token)?;
                let issuer = self
                    .balance(ad.token, &token.address)
                    .ok_or_else(|| RuleViolation::NoBalance {
                        address: token.address.clone(),
                    })?
                    .id;
                self.release(issuer, block, unclaimed)?;
                settlement.released = checked_add(settlement.released, unclaimed)?;
            }

            tracing::info!(
                "Advertisement {} finished at {}: claimed {}, released {}",
                ad.id,
                height,
                ad.claimed,
                unclaimed
            );
            settlement.finished.push(ad.id);
        }

        Ok(settlement)
    }
}
