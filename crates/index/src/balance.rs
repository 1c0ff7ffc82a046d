use chainidx_params::{ChainFamily, ChainKey};
use chainidx_storage::KeyValueStore;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::query::TxFilter;
use crate::records::{CoinRecord, MintHeight, TxDetail, TxPosition};
use crate::store::IndexStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: i128,
    pub unconfirmed: i128,
    pub balance: i128,
}

impl Balance {
    fn add(&mut self, amount: i128, confirmed: bool) {
        if confirmed {
            self.confirmed = self.confirmed.saturating_add(amount);
        } else {
            self.unconfirmed = self.unconfirmed.saturating_add(amount);
        }
        self.balance = self.confirmed.saturating_add(self.unconfirmed);
    }

    fn merge(&mut self, other: Balance) {
        self.add(other.confirmed, true);
        self.add(other.unconfirmed, false);
    }

    fn from_coins(coins: &[CoinRecord]) -> Self {
        let mut balance = Balance::default();
        for coin in coins.iter().filter(|coin| coin.is_spendable()) {
            let confirmed = matches!(coin.mint_height, MintHeight::Confirmed(_));
            balance.add(to_signed(coin.value), confirmed);
        }
        balance
    }
}

fn to_signed(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

impl<S: KeyValueStore + ?Sized> IndexStore<S> {
    /// UTXO chains sum spendable coins; account chains replay value flows.
    pub fn balance_for_address(
        &self,
        key: &ChainKey,
        family: ChainFamily,
        address: &str,
    ) -> Result<Balance, IndexError> {
        match family {
            ChainFamily::Utxo => Ok(Balance::from_coins(
                &self.coins_for_address(key, address, true)?,
            )),
            ChainFamily::Account => self.replay_account_balance(key, address),
        }
    }

    pub fn balance_for_wallet(
        &self,
        key: &ChainKey,
        family: ChainFamily,
        wallet: &str,
    ) -> Result<Balance, IndexError> {
        match family {
            ChainFamily::Utxo => Ok(Balance::from_coins(&self.coins_for_wallet(key, wallet)?)),
            ChainFamily::Account => {
                let mut total = Balance::default();
                for link in self.wallet_addresses(key, wallet)? {
                    total.merge(self.replay_account_balance(key, &link.address)?);
                }
                Ok(total)
            }
        }
    }

    fn replay_account_balance(&self, key: &ChainKey, address: &str) -> Result<Balance, IndexError> {
        let filter = TxFilter {
            address: Some(address.to_string()),
            ..TxFilter::default()
        };
        let mut balance = Balance::default();
        for tx in self.transactions(key, &filter)? {
            if tx.position == TxPosition::Conflicting {
                continue;
            }
            let TxDetail::Account { from, to, .. } = &tx.detail else {
                continue;
            };
            let mut delta: i128 = 0;
            if to.as_deref() == Some(address) {
                delta = delta.saturating_add(to_signed(tx.value));
            }
            if from == address {
                let spent = tx.value.saturating_add(tx.fee.unwrap_or(0));
                delta = delta.saturating_sub(to_signed(spent));
            }
            balance.add(delta, tx.position.is_confirmed());
        }
        Ok(balance)
    }
}
