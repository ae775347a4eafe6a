/*!
   Deterministic coin selection for UTXO transfers.
*/

use crate::types::token::Amount;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub amount: Amount,
}

/// Shape of the transaction being built, used to estimate its virtual size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxShape {
    pub segwit: bool,
    /// Payment outputs, excluding change.
    pub outputs: usize,
    /// Length of the OP_RETURN payload, if any.
    pub memo_len: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub fee: Amount,
    /// Amount returned to the sender. Zero when the remainder is dust.
    pub change: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub required: Amount,
    pub available: Amount,
}

impl TxShape {
    /// Estimated virtual size in bytes for `inputs` inputs, with or without a change output.
    pub fn vsize(&self, inputs: usize, with_change: bool) -> u64 {
        let (overhead, input, output) = if self.segwit {
            (11, 68, 31)
        } else {
            (10, 148, 34)
        };

        let outputs = self.outputs + usize::from(with_change);
        let memo = self.memo_len.map(|len| 11 + len as u64).unwrap_or(0);

        overhead + input * inputs as u64 + output * outputs as u64 + memo
    }

    pub fn fee(&self, fee_rate: Amount, inputs: usize, with_change: bool) -> Amount {
        Amount(fee_rate.0 * self.vsize(inputs, with_change) as u128)
    }
}

/**
   Select inputs paying `target` plus fee, largest first. Ties are
   broken by `(txid, vout)` so that the same UTXO set always yields the
   same transaction. A change output is added unless the remainder
   would be below `dust`, in which case the remainder goes to the fee.
*/
pub fn select_coins(
    utxos: &[Utxo],
    target: Amount,
    fee_rate: Amount,
    dust: Amount,
    shape: TxShape,
) -> Result<Selection, Shortfall> {
    let mut sorted = utxos.to_vec();
    sorted.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });

    let mut inputs = Vec::new();
    let mut total = Amount::ZERO;

    for utxo in sorted {
        total = total + utxo.amount;
        inputs.push(utxo);

        let fee_with_change = shape.fee(fee_rate, inputs.len(), true);
        if let Some(change) = total
            .checked_sub(target)
            .and_then(|rest| rest.checked_sub(fee_with_change))
        {
            if change >= dust {
                return Ok(Selection {
                    inputs,
                    fee: fee_with_change,
                    change,
                });
            }
        }

        let fee_without_change = shape.fee(fee_rate, inputs.len(), false);
        if let Some(rest) = total
            .checked_sub(target)
            .and_then(|rest| rest.checked_sub(fee_without_change))
        {
            return Ok(Selection {
                inputs,
                fee: fee_without_change + rest,
                change: Amount::ZERO,
            });
        }
    }

    let fee = shape.fee(fee_rate, inputs.len().max(1), true);

    Err(Shortfall {
        required: target + fee,
        available: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(txid: &str, vout: u32, amount: u128) -> Utxo {
        Utxo {
            txid: txid.to_string(),
            vout,
            amount: Amount(amount),
        }
    }

    const SHAPE: TxShape = TxShape {
        segwit: true,
        outputs: 1,
        memo_len: None,
    };

    #[test]
    fn picks_largest_first_with_change() {
        let utxos = vec![
            utxo("aa", 0, 10_000),
            utxo("bb", 0, 50_000),
            utxo("cc", 1, 20_000),
        ];

        let selection = select_coins(&utxos, Amount(30_000), Amount(1), Amount(546), SHAPE).unwrap();

        assert_eq!(selection.inputs, vec![utxo("bb", 0, 50_000)]);
        assert_eq!(selection.fee, Amount(11 + 68 + 62));
        assert_eq!(
            selection.change,
            Amount(50_000 - 30_000 - selection.fee.0)
        );
    }

    #[test]
    fn ties_are_broken_by_outpoint() {
        let utxos = vec![
            utxo("bb", 0, 10_000),
            utxo("aa", 1, 10_000),
            utxo("aa", 0, 10_000),
        ];

        let first = select_coins(&utxos, Amount(15_000), Amount(1), Amount(546), SHAPE).unwrap();

        let mut reversed = utxos.clone();
        reversed.reverse();
        let second = select_coins(&reversed, Amount(15_000), Amount(1), Amount(546), SHAPE).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.inputs,
            vec![utxo("aa", 0, 10_000), utxo("aa", 1, 10_000)]
        );
    }

    #[test]
    fn dust_change_goes_to_fee() {
        let utxos = vec![utxo("aa", 0, 10_300)];
        let selection = select_coins(&utxos, Amount(10_000), Amount(1), Amount(546), SHAPE).unwrap();

        assert_eq!(selection.change, Amount::ZERO);
        assert_eq!(selection.fee, Amount(300));
    }

    #[test]
    fn reports_shortfall() {
        let utxos = vec![utxo("aa", 0, 1_000)];
        let shortfall = select_coins(&utxos, Amount(5_000), Amount(1), Amount(546), SHAPE).unwrap_err();

        assert_eq!(shortfall.available, Amount(1_000));
        assert!(shortfall.required > Amount(5_000));
    }

    #[test]
    fn memo_increases_size() {
        let with_memo = TxShape {
            memo_len: Some(40),
            ..SHAPE
        };

        assert_eq!(with_memo.vsize(1, true), SHAPE.vsize(1, true) + 51);
    }
}
