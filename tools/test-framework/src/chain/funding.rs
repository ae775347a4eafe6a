use tokio::time::Instant;
use tracing::{debug, info};

use super::traits::{Chain, FAUCET_KEY, POLL_INTERVAL};
use crate::error::Error;
use crate::types::context::Context;
use crate::types::token::{Amount, WalletAmount};
use crate::types::wallet::Wallet;
use crate::util::random::random_string;

/**
   Create a fresh key named `{prefix}-{chain_id}-{random}` on `chain`
   and fund it with `amount` of the native denom from the faucet.

   The balance is polled until the transfer lands, and must then equal
   `amount` exactly. Otherwise a `FundingMismatch` is returned. The
   created key stays in the keyring either way.
*/
pub async fn get_and_fund_user(
    ctx: &Context,
    chain: &dyn Chain,
    prefix: &str,
    amount: Amount,
) -> Result<Wallet, Error> {
    let key_name = format!("{}-{}-{}", prefix, chain.chain_id(), random_string(6));

    let wallet = chain.create_key(ctx, &key_name).await?;

    debug!(
        "funding user {} on chain {} with {} {}",
        key_name,
        chain.chain_id(),
        amount,
        chain.denom()
    );

    let transfer = WalletAmount::new(wallet.address(), chain.denom(), amount);
    chain.send_funds(ctx, FAUCET_KEY, &transfer).await?;

    let deadline = Instant::now() + chain.config().tx_timeout();

    let balance = loop {
        let balance = chain
            .get_balance(ctx, wallet.address(), chain.denom())
            .await?;

        if balance == amount || !balance.is_zero() || Instant::now() >= deadline {
            break balance;
        }

        ctx.sleep(POLL_INTERVAL).await?;
    };

    if balance != amount {
        return Err(Error::funding_mismatch(
            chain.chain_id().to_string(),
            key_name,
            amount,
            balance,
        ));
    }

    info!(
        "funded user {} on chain {} with {} {}",
        wallet.address(),
        chain.chain_id(),
        amount,
        chain.denom()
    );

    Ok(wallet)
}
