/*!
   Helpers for test scenarios running against a built interchain.
*/

use core::time::Duration;
use futures::future::{join_all, try_join_all};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chain::{get_and_fund_user, Chain, POLL_INTERVAL};
use crate::docker::mock::MockRuntime;
use crate::docker::DockerBroker;
use crate::error::{collect_results, Error, ErrorKind};
use crate::framework::supervisor::Supervisor;
use crate::types::context::Context;
use crate::types::token::{Amount, WalletAmount};
use crate::types::wallet::Wallet;
use crate::util::file::LogSink;

/**
   Create and fund one user per chain, concurrently. Wallets are
   returned in the order of `chains`. Every chain is funded to the end
   even when another one fails, so the keys created along the way stay
   in their keyrings. All failures are reported together.
*/
pub async fn get_and_fund_test_users(
    ctx: &Context,
    prefix: &str,
    amount: Amount,
    chains: &[Arc<dyn Chain>],
) -> Result<Vec<Wallet>, Error> {
    let results = join_all(
        chains
            .iter()
            .map(|chain| get_and_fund_user(ctx, chain.as_ref(), prefix, amount)),
    )
    .await;

    collect_results(results)
}

/// Wait until every chain advanced by `blocks`.
pub async fn wait_for_blocks(
    ctx: &Context,
    blocks: u64,
    chains: &[Arc<dyn Chain>],
) -> Result<(), Error> {
    try_join_all(chains.iter().map(|chain| chain.wait_for_blocks(ctx, blocks))).await?;
    Ok(())
}

/**
   Poll the balance of `baseline.address` once per second until it
   differs from `baseline.amount`, and return the new balance.
*/
pub async fn poll_for_balance_change(
    ctx: &Context,
    chain: &dyn Chain,
    max_seconds: u64,
    baseline: &WalletAmount,
) -> Result<Amount, Error> {
    let description = format!(
        "balance of {} on {} changing from {} {}",
        baseline.address,
        chain.chain_id(),
        baseline.amount,
        baseline.denom
    );

    poll_for(ctx, &description, max_seconds, move || async move {
        let balance = chain
            .get_balance(ctx, &baseline.address, &baseline.denom)
            .await?;

        Ok((balance != baseline.amount).then_some(balance))
    })
    .await
}

/**
   Call `check` once per second until it returns a value, for at most
   `max_seconds`. Errors from `check` abort the poll. A single check
   may not outlive the deadline of the whole poll.
*/
pub async fn poll_for<T, F, Fut>(
    ctx: &Context,
    description: &str,
    max_seconds: u64,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: core::future::Future<Output = Result<Option<T>, Error>>,
{
    let deadline = Instant::now() + Duration::from_secs(max_seconds);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());

        let checked = ctx
            .with_timeout(remaining)
            .run(description, check())
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::Timeout if ctx.check(description).is_ok() => {
                    Error::poll_timeout(description.to_string(), max_seconds)
                }
                _ => e,
            })?;

        if let Some(value) = checked {
            debug!("{} after polling", description);
            return Ok(value);
        }

        if Instant::now() >= deadline {
            return Err(Error::poll_timeout(description.to_string(), max_seconds));
        }

        ctx.sleep(POLL_INTERVAL).await?;
    }
}

/**
   Open `dir/name` as an append-only log shared by the tasks of a run.
   The file is closed when the supervisor closes.
*/
pub fn create_log_file(
    supervisor: &Supervisor,
    dir: impl AsRef<Path>,
    name: &str,
) -> Result<LogSink, Error> {
    let sink = LogSink::open(dir.as_ref().join(name))?;

    let closing = sink.clone();
    supervisor.register(
        format!("close log file {}", sink.path().display()),
        move || async move { closing.close() },
    );

    info!("logging to {}", sink.path().display());

    Ok(sink)
}

/// A broker over a fresh [`MockRuntime`], with its own supervisor.
pub fn mock_broker(test_name: &str) -> (MockRuntime, DockerBroker) {
    let runtime = MockRuntime::new();
    let broker = DockerBroker::new(
        Arc::new(runtime.clone()),
        Supervisor::new(test_name),
        test_name,
    );

    (runtime, broker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;
    use crate::chain::mock::MockChain;
    use crate::chain::FAUCET_KEY;

    async fn started_chains(broker: &DockerBroker, names: &[&str]) -> Vec<Arc<MockChain>> {
        let ctx = Context::background();
        let network = broker.setup_network(&ctx).await.unwrap();
        let mut chains = Vec::new();

        for name in names {
            let mut config = builtin_config("mock").unwrap();
            config.name = name.to_string();
            config.chain_id = format!("{name}-1");

            let chain = Arc::new(MockChain::new(config));
            chain.initialize(&ctx, broker, &network).await.unwrap();
            chain.init_genesis(&ctx, &[]).await.unwrap();
            chain.start(&ctx).await.unwrap();
            chains.push(chain);
        }

        chains
    }

    fn as_dyn(chains: &[Arc<MockChain>]) -> Vec<Arc<dyn Chain>> {
        chains
            .iter()
            .map(|c| c.clone() as Arc<dyn Chain>)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn funding_conserves_the_faucet() {
        let (_runtime, broker) = mock_broker("fund");
        let ctx = Context::background();
        let chains = started_chains(&broker, &["a", "b"]).await;

        let faucet_before = chains[0].config().faucet_amount;

        let users = get_and_fund_test_users(&ctx, "user", Amount(5_000), &as_dyn(&chains))
            .await
            .unwrap();

        assert_eq!(users.len(), 2);
        assert_eq!(users[0].chain_id, "a-1");
        assert_eq!(users[1].chain_id, "b-1");

        let faucet = chains[0].keyring().get(FAUCET_KEY).unwrap();
        let faucet_after = chains[0]
            .get_balance(&ctx, faucet.address(), "umock")
            .await
            .unwrap();

        assert_eq!(faucet_before - faucet_after, Amount(5_000) + chains[0].static_gas());

        for (chain, user) in chains.iter().zip(users.iter()) {
            assert_eq!(
                chain.get_balance(&ctx, user.address(), "umock").await.unwrap(),
                Amount(5_000)
            );
        }

        broker.supervisor().close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_funding_keeps_created_wallets() {
        let (_runtime, broker) = mock_broker("fund-fail");
        let ctx = Context::background();
        let chains = started_chains(&broker, &["a", "b"]).await;

        let too_much = chains[1].config().faucet_amount + Amount(1);
        let err = get_and_fund_test_users(&ctx, "whale", too_much, &as_dyn(&chains))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FundingMismatch);

        for (chain, prefix) in chains.iter().zip(["whale-a-1-", "whale-b-1-"]) {
            assert!(chain
                .keyring()
                .export()
                .iter()
                .any(|w| w.key_name.starts_with(prefix)));
            assert!(err.to_string().contains(chain.chain_id()));
        }

        broker.supervisor().close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn block_waits_follow_the_slowest_chain() {
        let (_runtime, broker) = mock_broker("blocks");
        let ctx = Context::background();
        let chains = started_chains(&broker, &["a", "b"]).await;

        let before: Vec<u64> = vec![
            chains[0].height(&ctx).await.unwrap(),
            chains[1].height(&ctx).await.unwrap(),
        ];

        wait_for_blocks(&ctx, 3, &as_dyn(&chains)).await.unwrap();

        for (chain, start) in chains.iter().zip(before) {
            assert!(chain.height(&ctx).await.unwrap() >= start + 3);
        }

        chains[1].halt();
        let err = wait_for_blocks(&ctx, 3, &as_dyn(&chains)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HeightStalled);

        let cancelled = Context::background();
        cancelled.cancel();
        let err = wait_for_blocks(&cancelled, 3, &as_dyn(&chains[..1])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        broker.supervisor().close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn balance_changes_are_observed() {
        let (_runtime, broker) = mock_broker("poll");
        let ctx = Context::background();
        let chains = started_chains(&broker, &["a"]).await;
        let chain = chains[0].clone();

        let user = chain.create_key(&ctx, "user").await.unwrap();
        let baseline = WalletAmount::new(user.address(), "umock", Amount::ZERO);

        let err = poll_for_balance_change(&ctx, chain.as_ref(), 3, &baseline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PollTimeout);

        let pusher = chain.clone();
        let address = user.address().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            pusher.credit(&address, "umock", Amount(42));
        });

        let balance = poll_for_balance_change(&ctx, chain.as_ref(), 15, &baseline)
            .await
            .unwrap();
        assert_eq!(balance, Amount(42));

        broker.supervisor().close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_hung_check_ends_at_the_poll_deadline() {
        let ctx = Context::background();
        let started = Instant::now();

        let err = poll_for(&ctx, "stuck query", 5, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(()))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PollTimeout);
        assert!(started.elapsed() <= Duration::from_secs(6));
    }

    #[test_log::test(tokio::test)]
    async fn log_files_close_with_the_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new("logs");

        let sink = create_log_file(&supervisor, dir.path(), "scenario.log").unwrap();
        sink.write_line("started").unwrap();

        supervisor.close().await.unwrap();

        assert!(sink.is_closed());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("scenario.log")).unwrap(),
            "started\n"
        );
    }
}
