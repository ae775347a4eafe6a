/*!
   A JSON lines database of the blocks observed on each chain during a
   run, for inspecting what happened after the fact.
*/

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::error::{handle_generic_error, Error};
use crate::framework::supervisor::Supervisor;
use crate::util::file::LogSink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub test_name: String,
    pub chain_id: String,
    pub height: u64,
    pub observed_at_ms: u128,
}

/// Open the database file. It is closed when the supervisor closes.
pub fn open_block_database(
    supervisor: &Supervisor,
    path: impl AsRef<Path>,
) -> Result<LogSink, Error> {
    let sink = LogSink::open(path)?;

    let closing = sink.clone();
    supervisor.register(
        format!("close block database {}", sink.path().display()),
        move || async move { closing.close() },
    );

    Ok(sink)
}

/**
   Poll the height of `chain` once per block and append a record for
   every new height. Query failures are logged and retried at the next
   block.
*/
pub fn spawn_block_collector(
    supervisor: &Supervisor,
    sink: LogSink,
    test_name: &str,
    chain: Arc<dyn Chain>,
) {
    let ctx = supervisor.context();
    let test_name = test_name.to_string();
    let name = format!("block collector of {}", chain.chain_id());

    supervisor.spawn_background(name, async move {
        let interval = chain.config().block_time();
        let mut last = 0;

        loop {
            match chain.height(&ctx).await {
                Ok(height) if height > last => {
                    let observed_at_ms = SystemTime::now()
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .map(|d| d.as_millis())
                        .unwrap_or(0);

                    for height in (last + 1)..=height {
                        let record = BlockRecord {
                            test_name: test_name.clone(),
                            chain_id: chain.chain_id().to_string(),
                            height,
                            observed_at_ms,
                        };

                        let line = serde_json::to_string(&record).map_err(handle_generic_error)?;
                        sink.write_line(&line)?;
                    }

                    debug!("recorded chain {} up to height {}", chain.chain_id(), height);
                    last = height;
                }
                Ok(_) => {}
                Err(e) if ctx.is_cancelled() => return Err(e),
                Err(e) => warn!("failed to query height of {}: {}", chain.chain_id(), e),
            }

            ctx.sleep(interval).await?;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::builtin::builtin_config;
    use crate::chain::mock::MockChain;
    use crate::testutil::mock_broker;
    use crate::types::context::Context;
    use core::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn records_every_height() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, broker) = mock_broker("block-db");
        let supervisor = broker.supervisor().clone();
        let ctx = Context::background();

        let mut config = builtin_config("mock").unwrap();
        config.chain_id = "mock-1".to_string();
        let chain = Arc::new(MockChain::new(config));

        let network = broker.setup_network(&ctx).await.unwrap();
        chain.initialize(&ctx, &broker, &network).await.unwrap();
        chain.init_genesis(&ctx, &[]).await.unwrap();
        chain.start(&ctx).await.unwrap();

        let sink = open_block_database(&supervisor, dir.path().join("blocks.jsonl")).unwrap();
        spawn_block_collector(&supervisor, sink.clone(), "block-db", chain.clone());

        tokio::time::sleep(chain.config().block_time() * 4 + Duration::from_millis(1)).await;
        supervisor.close().await.unwrap();

        assert!(sink.is_closed());

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let heights: Vec<u64> = content
            .lines()
            .map(|l| serde_json::from_str::<BlockRecord>(l).unwrap().height)
            .collect();

        assert!(heights.len() >= 4);
        assert!(heights.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(heights[0], 1);
    }
}
