use anyhow::Context;
use shelfsync_infra::ReplicationConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shelfsync_observability::init();

    let config = ReplicationConfig::from_env().context("reading replication config")?;
    let node = shelfsync_node::app::Node::build(config).await?;

    node.start().await?;
    tracing::info!(role = %node.role(), "replication node running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    node.stop().await
}
