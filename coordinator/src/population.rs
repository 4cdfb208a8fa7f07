use color_eyre::eyre::{eyre, Result, WrapErr};
use color_eyre::Help;
use futures::future::try_join_all;
use futures::SinkExt;
use protocol::connection::{self, Channel};
use protocol::Token;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::config::{Config, NodeDescriptor};
use crate::message::{self, Placement};

/// Creates the schema then loads all nodes concurrently. Any failure here is
/// fatal to the run.
#[instrument(skip_all)]
pub async fn populate(conf: &Config) -> Result<()> {
    create_schema(conf).await?;

    let node_count = conf.nodes.len();
    let loads = conf.nodes.iter().enumerate().map(|(idx, node)| {
        let placement = Placement {
            machine_id: idx,
            node_count,
            user_count: node.user_count,
            user_offset: node.user_offset,
        };
        async move {
            let message = message::load_message(
                &placement,
                &conf.props.common,
                &conf.props.load,
                conf.settings.load_threads,
            )?;
            load_node(node, &message, conf)
                .await
                .wrap_err_with(|| format!("Loading through {} failed", node.label()))
        }
    });
    try_join_all(loads).await?;
    info!("all {node_count} nodes loaded");
    Ok(())
}

async fn create_schema(conf: &Config) -> Result<()> {
    let message = message::schema_message(&conf.props.common, &conf.props.schema)?;
    let mut words = message.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| eyre!("Schema command is empty"))?;
    info!("creating schema: {message}");

    let output = Command::new(program)
        .args(words)
        .kill_on_drop(true)
        .output()
        .await
        .wrap_err("Could not run schema command")
        .with_note(|| format!("command: {message}"))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!("schema: {line}");
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(eyre!("Schema command failed: {}", output.status)).with_note(|| stderr);
    }
    Ok(())
}

#[instrument(skip(message, conf), fields(node = %node.label()))]
async fn load_node(node: &NodeDescriptor, message: &str, conf: &Config) -> Result<()> {
    let stream = conf
        .settings
        .backoff
        .connect((node.address.as_str(), node.port))
        .await
        .wrap_err("Could not reach listener")?;
    let mut channel = Channel::wrap(stream);
    channel.writer.send(message).await?;
    connection::wait_for(&mut channel.reader, Token::LoadingCompleted)
        .await
        .wrap_err("Listener closed before loading completed")?;
    info!("node loaded");
    Ok(())
}
