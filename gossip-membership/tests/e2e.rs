use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncReadExt, BufReader},
    process::{Child, ChildStderr, Command},
    time::timeout,
};

const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn unicast_group_aborts_startup() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("gossip-node");

    let (mut child, stderr) =
        spawn_node(&binary, &["A", "10.0.0.1", "--group", "10.0.0.1:4446"])?;
    let output = read_all(stderr).await?;
    let status = wait_for_exit(&mut child).await?;

    assert!(!status.success(), "startup should fail, got {status}");
    assert!(
        output.contains("not an IPv4 multicast address"),
        "unexpected stderr: {output}"
    );
    Ok(())
}

#[tokio::test]
async fn zero_interval_is_rejected_before_startup() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("gossip-node");

    let (mut child, stderr) = spawn_node(&binary, &["A", "10.0.0.1", "--interval", "0"])?;
    let output = read_all(stderr).await?;
    let status = wait_for_exit(&mut child).await?;

    assert_eq!(status.code(), Some(2), "clap usage errors exit with 2");
    assert!(output.contains("--interval"), "unexpected stderr: {output}");
    Ok(())
}

#[tokio::test]
async fn help_lists_positional_identity() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("gossip-node");

    let output = Command::new(binary)
        .arg("--help")
        .output()
        .await
        .context("failed to run --help")?;
    let stdout = String::from_utf8(output.stdout)?;

    assert!(output.status.success());
    for expected in ["[NAME]", "[ADDRESS]", "--group", "--interval", "--detect-address"] {
        assert!(stdout.contains(expected), "help is missing {expected}: {stdout}");
    }
    Ok(())
}

fn spawn_node(binary: &Path, args: &[&str]) -> Result<(Child, BufReader<ChildStderr>)> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .env_remove("GOSSIP_NODE_NAME")
        .env_remove("GOSSIP_NODE_ADDRESS")
        .env_remove("GOSSIP_GROUP")
        .env_remove("GOSSIP_INTERVAL_SECS")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn gossip node")?;
    let stderr = child
        .stderr
        .take()
        .context("node stderr missing after spawn")?;

    Ok((child, BufReader::new(stderr)))
}

async fn read_all(mut reader: BufReader<ChildStderr>) -> Result<String> {
    let mut output = String::new();
    timeout(EXIT_TIMEOUT, reader.read_to_string(&mut output))
        .await
        .map_err(|_| anyhow!("timed out reading stderr"))??;
    Ok(output)
}

async fn wait_for_exit(child: &mut Child) -> Result<std::process::ExitStatus> {
    timeout(EXIT_TIMEOUT, child.wait())
        .await
        .map_err(|_| anyhow!("node did not exit"))?
        .context("failed to await node process")
}
