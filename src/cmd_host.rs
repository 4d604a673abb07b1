use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use statushub::clienv;
use statushub::daemon::client::unexpected;
use statushub::daemon::{
    HostClient, HostRuntime, HostServer, MultiplexerClient, MultiplexerEvent, Request, Response,
    SocketConnector,
};
use statushub::extension::{ExtensionIdentity, Reason, StatusPayload};
use statushub::user_config::HostConfig;
use tokio::sync::broadcast::error::RecvError;

use crate::args::Commands;

pub async fn cmd_host(command: Commands) -> Result<()> {
    match command {
        Commands::Run => cmd_run().await,
        Commands::Status => cmd_status().await,
        Commands::List { world_readable } => cmd_list(world_readable).await,
        Commands::Get { identity } => cmd_get(&identity).await,
        Commands::Update { identity, reason } => cmd_update(identity.as_deref(), &reason).await,
        Commands::Watch { identities } => cmd_watch(&identities).await,
        Commands::ScreenOn => accepted(Request::ScreenOn, "Screen-on event delivered").await,
        Commands::PackagesChanged { package } => {
            accepted(Request::PackagesChanged { package }, "Package change delivered").await
        }
        Commands::Shutdown => cmd_shutdown().await,
    }
}

async fn cmd_run() -> Result<()> {
    let config = HostConfig::load()?;
    println!("Running host in foreground (Ctrl+C to stop)");
    println!("  Socket:  {}", clienv::socket_path().display());
    println!("  Plugins: {}", clienv::plugins_dir().display());
    println!();

    let runtime = Arc::new(HostRuntime::from_config(config));
    HostServer::with_default_socket(runtime).run().await
}

async fn cmd_status() -> Result<()> {
    let client = HostClient::default();

    if !client.socket_path().exists() {
        println!("Host: not running");
        println!("Run `statushub run` to start it");
        return Ok(());
    }

    match client.ping().await {
        Ok((uptime, version)) => {
            println!("Host:    running");
            println!("Version: {}", version);
            println!("Uptime:  {}", format_duration(uptime));
            println!("Socket:  {}", client.socket_path().display());

            match client.request(&Request::ListSessions).await? {
                Response::Sessions { list } if !list.is_empty() => {
                    println!();
                    println!("{:<40} {:<14} {}", "EXTENSION", "STATE", "PENDING");
                    for session in list {
                        println!(
                            "{:<40} {:<14} {}",
                            session.identity, session.state, session.pending
                        );
                    }
                }
                Response::Sessions { .. } => println!("\nNo extension sessions"),
                other => return Err(unexpected(other).into()),
            }
        }
        Err(e) => {
            println!("Host: unhealthy (socket exists but not responding)");
            println!("Error: {}", e);
        }
    }
    Ok(())
}

async fn cmd_list(world_readable_only: bool) -> Result<()> {
    let client = HostClient::default();
    let response = client
        .request(&Request::ListExtensions { world_readable_only })
        .await?;
    let Response::Extensions { list, trusted } = response else {
        return Err(unexpected(response).into());
    };

    if list.is_empty() {
        println!("No extensions installed");
        return Ok(());
    }
    for info in &list {
        let mut flags = Vec::new();
        if info.active {
            flags.push("active");
        }
        if !info.compatible {
            flags.push("incompatible");
        }
        if info.world_readable {
            flags.push("world-readable");
        }
        println!("{}  {}  [{}]", info.identity, info.title, flags.join(", "));
    }
    if !trusted {
        println!("\nNot trusted by the host: only world-readable status is visible");
    }
    Ok(())
}

async fn cmd_get(identity: &str) -> Result<()> {
    let identity = ExtensionIdentity::from_str(identity)?;
    let response = HostClient::default()
        .request(&Request::GetStatus {
            identity: identity.to_string(),
        })
        .await?;
    match response {
        Response::Status { status: Some(info) } => println!("{}", describe(&info.into())),
        Response::Status { status: None } => println!("{} is not active", identity),
        other => return Err(unexpected(other).into()),
    }
    Ok(())
}

async fn cmd_update(identity: Option<&str>, reason: &str) -> Result<()> {
    let reason = Reason::from_str(reason)?;
    let identity = identity
        .map(ExtensionIdentity::from_str)
        .transpose()?
        .map(|i| i.to_string());
    let request = Request::UpdateExtensions {
        identity,
        reason: reason.code(),
    };
    accepted(request, "Update dispatched").await
}

async fn cmd_watch(identities: &[String]) -> Result<()> {
    let config = HostConfig::load()?;
    let identities = identities
        .iter()
        .map(|s| ExtensionIdentity::from_str(s))
        .collect::<statushub::Result<Vec<_>>>()?;

    let connector = SocketConnector::new(clienv::socket_path(), &config.multiplexer);
    let client = MultiplexerClient::start(Arc::new(connector), &config.multiplexer);
    let mut events = client.events();
    client.listen_to(identities);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MultiplexerEvent::Bound) => println!("-- connected to host"),
                Ok(MultiplexerEvent::Lost) => println!("-- host connection lost, retrying"),
                Ok(MultiplexerEvent::ExtensionsChanged) => {
                    let count = client.available_extensions(false).len();
                    println!("-- {} extensions available", count);
                }
                Ok(MultiplexerEvent::StatusChanged(identity)) => {
                    if let Some(status) = client.status(&identity) {
                        println!("{}: {}", identity, describe(&status));
                    }
                }
                Err(RecvError::Lagged(missed)) => println!("-- skipped {} events", missed),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.destroy();
    Ok(())
}

async fn cmd_shutdown() -> Result<()> {
    let client = HostClient::default();
    if !client.is_running().await {
        println!("Host is not running");
        return Ok(());
    }

    client.request(&Request::Shutdown).await?;
    for _ in 0..50 {
        if !client.socket_path().exists() {
            println!("Host stopped");
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    println!("Host may still be stopping (check with `statushub status`)");
    Ok(())
}

async fn accepted(request: Request, done: &str) -> Result<()> {
    let response = HostClient::default()
        .request(&request)
        .await
        .context("Host is not reachable")?;
    match response {
        Response::Accepted { accepted: true } | Response::Ok => println!("{}", done),
        Response::Accepted { accepted: false } => println!("Nothing to do"),
        other => return Err(unexpected(other).into()),
    }
    Ok(())
}

fn describe(payload: &StatusPayload) -> String {
    if !payload.visible {
        return "(hidden)".to_string();
    }
    let mut parts = Vec::new();
    if let Some(status) = &payload.status {
        parts.push(status.clone());
    }
    if let Some(title) = &payload.title {
        parts.push(format!("\"{}\"", title));
    }
    if let Some(body) = &payload.body {
        parts.push(body.clone());
    }
    if parts.is_empty() {
        return "(visible)".to_string();
    }
    parts.join(" | ")
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statushub::daemon::StatusInfo;

    #[test]
    fn describes_payloads() {
        assert_eq!(describe(&StatusPayload::hidden()), "(hidden)");
        let payload = StatusPayload::visible("12°").with_title("Sunny");
        assert_eq!(describe(&payload), "12° | \"Sunny\"");
        let info = StatusInfo {
            visible: true,
            ..StatusInfo::default()
        };
        assert_eq!(describe(&info.into()), "(visible)");
    }

    #[test]
    fn formats_uptime() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(3_700), "1h 1m");
        assert_eq!(format_duration(90_000), "1d 1h");
    }
}
