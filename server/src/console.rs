//! Line-based operator console on stdin

use crate::client_manager::ClientManager;
use crate::metadata::Metadata;
use log::{error, info};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;

/// A console command that could not be carried out
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("{0} needs an argument")]
    MissingArgument(&'static str),

    #[error("no cached uuid for {0}")]
    UnknownName(String),

    #[error("{0}")]
    Failed(String),
}

/// Runs one console line and returns the text to print
pub async fn handle_command(
    line: &str,
    metadata: &Metadata,
    clients: &RwLock<ClientManager>,
) -> Result<String, CommandError> {
    let line = line.trim();
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };
    let command = command.to_lowercase();

    let require = |name: &'static str| {
        if argument.is_empty() {
            Err(CommandError::MissingArgument(name))
        } else {
            Ok(argument)
        }
    };

    match command.as_str() {
        "ping" => Ok("pong".to_string()),

        "list" => {
            let clients = clients.read().await;
            let mut lines = vec![format!(
                "{} connected, {} authenticated",
                clients.len(),
                clients.authenticated_count()
            )];
            for client in clients.list() {
                lines.push(match client.identity {
                    Some(identity) => format!(
                        "  {} {} {} ({})",
                        client.id, client.addr, identity.name, identity.uuid
                    ),
                    None => format!("  {} {} (authenticating)", client.id, client.addr),
                });
            }
            Ok(lines.join("\n"))
        }

        "whitelist_load" => {
            let count = metadata
                .whitelist_load()
                .await
                .map_err(|e| CommandError::Failed(e.to_string()))?;
            Ok(format!("loaded {} entries", count))
        }

        "whitelist_save" => {
            metadata
                .whitelist_save()
                .await
                .map_err(|e| CommandError::Failed(e.to_string()))?;
            Ok("saved".to_string())
        }

        "whitelist_add" => {
            let uuid = require("whitelist_add")?;
            metadata.whitelist_add(uuid).await;
            Ok(format!("added {}", uuid))
        }

        "whitelist_add_ign" => {
            let name = require("whitelist_add_ign")?;
            let uuid = metadata
                .lookup_uuid(name)
                .await
                .ok_or_else(|| CommandError::UnknownName(name.to_string()))?;
            metadata.whitelist_add(&uuid).await;
            Ok(format!("added {} ({})", name, uuid))
        }

        "whitelist_remove" => {
            let uuid = require("whitelist_remove")?;
            metadata.whitelist_remove(uuid).await;
            Ok(format!("removed {}", uuid))
        }

        "whitelist_remove_ign" => {
            let name = require("whitelist_remove_ign")?;
            let uuid = metadata
                .lookup_uuid(name)
                .await
                .ok_or_else(|| CommandError::UnknownName(name.to_string()))?;
            metadata.whitelist_remove(&uuid).await;
            Ok(format!("removed {} ({})", name, uuid))
        }

        _ => Err(CommandError::UnknownCommand(command.clone())),
    }
}

/// Reads commands from stdin until it closes
pub async fn run_console(metadata: Arc<Metadata>, clients: Arc<RwLock<ClientManager>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match handle_command(&line, &metadata, &clients).await {
                Ok(output) => println!("{}", output),
                Err(e) => error!("Command failed: {}", e),
            },
            Ok(None) => {
                info!("Console input closed");
                return;
            }
            Err(e) => {
                error!("Failed to read console input: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::VerifiedIdentity;
    use crate::client_manager::relay_channel;
    use crate::metadata::IdentityCache;

    async fn setup() -> (tempfile::TempDir, Metadata, RwLock<ClientManager>) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Metadata::load(dir.path()).await.unwrap();
        (dir, metadata, RwLock::new(ClientManager::new()))
    }

    #[tokio::test]
    async fn test_ping() {
        let (_dir, metadata, clients) = setup().await;
        assert_eq!(handle_command("ping", &metadata, &clients).await.unwrap(), "pong");
        assert_eq!(handle_command("  PING ", &metadata, &clients).await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (_dir, metadata, clients) = setup().await;
        assert_eq!(
            handle_command("frobnicate now", &metadata, &clients).await,
            Err(CommandError::UnknownCommand("frobnicate".to_string()))
        );
    }

    #[tokio::test]
    async fn test_whitelist_add_and_remove() {
        let (_dir, metadata, clients) = setup().await;

        handle_command("whitelist_add 1234", &metadata, &clients).await.unwrap();
        assert!(metadata.whitelist_contains("1234").await);

        handle_command("whitelist_remove 1234", &metadata, &clients).await.unwrap();
        assert!(!metadata.whitelist_contains("1234").await);

        assert_eq!(
            handle_command("whitelist_add", &metadata, &clients).await,
            Err(CommandError::MissingArgument("whitelist_add"))
        );
    }

    #[tokio::test]
    async fn test_whitelist_by_name_uses_uuid_cache() {
        let (_dir, metadata, clients) = setup().await;
        metadata
            .remember(&VerifiedIdentity {
                uuid: "abcd".to_string(),
                name: "Gjum".to_string(),
            })
            .await;

        handle_command("whitelist_add_ign Gjum", &metadata, &clients).await.unwrap();
        assert!(metadata.whitelist_contains("abcd").await);

        handle_command("whitelist_remove_ign Gjum", &metadata, &clients).await.unwrap();
        assert!(!metadata.whitelist_contains("abcd").await);

        assert_eq!(
            handle_command("whitelist_add_ign Nobody", &metadata, &clients).await,
            Err(CommandError::UnknownName("Nobody".to_string()))
        );
    }

    #[tokio::test]
    async fn test_whitelist_save_then_load() {
        let (_dir, metadata, clients) = setup().await;

        handle_command("whitelist_add 1111", &metadata, &clients).await.unwrap();
        handle_command("whitelist_save", &metadata, &clients).await.unwrap();
        handle_command("whitelist_add 2222", &metadata, &clients).await.unwrap();

        let output = handle_command("whitelist_load", &metadata, &clients).await.unwrap();
        assert_eq!(output, "loaded 1 entries");
        assert!(metadata.whitelist_contains("1111").await);
        assert!(!metadata.whitelist_contains("2222").await);
    }

    #[tokio::test]
    async fn test_list_shows_identities() {
        let (_dir, metadata, clients) = setup().await;
        let (tx, _rx) = relay_channel();
        {
            let mut manager = clients.write().await;
            let id = manager.add_client("127.0.0.1:5000".parse().unwrap(), tx.clone());
            manager.add_client("127.0.0.1:5001".parse().unwrap(), tx);
            manager.mark_authenticated(
                id,
                VerifiedIdentity {
                    uuid: "abcd".to_string(),
                    name: "Gjum".to_string(),
                },
            );
        }

        let output = handle_command("list", &metadata, &clients).await.unwrap();
        assert!(output.starts_with("2 connected, 1 authenticated"));
        assert!(output.contains("Gjum (abcd)"));
        assert!(output.contains("(authenticating)"));
    }
}
