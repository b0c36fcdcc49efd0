//! Markdown transcript export

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use super::HistoryStore;
use crate::types::{Message, Role};

/// Render `messages` as a Markdown report: an overview, then the timeline
pub fn render_markdown(room: &str, messages: &[Message], generated: DateTime<Utc>) -> String {
    let agents: BTreeSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(|m| m.agent_name.as_deref())
        .collect();
    let tool_results = messages
        .iter()
        .filter(|m| m.metadata.contains_key("tool_call_id"))
        .count();

    let mut out = format!("# Transcript: {room}\n\nGenerated: {}\n\n", generated.format("%Y-%m-%d %H:%M:%S UTC"));
    out.push_str("## Overview\n\n");
    out.push_str(&format!("- **Room:** `{room}`\n"));
    out.push_str(&format!("- **Messages:** {}\n", messages.len()));
    out.push_str(&format!(
        "- **Agents:** {}\n",
        if agents.is_empty() {
            "none".to_string()
        } else {
            agents.iter().map(|a| format!("@{a}")).collect::<Vec<_>>().join(", ")
        }
    ));
    out.push_str(&format!("- **Tool results:** {tool_results}\n\n"));
    out.push_str("## Timeline\n");

    for m in messages {
        let time = m.timestamp.format("%H:%M:%S");
        let content = m.content.trim();
        match m.role {
            Role::System => {
                let label = match &m.agent_name {
                    Some(agent) => format!("@{agent} TOOL"),
                    None => "SYSTEM".to_string(),
                };
                let quoted = content.lines().collect::<Vec<_>>().join("\n> ");
                out.push_str(&format!("\n> **[{time}] {label}**: {quoted}\n"));
            }
            Role::User => out.push_str(&format!("\n### USER ({time})\n{content}\n")),
            Role::Assistant => {
                let author = m.author();
                match &m.model_used {
                    Some(model) => {
                        out.push_str(&format!("\n### @{author} ({time}, {model})\n{content}\n"))
                    }
                    None => out.push_str(&format!("\n### @{author} ({time})\n{content}\n")),
                }
            }
        }
    }
    out
}

/// Write the transcript of `room` into `out_dir` and return the file path
pub async fn export_room(history: &dyn HistoryStore, room: &str, out_dir: &Path) -> Result<PathBuf> {
    let messages = history.load(room).await?;
    let now = Utc::now();
    let path = out_dir.join(format!("TRANSCRIPT_{}_{}.md", room, now.format("%Y%m%d_%H%M%S")));

    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    tokio::fs::write(&path, render_markdown(room, &messages, now))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    info!("Exported {} messages of room '{}' to {}", messages.len(), room, path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistory;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn transcript() -> Vec<Message> {
        let mut intro = Message::system("Room 'dev' opened.");
        intro.timestamp = at(9, 0, 0);
        let mut ask = Message::user("@Coder list the files");
        ask.timestamp = at(9, 0, 5);
        let mut reply = Message::assistant("Coder", "Listing.").with_model("gpt-4o");
        reply.timestamp = at(9, 0, 7);
        let mut result = Message::system("[list_files result]\nsrc/\nCargo.toml")
            .with_agent("Coder")
            .with_metadata("tool_call_id", "c1");
        result.timestamp = at(9, 0, 8);
        vec![intro, ask, reply, result]
    }

    #[test]
    fn test_render_markdown() {
        let out = render_markdown("dev", &transcript(), at(10, 0, 0));
        assert!(out.starts_with("# Transcript: dev\n\nGenerated: 2024-05-01 10:00:00 UTC"));
        assert!(out.contains("- **Messages:** 4\n"));
        assert!(out.contains("- **Agents:** @Coder\n"));
        assert!(out.contains("- **Tool results:** 1\n"));
        assert!(out.contains("\n> **[09:00:00] SYSTEM**: Room 'dev' opened.\n"));
        assert!(out.contains("\n### USER (09:00:05)\n@Coder list the files\n"));
        assert!(out.contains("\n### @Coder (09:00:07, gpt-4o)\nListing.\n"));
        assert!(out.contains("\n> **[09:00:08] @Coder TOOL**: [list_files result]\n> src/\n> Cargo.toml\n"));
    }

    #[test]
    fn test_render_empty_room() {
        let out = render_markdown("empty", &[], at(10, 0, 0));
        assert!(out.contains("- **Agents:** none\n"));
        assert!(out.ends_with("## Timeline\n"));
    }

    #[tokio::test]
    async fn test_export_room_writes_file() {
        let temp = TempDir::new().unwrap();
        let history = InMemoryHistory::new().with_messages("dev", transcript()).await;

        let path = export_room(&history, "dev", &temp.path().join("out")).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("TRANSCRIPT_dev_"));
        assert!(name.ends_with(".md"));
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("- **Messages:** 4\n"));
    }
}
