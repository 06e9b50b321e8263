//! Built-in MCP server profiles.
//!
//! A preset picks the command, arguments and required environment variables
//! for a well-known server. Values use `${VAR}` references resolved at
//! executor init, so tokens stay out of configuration files.

use std::collections::HashMap;

use crate::mcp::types::{McpServerConfig, McpTransportType};

/// Names of all built-in presets.
pub const PRESET_NAMES: &[&str] = &["github", "slack", "notion", "filesystem", "memory"];

/// Look up a preset by name.
pub fn preset(name: &str) -> Option<McpServerConfig> {
    match name {
        "github" => Some(stdio_preset(
            "github",
            &["-y", "@modelcontextprotocol/server-github"],
            &[(
                "GITHUB_PERSONAL_ACCESS_TOKEN",
                "${GITHUB_PERSONAL_ACCESS_TOKEN}",
            )],
        )),
        "slack" => Some(stdio_preset(
            "slack",
            &["-y", "@modelcontextprotocol/server-slack"],
            &[
                ("SLACK_BOT_TOKEN", "${SLACK_BOT_TOKEN}"),
                ("SLACK_TEAM_ID", "${SLACK_TEAM_ID}"),
            ],
        )),
        "notion" => Some(stdio_preset(
            "notion",
            &["-y", "@notionhq/notion-mcp-server"],
            &[("NOTION_API_TOKEN", "${NOTION_API_TOKEN}")],
        )),
        "filesystem" => Some(stdio_preset(
            "filesystem",
            &["-y", "@modelcontextprotocol/server-filesystem", "."],
            &[],
        )),
        "memory" => Some(stdio_preset(
            "memory",
            &["-y", "@modelcontextprotocol/server-memory"],
            &[],
        )),
        _ => None,
    }
}

fn stdio_preset(name: &str, args: &[&str], env: &[(&str, &str)]) -> McpServerConfig {
    McpServerConfig {
        name: name.to_string(),
        transport: McpTransportType::Stdio,
        command: "npx".to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        ..Default::default()
    }
}
