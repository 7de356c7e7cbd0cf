//! Ready-to-run retrieval commands for archived collections.

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;

/// Fetch commands for both client platforms.
///
/// Each embeds the store host, the collection path and the ticket id so
/// that data can be retrieved without store credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalScripts {
    pub linux: String,
    pub windows: String,
}

impl RetrievalScripts {
    pub fn render(config: &StoreConfig, collection: &str, ticket: &str) -> Self {
        let host = &config.host;

        let linux = format!(
            "curl -sSfL \"{url}\" | bash -s -- --host \"{host}\" --collection \"{collection}\" --ticket \"{ticket}\"",
            url = config.fetch_script_unix,
        );

        let windows = [
            "$scriptPath = \"$(Get-Location)\\irods_fetch_win.ps1\";".to_string(),
            format!(
                "(Invoke-WebRequest -UseBasicParsing \"{url}\").Content | Out-File $scriptPath -Encoding UTF8;",
                url = config.fetch_script_windows,
            ),
            format!(
                "& powershell -ExecutionPolicy Bypass -File $scriptPath --host {host} --collection \"{collection}\" --ticket \"{ticket}\";"
            ),
            "Remove-Item $scriptPath".to_string(),
        ]
        .join("\n");

        Self { linux, windows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_embed_host_collection_and_ticket() {
        let config = StoreConfig {
            host: "store.example.org".to_string(),
            ..StoreConfig::default()
        };
        let scripts = RetrievalScripts::render(&config, "/zone/home/run1", "tk-42");

        for script in [&scripts.linux, &scripts.windows] {
            assert!(script.contains("store.example.org"));
            assert!(script.contains("\"/zone/home/run1\""));
            assert!(script.contains("\"tk-42\""));
        }
        assert!(scripts.linux.starts_with("curl -sSfL"));
        assert!(scripts.linux.contains(&config.fetch_script_unix));
        assert!(scripts.windows.contains(&config.fetch_script_windows));
        assert_eq!(scripts.windows.lines().count(), 4);
        assert!(scripts.windows.ends_with("Remove-Item $scriptPath"));
    }
}
