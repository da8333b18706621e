// ⚙️ Server configuration - flags with environment fallbacks

use clap::Parser;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "ledger-server", about = "REST API for the pocket ledger.")]
pub struct ServerConfig {
    /// SQLite database file (":memory:" for a throwaway database)
    #[arg(long, env = "LEDGER_DATABASE", default_value = "ledger.db")]
    pub database: String,

    /// Address to listen on
    #[arg(long, env = "LEDGER_BIND", default_value = "127.0.0.1:8000")]
    pub bind: String,

    /// Allowed CORS origin; "*" allows any
    #[arg(long = "cors-origin", env = "LEDGER_CORS_ORIGIN", default_value = "http://localhost:3000")]
    pub cors_origin: String,

    /// Largest accepted import upload
    #[arg(long = "max-upload-bytes", env = "LEDGER_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.cors_origin.trim() == "*"
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            database: "ledger.db".to_string(),
            bind: "127.0.0.1:8000".to_string(),
            cors_origin: "http://localhost:3000".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let config = ServerConfig::try_parse_from([
            "ledger-server",
            "--database",
            ":memory:",
            "--bind",
            "0.0.0.0:9000",
            "--cors-origin",
            "*",
            "--max-upload-bytes",
            "1024",
        ])
        .unwrap();

        assert_eq!(config.database, ":memory:");
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert!(config.allows_any_origin());
        assert_eq!(config.max_upload_bytes, 1024);
    }

    #[test]
    fn test_default_origin_is_not_wildcard() {
        assert!(!ServerConfig::default().allows_any_origin());
    }
}
