use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use clap::Parser;

use crate::{server::SseServerConfig, service::Credentials};

/// Command line and environment configuration for the server binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "canvas-mcp-sse", version, about = "Canvas LMS MCP server over SSE")]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "MCP_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Canvas API access token
    #[arg(long, env = "CANVAS_API_TOKEN", hide_env_values = true)]
    pub canvas_api_token: String,

    /// Canvas domain, e.g. `school.instructure.com`
    #[arg(long, env = "CANVAS_DOMAIN")]
    pub canvas_domain: String,

    /// Shared secret clients must send as `Authorization: Bearer <key>`
    #[arg(long, env = "MCP_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Interval between SSE keep-alive comments, in seconds
    #[arg(long, env = "SSE_KEEP_ALIVE_SECS", default_value_t = 15)]
    pub sse_keep_alive_secs: u64,
}

impl Cli {
    pub fn bind(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.canvas_api_token, &self.canvas_domain)
    }

    pub fn into_server_config(self) -> SseServerConfig {
        let mut config = SseServerConfig::new(self.bind(), self.credentials());
        config.sse_keep_alive = Some(Duration::from_secs(self.sse_keep_alive_secs.max(1)));
        // an empty key would make every request fail auth, treat it as unset
        config.api_key = self.api_key.filter(|key| !key.is_empty());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["canvas-mcp-sse"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[
            "--canvas-api-token",
            "tok",
            "--canvas-domain",
            "school.instructure.com",
        ]);
        let config = cli.into_server_config();
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.sse_path, "/sse");
        assert_eq!(config.post_path, "/messages");
        assert_eq!(config.sse_keep_alive, Some(Duration::from_secs(15)));
        assert_eq!(config.credentials.domain, "school.instructure.com");
    }

    #[test]
    fn test_empty_api_key_is_unset() {
        let cli = parse(&[
            "--canvas-api-token",
            "tok",
            "--canvas-domain",
            "d",
            "--api-key",
            "",
            "--port",
            "8080",
        ]);
        let config = cli.into_server_config();
        assert_eq!(config.api_key, None);
        assert_eq!(config.bind.port(), 8080);
    }

    #[test]
    fn test_missing_token_is_rejected() {
        assert!(Cli::try_parse_from(["canvas-mcp-sse", "--canvas-domain", "d"]).is_err());
    }
}
