mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use nat_tunnel::config::AppConfig;
use nat_tunnel::{client, server, tls};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    info!("nat-tunnel v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Server { config } => {
            info!("Loading server configuration from: {}", config);
            let server_config = AppConfig::load_server_config(config)?;

            // 加载 TLS 配置（未配置证书时运行期自动生成自签名）
            let (cert_path, key_path) = ensure_server_certs(&server_config)?;
            let tls_config = tls::load_server_config(&cert_path, &key_path)?;
            let acceptor = TlsAcceptor::from(tls_config);

            server::run_server(server_config, acceptor).await?;
        }
        Commands::Client { config } => {
            info!("Loading client configuration from: {}", config);
            let client_config = AppConfig::load_client_config(config)?;

            let tls_config = tls::load_client_config(
                client_config.client.ca_cert_path.as_deref(),
                client_config.client.skip_verify,
            )?;
            let connector = TlsConnector::from(tls_config);

            client::run_client(client_config, connector).await?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
        Commands::Check { config } => {
            check_config(config)?;
        }
    }

    Ok(())
}

/// Generate self-signed TLS certificate
fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    let mut sans = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !sans.iter().any(|n| n == common_name) {
        sans.push(common_name.to_string());
    }

    tls::generate_self_signed_cert(common_name, &sans, Path::new(cert_out), Path::new(key_out))?;

    println!("Generated self-signed certificate: {}", cert_out);
    println!("Generated private key: {}", key_out);

    Ok(())
}

/// Ensure server TLS certificates are available; generate self-signed certificates at runtime if not configured
fn ensure_server_certs(config: &nat_tunnel::config::ServerConfig) -> Result<(PathBuf, PathBuf)> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Ok((cert.clone(), key.clone())),
        (None, None) => {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let temp_dir = std::env::temp_dir();
            let cert_path = temp_dir.join(format!("nat-tunnel-cert-{}.pem", ts));
            let key_path = temp_dir.join(format!("nat-tunnel-key-{}.pem", ts));

            // 域名与通配子域名进 SAN
            let cn = config.domain.clone();
            let alt = vec![cn.clone(), format!("*.{}", cn)];

            tls::generate_self_signed_cert(&cn, &alt, &cert_path, &key_path)?;

            info!(
                "Generated self-signed server certificate at {:?} and key at {:?}",
                cert_path, key_path
            );

            Ok((cert_path, key_path))
        }
        _ => anyhow::bail!(
            "Both cert_path and key_path must be set, or leave both empty to auto-generate"
        ),
    }
}

/// Check configuration file format
fn check_config(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    println!("Checking configuration file: {}\n", config_path);

    // 尝试作为服务器配置加载
    if let Ok(server_config) = AppConfig::load_server_config(config_path) {
        println!("✓ Configuration type: Server");
        println!("✓ Bind address: {}", server_config.bind_addr);
        println!("✓ Control port: {}", server_config.control_port);
        println!("✓ HTTP port: {}", server_config.http_port);
        println!("✓ Domain: {}", server_config.domain);
        println!("✓ Auth token: {} characters", server_config.auth_token.len());
        println!(
            "✓ TCP port range: {}..{}",
            server_config.tcp_port_min, server_config.tcp_port_max
        );
        match (&server_config.cert_path, &server_config.key_path) {
            (Some(cert), Some(key)) => {
                println!("✓ Certificate path: {:?}", cert);
                println!("✓ Key path: {:?}", key);
                if !cert.exists() {
                    println!("⚠ Warning: Certificate file not found: {:?}", cert);
                }
                if !key.exists() {
                    println!("⚠ Warning: Key file not found: {:?}", key);
                }
            }
            _ => {
                println!("✓ Certificate/Key: will be auto-generated at runtime");
            }
        }

        println!("\n✓ Server configuration is valid!");
        return Ok(());
    }

    // 尝试作为客户端配置加载
    match AppConfig::load_client_config(config_path) {
        Ok(client_config) => {
            println!("✓ Configuration type: Client");
            println!("✓ Server address: {}", client_config.client.server_addr);
            println!("✓ Server port: {}", client_config.client.server_port);
            println!("✓ Skip verify: {}", client_config.client.skip_verify);
            println!("✓ Number of tunnels: {}", client_config.tunnels.len());

            for (idx, tunnel) in client_config.tunnels.iter().enumerate() {
                println!(
                    "  Tunnel #{}: {} -> {}:{} (subdomain: {})",
                    idx + 1,
                    tunnel.tunnel_type,
                    tunnel.local_host,
                    tunnel.local_port,
                    tunnel.subdomain.as_deref().unwrap_or("<auto>"),
                );
            }

            println!("\n✓ Client configuration is valid!");
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed!");
            println!("\nError details:");
            println!("{:#}", e);

            println!("\nCommon issues:");
            println!("  1. Check TOML syntax (brackets, quotes, commas)");
            println!("  2. Ensure all required fields are present");
            println!("  3. For server config: [server] section with auth_token");
            println!("  4. For client config: [client] section plus at least one [[tunnels]] section");

            Err(e).context("Invalid configuration")
        }
    }
}
