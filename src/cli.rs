/// 命令行定义
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nat-tunnel", version, about = "Self-hosted reverse tunnel")]
pub struct Cli {
    /// 日志详细程度（-v: info, -vv: debug, -vvv: trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 运行隧道服务器
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },

    /// 运行隧道客户端
    Client {
        /// 配置文件路径
        #[arg(short, long, default_value = "client.toml")]
        config: String,
    },

    /// 生成自签名 TLS 证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: String,
        /// 私钥输出路径
        #[arg(long, default_value = "key.pem")]
        key_out: String,
        /// 证书 CN
        #[arg(long, default_value = "localhost")]
        common_name: String,
        /// 附加 SAN 列表
        #[arg(long)]
        alt_names: Vec<String>,
    },

    /// 检查配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
}
