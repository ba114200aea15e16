/*!
VTun Server - 加密虚拟网络隧道服务端

服务端主要功能：
- 用户认证和虚拟地址分配
- 隧道流量转发
- 用户管理
- Web状态页面
*/

use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::LevelFilter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vtun::{Transport, TunDevice};
use vtun_server::auth::{CredentialStore, FileCredentialStore};
use vtun_server::config::{self, ServerConfig};
use vtun_server::dashboard;
use vtun_server::server::{ServerOptions, TunnelServer};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动服务端
    Run {
        /// 配置目录，包含 config.toml 和 users
        #[arg(short, long)]
        config_dir: PathBuf,

        /// 启用调试日志
        #[arg(short, long, action = clap::ArgAction::SetTrue)]
        debug: bool,

        /// 端口
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// 用户管理
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// 添加用户
    Add {
        #[arg(short, long)]
        config_dir: PathBuf,
        user: String,
        passwd: String,
    },

    /// 列出用户
    List {
        #[arg(short, long)]
        config_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config_dir,
            debug,
            port,
        } => run(&config_dir, debug, port).await,
        Command::User { command } => {
            init_logger(LevelFilter::Info);
            user(command)
        }
    }
}

fn init_logger(level: LevelFilter) {
    let mut logger = Builder::new();
    logger.filter(None, level);
    logger.init();
}

async fn run(
    config_dir: &Path,
    debug: bool,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    // 加载配置
    let mut config: ServerConfig = config::load_config(config::config_path(config_dir))?;
    if let Some(port) = port {
        config.port = port;
    }
    config::validate_config(&config)?;

    // 初始化日志
    init_logger(if debug {
        LevelFilter::Debug
    } else {
        config.level_filter()?
    });

    log::info!("VTun Server {} starting...", vtun::VERSION);
    log::debug!("Config loaded: {:?}", config);

    let local = config.local_net()?;
    let device = open_device(&config.device_name, local).await?;
    log::info!("Virtual device {} started successfully", device.name());

    let bind = SocketAddr::from(([0, 0, 0, 0], config.port));
    let transport = Transport::bind(bind, config.cipher()?).await?;
    let credentials = Arc::new(FileCredentialStore::new(config::users_path(config_dir)));

    let server = TunnelServer::new(
        transport,
        device,
        credentials,
        ServerOptions {
            local,
            ip_range: config.ip_range.clone(),
            heartbeat_timeout: config.heartbeat_timeout(),
        },
    )?;

    // 启动Web服务器
    if config.web.enable {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.web.port));
        tokio::spawn(dashboard::serve(server.clone(), addr));
    }

    tokio::select! {
        result = server.clone().run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received interrupt, stop server");
            server.shutdown().await;
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
async fn open_device(
    name: &str,
    local: ipnet::Ipv4Net,
) -> Result<Arc<dyn TunDevice>, Box<dyn std::error::Error>> {
    let device = vtun::LinuxTun::open(name)?;
    device.configure(local, vtun::DEFAULT_MTU).await?;
    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
async fn open_device(
    _name: &str,
    _local: ipnet::Ipv4Net,
) -> Result<Arc<dyn TunDevice>, Box<dyn std::error::Error>> {
    Err("vtun-server only supports linux".into())
}

fn user(command: UserCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        UserCommand::Add {
            config_dir,
            user,
            passwd,
        } => {
            let store = FileCredentialStore::new(config::users_path(&config_dir));
            store.add(&user, &passwd)?;
            log::info!("User {} added", user);
        }
        UserCommand::List { config_dir } => {
            let store = FileCredentialStore::new(config::users_path(&config_dir));
            for user in store.list()? {
                println!("{}", user);
            }
        }
    }

    Ok(())
}
