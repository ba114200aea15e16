/*!
VTun Client - 加密虚拟网络隧道客户端

客户端主要功能：
- 登录服务端
- 创建本地虚拟设备
- 转发隧道流量
*/

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use vtun::TunDevice;
use vtun_client::config::{self, ClientConfig};
use vtun_client::TunnelClient;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtun-client.toml")]
    config: PathBuf,

    /// 启用调试日志
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 解析命令行参数
    let args = Args::parse();

    // 加载配置
    let config: ClientConfig = config::load_config(&args.config)?;
    config::validate_config(&config)?;

    // 初始化日志
    let mut logger = Builder::new();
    logger.filter(
        None,
        if args.debug {
            LevelFilter::Debug
        } else {
            config.level_filter()?
        },
    );
    logger.init();

    log::info!("VTun Client {} starting...", vtun::VERSION);

    let target = config.target_addr().await?;
    let client = TunnelClient::connect(target, config.cipher()?, config.options()?).await?;
    log::info!("Connecting to {} from {}", target, client.local_addr()?);

    if let Err(e) = serve(&client, &config).await {
        log::error!("Client stopped: {}", e);
        return Err(e);
    }

    Ok(())
}

/// 登录并转发，直到服务端关闭、出错或收到中断
async fn serve(client: &TunnelClient, config: &ClientConfig) -> Result<(), Box<dyn Error>> {
    let lease = client.handshake().await?;

    let device = client
        .attach_device(lease, |lease| open_device(&config.device_name, lease))
        .await?;

    tokio::select! {
        result = client.run(device) => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received interrupt, stop client");
            client.close().await?;
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
async fn open_device(name: &str, lease: ipnet::Ipv4Net) -> io::Result<Arc<dyn TunDevice>> {
    let device = vtun::LinuxTun::open(name)?;
    device.configure(lease, vtun::DEFAULT_MTU).await?;
    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
async fn open_device(_name: &str, _lease: ipnet::Ipv4Net) -> io::Result<Arc<dyn TunDevice>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "vtun-client only supports linux",
    ))
}
