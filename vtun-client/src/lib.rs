/*!
VTun Client

客户端功能：
- 登录服务端并获取虚拟地址
- 心跳保活
- 本地虚拟设备和服务端之间的转发
*/

pub mod client;
pub mod config;

pub use client::{ClientError, ClientOptions, ClientState, TunnelClient};
