/*!
VTun Server

服务端功能：
- 用户认证和虚拟地址分配
- 端点心跳监控
- 端点之间以及端点和本地设备之间的转发
- 状态页面
*/

pub mod auth;
pub mod config;
pub mod dashboard;
pub mod heartbeat;
pub mod routes;
pub mod server;

pub use auth::{AuthError, CredentialStore, FileCredentialStore};
pub use server::{CloseReason, LoginError, ServerError, ServerOptions, TunnelServer};
